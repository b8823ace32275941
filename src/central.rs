//! Per-class central free lists.
//!
//! Each list owns the spans of one size class. Objects move in and out in
//! batches; whole batches can park in a small transfer cache without touching
//! any span. The class lock is never held while calling into the page heap:
//! new spans are fetched and carved with the lock dropped, and spans that
//! became empty are handed back after it is released.

use core::{mem, ptr::NonNull};

use crate::{
  error::AllocError,
  span::{Batch, FreeObject, Span, SpanList, SpanState},
  sync::{SpinLock, SpinMutex},
};

/// Upper bound on parked batches per class.
pub const MAX_TRANSFER_SLOTS: usize = 16;

/// Parked bytes per class are capped near this.
const TRANSFER_CACHE_BYTES: usize = 1 << 20;

/// What a central list needs from the page heap.
pub(crate) trait SpanSource {
  /// A span of `pages` pages, in state `InUseSmall(class)` with every page
  /// registered in the page map.
  fn acquire_small(&self, class: usize, pages: usize) -> Result<NonNull<Span>, AllocError>;

  /// Gives back a span whose objects are all free.
  ///
  /// # Safety
  /// No object of the span is in use or on any list.
  unsafe fn release_small(&self, span: NonNull<Span>);

  /// The span owning `obj`, or null.
  fn span_of(&self, obj: NonNull<u8>) -> *mut Span;

  /// Fully free spans a class keeps instead of returning them.
  fn retained_empty_spans(&self) -> usize;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CentralStats {
  pub class: usize,
  pub object_size: usize,
  /// Objects ever carved out of spans.
  pub carved_objects: usize,
  /// Objects whose spans went back to the page heap.
  pub released_objects: usize,
  /// Free objects sitting in this class's spans.
  pub free_objects: usize,
  /// Free objects parked in the transfer cache.
  pub transfer_objects: usize,
  /// Spans currently owned by this class.
  pub spans: usize,
}

struct CentralInner {
  class: usize,
  size: usize,
  pages: usize,
  batch: usize,
  objects_per_span: usize,
  /// Spans with free objects and objects in use.
  nonempty: SpanList,
  /// Spans with every object in use.
  full: SpanList,
  /// Spans with every object free, kept for reuse.
  empty: SpanList,
  slots: [Batch; MAX_TRANSFER_SLOTS],
  used_slots: usize,
  slot_cap: usize,
  free_objects: usize,
  carved: usize,
  released: usize,
  spans: usize,
}

unsafe impl Send for CentralInner {}

pub struct CentralFreeList {
  inner: SpinMutex<CentralInner>,
}

impl CentralFreeList {
  pub const fn new() -> Self {
    Self {
      inner: SpinMutex::new(CentralInner {
        class: 0,
        size: 0,
        pages: 0,
        batch: 0,
        objects_per_span: 0,
        nonempty: SpanList::new(),
        full: SpanList::new(),
        empty: SpanList::new(),
        slots: [const { Batch::new() }; MAX_TRANSFER_SLOTS],
        used_slots: 0,
        slot_cap: 0,
        free_objects: 0,
        carved: 0,
        released: 0,
        spans: 0,
      }),
    }
  }

  pub fn init(&self, class: usize, size: usize, pages: usize, batch: usize, objects_per_span: usize) {
    let mut inner = self.inner.lock();
    inner.class = class;
    inner.size = size;
    inner.pages = pages;
    inner.batch = batch;
    inner.objects_per_span = objects_per_span;
    inner.slot_cap = if size == 0 || batch == 0 {
      0
    } else {
      (TRANSFER_CACHE_BYTES / (size * batch)).clamp(1, MAX_TRANSFER_SLOTS)
    };
  }

  /// Up to `n` objects, at least one.
  pub(crate) fn remove_range<S: SpanSource + ?Sized>(
    &self,
    src: &S,
    n: usize,
  ) -> Result<Batch, AllocError> {
    loop {
      let (class, pages, size, objects) = {
        let mut inner = self.inner.lock();
        if n == inner.batch
          && let Some(batch) = inner.take_transfer()
        {
          return Ok(batch);
        }
        let batch = inner.fetch(n);
        if !batch.is_empty() {
          return Ok(batch);
        }
        if let Some(batch) = inner.take_transfer() {
          return Ok(batch);
        }
        (inner.class, inner.pages, inner.size, inner.objects_per_span)
      };

      let span = src.acquire_small(class, pages)?;
      unsafe { carve(span.as_ptr(), size, objects) };

      let mut inner = self.inner.lock();
      inner.adopt(span.as_ptr());
      let batch = inner.fetch(n);
      if !batch.is_empty() {
        return Ok(batch);
      }
    }
  }

  /// Returns objects of this class.
  pub(crate) fn insert_range<S: SpanSource + ?Sized>(&self, src: &S, batch: Batch) {
    if batch.is_empty() {
      return;
    }
    let mut release = SpanList::new();
    let retain = src.retained_empty_spans();
    {
      let mut inner = self.inner.lock();
      // Without retention every emptied span must reach the page heap, so
      // objects go back to their spans instead of parking.
      if retain > 0 && batch.len() == inner.batch && inner.used_slots < inner.slot_cap {
        let slot = inner.used_slots;
        inner.slots[slot] = batch;
        inner.used_slots += 1;
        return;
      }
      inner.return_objects(src, batch, retain, &mut release);
    }
    release_spans(src, &mut release);
  }

  /// Empties the transfer cache into the spans and gives back every span
  /// with no object in use. Returns the number of spans given back.
  pub(crate) fn release_free<S: SpanSource + ?Sized>(&self, src: &S) -> usize {
    let mut release = SpanList::new();
    {
      let mut inner = self.inner.lock();
      while let Some(batch) = inner.take_transfer() {
        inner.return_objects(src, batch, 0, &mut release);
      }
      while let Some(span) = inner.empty.pop() {
        inner.retire(span.as_ptr(), &mut release);
      }
    }
    let released = release.len();
    release_spans(src, &mut release);
    released
  }

  pub fn stats(&self) -> CentralStats {
    let inner = self.inner.lock();
    CentralStats {
      class: inner.class,
      object_size: inner.size,
      carved_objects: inner.carved,
      released_objects: inner.released,
      free_objects: inner.free_objects,
      transfer_objects: inner.slots[..inner.used_slots]
        .iter()
        .map(Batch::len)
        .sum(),
      spans: inner.spans,
    }
  }

  pub(crate) fn raw_lock(&self) -> &SpinLock {
    self.inner.raw()
  }
}

impl Default for CentralFreeList {
  fn default() -> Self {
    Self::new()
  }
}

impl CentralInner {
  fn take_transfer(&mut self) -> Option<Batch> {
    if self.used_slots == 0 {
      return None;
    }
    self.used_slots -= 1;
    Some(mem::take(&mut self.slots[self.used_slots]))
  }

  fn adopt(&mut self, span: *mut Span) {
    self.spans += 1;
    self.carved += self.objects_per_span;
    self.free_objects += self.objects_per_span;
    unsafe { self.nonempty.push(span) };
  }

  fn fetch(&mut self, n: usize) -> Batch {
    let mut batch = Batch::new();
    while batch.len() < n {
      let span = if !self.nonempty.is_empty() {
        self.nonempty.first()
      } else if let Some(span) = self.empty.pop() {
        unsafe { self.nonempty.push(span.as_ptr()) };
        span.as_ptr()
      } else {
        break;
      };

      unsafe {
        let s = &mut *span;
        while batch.len() < n {
          let Some(obj) = NonNull::new(s.objects) else {
            break;
          };
          s.objects = (*obj.as_ptr()).next;
          s.refcount += 1;
          self.free_objects -= 1;
          batch.push(obj.cast());
        }
        if s.objects.is_null() {
          self.nonempty.remove(span);
          self.full.push(span);
        }
      }
    }
    batch
  }

  fn return_objects<S: SpanSource + ?Sized>(
    &mut self,
    src: &S,
    mut batch: Batch,
    retain: usize,
    release: &mut SpanList,
  ) {
    let class = self.class as u8;
    while let Some(obj) = batch.pop() {
      let span = src.span_of(obj);
      check!(!span.is_null(), "free of {:p}, which the heap does not own", obj);
      unsafe {
        let s = &mut *span;
        check!(
          s.state == SpanState::InUseSmall(class),
          "object {:p} returned to class {} but its span is {}",
          obj,
          class,
          s.state.name()
        );
        let offset = obj.as_ptr() as usize - s.start_addr();
        check!(
          offset % self.size == 0 && offset / self.size < self.objects_per_span,
          "free of {:p}, which is not the start of an object",
          obj
        );
        check!(s.refcount > 0, "double free of {:p}", obj);

        let was_full = s.objects.is_null();
        let node = obj.as_ptr() as *mut FreeObject;
        (*node).next = s.objects;
        s.objects = node;
        s.refcount -= 1;
        self.free_objects += 1;

        if s.refcount == 0 {
          if was_full {
            self.full.remove(span);
          } else {
            self.nonempty.remove(span);
          }
          if self.empty.len() < retain {
            self.empty.push(span);
          } else {
            self.retire(span, release);
          }
        } else if was_full {
          self.full.remove(span);
          self.nonempty.push(span);
        }
      }
    }
  }

  /// Moves an unlisted, fully free span onto `release`.
  fn retire(&mut self, span: *mut Span, release: &mut SpanList) {
    self.spans -= 1;
    self.free_objects -= self.objects_per_span;
    self.released += self.objects_per_span;
    unsafe { release.push(span) };
  }
}

/// Threads a fresh span's memory into a list of `count` objects.
unsafe fn carve(span: *mut Span, size: usize, count: usize) {
  unsafe {
    let base = (*span).start_addr();
    let mut head: *mut FreeObject = core::ptr::null_mut();
    for i in (0..count).rev() {
      let obj = (base + i * size) as *mut FreeObject;
      (*obj).next = head;
      head = obj;
    }
    (*span).objects = head;
    (*span).refcount = 0;
  }
}

fn release_spans<S: SpanSource + ?Sized>(src: &S, release: &mut SpanList) {
  while let Some(span) = release.pop() {
    unsafe { src.release_small(span) };
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{PAGE_SHIFT, PAGE_SIZE};
  use std::{
    alloc::{Layout, alloc_zeroed, dealloc},
    cell::{Cell, RefCell},
  };

  const SIZE: usize = 64;
  const BATCH: usize = 32;
  const OBJECTS: usize = PAGE_SIZE / SIZE;

  struct Pages {
    spans: RefCell<Vec<*mut Span>>,
    released: Cell<usize>,
    retain: usize,
  }

  impl Pages {
    fn new(retain: usize) -> Self {
      Self {
        spans: RefCell::new(Vec::new()),
        released: Cell::new(0),
        retain,
      }
    }
  }

  impl Drop for Pages {
    fn drop(&mut self) {
      for &span in self.spans.borrow().iter() {
        unsafe {
          let span = Box::from_raw(span);
          let layout = Layout::from_size_align(span.bytes(), PAGE_SIZE).unwrap();
          dealloc(span.start_addr() as *mut u8, layout);
        }
      }
    }
  }

  impl SpanSource for Pages {
    fn acquire_small(&self, class: usize, pages: usize) -> Result<NonNull<Span>, AllocError> {
      let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
      let base = unsafe { alloc_zeroed(layout) } as usize;
      let span = Box::into_raw(Box::new(Span::new(
        base >> PAGE_SHIFT,
        pages,
        SpanState::InUseSmall(class as u8),
      )));
      self.spans.borrow_mut().push(span);
      Ok(NonNull::new(span).unwrap())
    }

    unsafe fn release_small(&self, span: NonNull<Span>) {
      unsafe { (*span.as_ptr()).state = SpanState::FreeNormal };
      self.released.set(self.released.get() + 1);
    }

    fn span_of(&self, obj: NonNull<u8>) -> *mut Span {
      let page = obj.as_ptr() as usize >> PAGE_SHIFT;
      self
        .spans
        .borrow()
        .iter()
        .copied()
        .find(|&s| unsafe { (*s).contains(page) })
        .unwrap_or(core::ptr::null_mut())
    }

    fn retained_empty_spans(&self) -> usize {
      self.retain
    }
  }

  fn list() -> CentralFreeList {
    let list = CentralFreeList::new();
    list.init(5, SIZE, 1, BATCH, OBJECTS);
    list
  }

  fn conserved(stats: &CentralStats, outstanding: usize) {
    assert_eq!(
      stats.free_objects + stats.transfer_objects + outstanding,
      stats.carved_objects - stats.released_objects
    );
  }

  #[test]
  fn serves_batches_from_one_span() {
    let pages = Pages::new(1);
    let list = list();
    let batch = list.remove_range(&pages, 10).unwrap();
    assert_eq!(batch.len(), 10);
    let stats = list.stats();
    assert_eq!(stats.spans, 1);
    assert_eq!(stats.carved_objects, OBJECTS);
    conserved(&stats, 10);

    list.insert_range(&pages, batch);
    let stats = list.stats();
    conserved(&stats, 0);
    // The only span is fully free but retained.
    assert_eq!(stats.spans, 1);
    assert_eq!(pages.released.get(), 0);
  }

  #[test]
  fn whole_batches_park_in_the_transfer_cache() {
    let pages = Pages::new(1);
    let list = list();
    let batch = list.remove_range(&pages, BATCH).unwrap();
    let first = list.stats().free_objects;
    list.insert_range(&pages, batch);
    let stats = list.stats();
    assert_eq!(stats.transfer_objects, BATCH);
    assert_eq!(stats.free_objects, first);

    let again = list.remove_range(&pages, BATCH).unwrap();
    assert_eq!(again.len(), BATCH);
    assert_eq!(list.stats().transfer_objects, 0);
    assert_eq!(list.stats().free_objects, first);
    list.insert_range(&pages, again);
  }

  #[test]
  fn whole_batches_skip_the_transfer_cache_without_retention() {
    let pages = Pages::new(0);
    let list = list();
    let batch = list.remove_range(&pages, BATCH).unwrap();
    list.insert_range(&pages, batch);
    let stats = list.stats();
    assert_eq!(stats.transfer_objects, 0);
    assert_eq!(stats.spans, 0);
    assert_eq!(pages.released.get(), 1);
    conserved(&stats, 0);
  }

  #[test]
  fn empty_spans_beyond_retention_go_back() {
    let pages = Pages::new(0);
    let list = list();
    let mut batch = list.remove_range(&pages, 1).unwrap();
    let obj = batch.pop().unwrap();
    let mut back = Batch::new();
    unsafe { back.push(obj) };
    list.insert_range(&pages, back);
    assert_eq!(pages.released.get(), 1);
    let stats = list.stats();
    assert_eq!(stats.spans, 0);
    assert_eq!(stats.released_objects, OBJECTS);
    conserved(&stats, 0);
  }

  #[test]
  fn full_spans_rejoin_when_objects_return() {
    let pages = Pages::new(1);
    let list = list();
    let mut all = Batch::new();
    while all.len() < OBJECTS + 5 {
      let mut b = list.remove_range(&pages, BATCH).unwrap();
      while let Some(obj) = b.pop() {
        unsafe { all.push(obj) };
      }
    }
    assert_eq!(list.stats().spans, 2);
    conserved(&list.stats(), all.len());

    list.insert_range(&pages, all.split_front(3));
    conserved(&list.stats(), all.len());
    list.insert_range(&pages, all);
    let stats = list.stats();
    conserved(&stats, 0);
    // One fully free span is kept, the other goes back.
    assert_eq!(stats.spans, 1);
    assert_eq!(pages.released.get(), 1);
  }

  #[test]
  fn release_free_empties_everything() {
    let pages = Pages::new(1);
    let list = list();
    let batch = list.remove_range(&pages, BATCH).unwrap();
    list.insert_range(&pages, batch);
    assert_eq!(list.stats().transfer_objects, BATCH);
    assert_eq!(list.release_free(&pages), 1);
    let stats = list.stats();
    assert_eq!(stats.spans, 0);
    assert_eq!(stats.transfer_objects, 0);
    conserved(&stats, 0);
  }
}
