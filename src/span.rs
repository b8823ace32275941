//! Spans, the intrusive lists that hold them, and object batches.

use core::ptr::{NonNull, null_mut};

use crate::{PAGE_SHIFT, PAGE_SIZE};

pub type PageId = usize;

/// A free object. The link lives in the object's own first word.
#[repr(C)]
pub struct FreeObject {
  pub next: *mut FreeObject,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SpanState {
  FreeNormal,
  FreeDecommitted,
  InUseLarge,
  InUseSmall(u8),
}

impl SpanState {
  #[inline]
  pub fn is_free(self) -> bool {
    matches!(self, SpanState::FreeNormal | SpanState::FreeDecommitted)
  }

  pub fn name(self) -> &'static str {
    match self {
      SpanState::FreeNormal => "free",
      SpanState::FreeDecommitted => "decommitted",
      SpanState::InUseLarge => "large",
      SpanState::InUseSmall(_) => "small",
    }
  }
}

/// A run of contiguous pages.
pub struct Span {
  pub start: PageId,
  pub length: usize,
  pub next: *mut Span,
  pub prev: *mut Span,
  /// Free objects carved from this span (small spans only).
  pub objects: *mut FreeObject,
  /// Objects checked out of this span.
  pub refcount: usize,
  pub state: SpanState,
  pub sampled: bool,
  /// Stack-trace record of a sampled allocation.
  pub trace: *mut crate::stack_trace::TraceRecord,
  /// Registry node of a sampled allocation, 0 when unregistered.
  pub sample_node: u32,
}

impl Span {
  pub const fn new(start: PageId, length: usize, state: SpanState) -> Self {
    Self {
      start,
      length,
      next: null_mut(),
      prev: null_mut(),
      objects: null_mut(),
      refcount: 0,
      state,
      sampled: false,
      trace: null_mut(),
      sample_node: 0,
    }
  }

  #[inline]
  pub fn start_addr(&self) -> usize {
    self.start << PAGE_SHIFT
  }

  #[inline]
  pub fn end_page(&self) -> PageId {
    self.start + self.length
  }

  #[inline]
  pub fn bytes(&self) -> usize {
    self.length * PAGE_SIZE
  }

  #[inline]
  pub fn contains(&self, page: PageId) -> bool {
    page >= self.start && page < self.end_page()
  }
}

/// Intrusive doubly linked list through `Span::next`/`Span::prev`.
pub struct SpanList {
  head: *mut Span,
  tail: *mut Span,
  len: usize,
}

unsafe impl Send for SpanList {}

impl SpanList {
  pub const fn new() -> Self {
    Self {
      head: null_mut(),
      tail: null_mut(),
      len: 0,
    }
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.head.is_null()
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub fn first(&self) -> *mut Span {
    self.head
  }

  #[inline]
  pub fn last(&self) -> *mut Span {
    self.tail
  }

  /// # Safety
  /// `span` is valid and on no list.
  pub unsafe fn push(&mut self, span: *mut Span) {
    unsafe {
      (*span).prev = null_mut();
      (*span).next = self.head;
      if self.head.is_null() {
        self.tail = span;
      } else {
        (*self.head).prev = span;
      }
    }
    self.head = span;
    self.len += 1;
  }

  /// # Safety
  /// `span` is on this list.
  pub unsafe fn remove(&mut self, span: *mut Span) {
    unsafe {
      let (prev, next) = ((*span).prev, (*span).next);
      if prev.is_null() {
        self.head = next;
      } else {
        (*prev).next = next;
      }
      if next.is_null() {
        self.tail = prev;
      } else {
        (*next).prev = prev;
      }
      (*span).next = null_mut();
      (*span).prev = null_mut();
    }
    self.len -= 1;
  }

  pub fn pop(&mut self) -> Option<NonNull<Span>> {
    let span = NonNull::new(self.head)?;
    unsafe { self.remove(span.as_ptr()) };
    Some(span)
  }

  /// Walks the list. The list must not change while the iterator lives.
  pub fn iter(&self) -> SpanIter<'_> {
    SpanIter {
      cur: self.head,
      _list: self,
    }
  }
}

impl Default for SpanList {
  fn default() -> Self {
    Self::new()
  }
}

pub struct SpanIter<'a> {
  cur: *mut Span,
  _list: &'a SpanList,
}

impl Iterator for SpanIter<'_> {
  type Item = *mut Span;

  fn next(&mut self) -> Option<*mut Span> {
    if self.cur.is_null() {
      return None;
    }
    let span = self.cur;
    self.cur = unsafe { (*span).next };
    Some(span)
  }
}

/// A singly linked run of free objects moved between tiers as a unit.
pub struct Batch {
  head: *mut FreeObject,
  tail: *mut FreeObject,
  len: usize,
}

unsafe impl Send for Batch {}

impl Batch {
  pub const fn new() -> Self {
    Self {
      head: null_mut(),
      tail: null_mut(),
      len: 0,
    }
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  /// # Safety
  /// `obj` points to at least a word of writable memory not on any list.
  #[inline]
  pub unsafe fn push(&mut self, obj: NonNull<u8>) {
    let obj = obj.as_ptr() as *mut FreeObject;
    unsafe { (*obj).next = self.head };
    if self.head.is_null() {
      self.tail = obj;
    }
    self.head = obj;
    self.len += 1;
  }

  #[inline]
  pub fn pop(&mut self) -> Option<NonNull<u8>> {
    let obj = NonNull::new(self.head)?;
    self.head = unsafe { (*obj.as_ptr()).next };
    if self.head.is_null() {
      self.tail = null_mut();
    }
    self.len -= 1;
    Some(obj.cast())
  }

  /// Detaches up to `n` objects from the front.
  pub fn split_front(&mut self, n: usize) -> Batch {
    let mut front = Batch::new();
    while front.len < n {
      let Some(obj) = self.pop() else { break };
      unsafe { front.push_back(obj) };
    }
    front
  }

  unsafe fn push_back(&mut self, obj: NonNull<u8>) {
    let obj = obj.as_ptr() as *mut FreeObject;
    unsafe { (*obj).next = null_mut() };
    if self.tail.is_null() {
      self.head = obj;
    } else {
      unsafe { (*self.tail).next = obj };
    }
    self.tail = obj;
    self.len += 1;
  }

  /// Splices the whole batch in front of `list` and returns the new head.
  ///
  /// # Safety
  /// `list` is a valid null-terminated object list.
  pub unsafe fn prepend_to(self, list: *mut FreeObject) -> *mut FreeObject {
    if self.head.is_null() {
      return list;
    }
    unsafe { (*self.tail).next = list };
    self.head
  }
}

impl Default for Batch {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn list_push_remove_keeps_links() {
    let mut spans: Vec<Span> = (0..3).map(|i| Span::new(i, 1, SpanState::FreeNormal)).collect();
    let ptrs: Vec<*mut Span> = spans.iter_mut().map(|s| s as *mut Span).collect();
    let mut list = SpanList::new();
    for &p in &ptrs {
      unsafe { list.push(p) };
    }
    assert_eq!(list.len(), 3);
    assert_eq!(list.first(), ptrs[2]);
    assert_eq!(list.last(), ptrs[0]);

    unsafe { list.remove(ptrs[1]) };
    let order: Vec<_> = list.iter().collect();
    assert_eq!(order, vec![ptrs[2], ptrs[0]]);

    assert_eq!(list.pop().map(|s| s.as_ptr()), Some(ptrs[2]));
    assert_eq!(list.first(), ptrs[0]);
    assert_eq!(list.last(), ptrs[0]);
    unsafe { list.remove(ptrs[0]) };
    assert!(list.is_empty());
    assert!(list.last().is_null());
  }

  #[test]
  fn batch_is_lifo_and_splits() {
    let mut slots = [[0usize; 2]; 5];
    let mut batch = Batch::new();
    for slot in slots.iter_mut() {
      unsafe { batch.push(NonNull::from(slot).cast()) };
    }
    let last = NonNull::from(&mut slots[4]).cast::<u8>();
    let mut front = batch.split_front(2);
    assert_eq!(front.len(), 2);
    assert_eq!(batch.len(), 3);
    assert_eq!(front.pop(), Some(last));
    assert_eq!(batch.split_front(10).len(), 3);
    assert!(batch.is_empty());
  }
}
