//! The page heap: page-granular spans carved from system memory.
//!
//! Free spans shorter than `MAX_PAGES` sit on exact-length lists; longer ones
//! share one list searched best-fit. Every length has a committed and a
//! decommitted list. Adjacent free spans are merged as soon as they appear,
//! and a merged span always has a single commit state.
//!
//! The heap holds no lock. Its owner serializes access with the page-heap
//! lock, which also guards the slabs passed in through `PageEnv`.

use core::ptr::NonNull;

use crate::{
  PAGE_SHIFT, PAGE_SIZE, align_up,
  error::{AllocError, HeapCorruption},
  pagemap::PageMap,
  slab::Slab,
  span::{Span, SpanList, SpanState},
  stack_trace::{GrowthLog, StackTrace, TraceRecord},
  system::SysAlloc,
};

/// Spans of at least this many pages go to the large list.
pub const MAX_PAGES: usize = 128;

/// Smallest growth request, in pages.
pub const MIN_SYSTEM_ALLOC_PAGES: usize = 128;

/// Everything the page heap touches besides its own lists.
pub struct PageEnv<'a> {
  pub spans: &'a mut Slab<Span>,
  pub traces: &'a mut Slab<TraceRecord>,
  pub pagemap: &'a PageMap,
  pub system: &'a SysAlloc,
  pub growth: &'a GrowthLog,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageHeapStats {
  /// Pages obtained from the system allocator.
  pub system_pages: usize,
  /// Pages backed by memory: in use plus free-and-committed.
  pub committed_pages: usize,
  /// Free pages whose memory was given back.
  pub decommitted_pages: usize,
  pub in_use_pages: usize,
  /// Free pages still committed.
  pub free_pages: usize,
  pub grow_count: usize,
}

struct FreeLists {
  normal: SpanList,
  returned: SpanList,
}

impl FreeLists {
  const fn new() -> Self {
    Self {
      normal: SpanList::new(),
      returned: SpanList::new(),
    }
  }
}

pub struct PageHeap {
  /// Indexed by span length; slot 0 is unused.
  free: [FreeLists; MAX_PAGES],
  large: FreeLists,
  system_pages: usize,
  free_pages: usize,
  decommitted_pages: usize,
  in_use_pages: usize,
  grow_count: usize,
  aggressive_decommit: bool,
  /// Next list `release_at_least` looks at.
  release_index: usize,
}

impl PageHeap {
  pub const fn new() -> Self {
    Self {
      free: [const { FreeLists::new() }; MAX_PAGES],
      large: FreeLists::new(),
      system_pages: 0,
      free_pages: 0,
      decommitted_pages: 0,
      in_use_pages: 0,
      grow_count: 0,
      aggressive_decommit: false,
      release_index: 1,
    }
  }

  pub fn set_aggressive_decommit(&mut self, on: bool) {
    self.aggressive_decommit = on;
  }

  pub fn aggressive_decommit(&self) -> bool {
    self.aggressive_decommit
  }

  pub fn stats(&self) -> PageHeapStats {
    PageHeapStats {
      system_pages: self.system_pages,
      committed_pages: self.in_use_pages + self.free_pages,
      decommitted_pages: self.decommitted_pages,
      in_use_pages: self.in_use_pages,
      free_pages: self.free_pages,
      grow_count: self.grow_count,
    }
  }

  // ===========================================================================
  // Free lists
  // ===========================================================================

  fn list_for(&mut self, length: usize, state: SpanState) -> &mut SpanList {
    let lists = if length < MAX_PAGES {
      &mut self.free[length]
    } else {
      &mut self.large
    };
    match state {
      SpanState::FreeNormal => &mut lists.normal,
      SpanState::FreeDecommitted => &mut lists.returned,
      other => crash!("in-use span ({}) on a page heap free list", other.name()),
    }
  }

  unsafe fn link(&mut self, span: *mut Span) {
    let (length, state) = unsafe { ((*span).length, (*span).state) };
    unsafe { self.list_for(length, state).push(span) };
    match state {
      SpanState::FreeNormal => self.free_pages += length,
      _ => self.decommitted_pages += length,
    }
  }

  unsafe fn unlink(&mut self, span: *mut Span) {
    let (length, state) = unsafe { ((*span).length, (*span).state) };
    unsafe { self.list_for(length, state).remove(span) };
    match state {
      SpanState::FreeNormal => self.free_pages -= length,
      _ => self.decommitted_pages -= length,
    }
  }

  fn decommit(env: &PageEnv<'_>, span: &Span) -> bool {
    match NonNull::new(span.start_addr() as *mut u8) {
      Some(ptr) => env.system.decommit(ptr, span.bytes()),
      None => false,
    }
  }

  // ===========================================================================
  // Acquire
  // ===========================================================================

  /// A span of exactly `n` pages in state `InUseLarge`.
  pub fn acquire_span(
    &mut self,
    env: &mut PageEnv<'_>,
    n: usize,
  ) -> Result<NonNull<Span>, AllocError> {
    check!(n > 0, "page heap asked for an empty span");
    if let Some(span) = self.search(env, n)? {
      return Ok(span);
    }
    self.grow_heap(env, n)?;
    self
      .search(env, n)?
      .ok_or(AllocError::OutOfMemory { pages: n })
  }

  /// A span of `n` pages starting on a multiple of `align_pages`.
  pub fn acquire_aligned(
    &mut self,
    env: &mut PageEnv<'_>,
    n: usize,
    align_pages: usize,
  ) -> Result<NonNull<Span>, AllocError> {
    if align_pages <= 1 {
      return self.acquire_span(env, n);
    }
    if !align_pages.is_power_of_two() {
      return Err(AllocError::BadAlignment(align_pages << PAGE_SHIFT));
    }
    let total = n
      .checked_add(align_pages - 1)
      .ok_or(AllocError::SizeOverflow)?;
    let span = self.acquire_span(env, total)?.as_ptr();

    let start = unsafe { (*span).start };
    let aligned = align_up(start, align_pages);
    let prefix = aligned - start;
    let suffix = total - prefix - n;

    let head = if prefix > 0 {
      match env.spans.alloc(env.system) {
        Some(d) => Some(d),
        None => {
          unsafe { self.release_span(env, span) };
          return Err(AllocError::OutOfMemory { pages: n });
        }
      }
    } else {
      None
    };
    let tail = if suffix > 0 {
      match env.spans.alloc(env.system) {
        Some(d) => Some(d),
        None => {
          if let Some(h) = head {
            unsafe { env.spans.free(h) };
          }
          unsafe { self.release_span(env, span) };
          return Err(AllocError::OutOfMemory { pages: n });
        }
      }
    } else {
      None
    };

    unsafe {
      (*span).start = aligned;
      (*span).length = n;
      env.pagemap.set_endpoints(span);
      if let Some(h) = head {
        h.as_ptr().write(Span::new(start, prefix, SpanState::InUseLarge));
        env.pagemap.set_endpoints(h.as_ptr());
        self.release_span(env, h.as_ptr());
      }
      if let Some(t) = tail {
        t.as_ptr()
          .write(Span::new(aligned + n, suffix, SpanState::InUseLarge));
        env.pagemap.set_endpoints(t.as_ptr());
        self.release_span(env, t.as_ptr());
      }
      Ok(NonNull::new_unchecked(span))
    }
  }

  fn search(
    &mut self,
    env: &mut PageEnv<'_>,
    n: usize,
  ) -> Result<Option<NonNull<Span>>, AllocError> {
    for length in n..MAX_PAGES {
      let lists = &self.free[length];
      let span = if !lists.normal.is_empty() {
        lists.normal.first()
      } else if !lists.returned.is_empty() {
        lists.returned.first()
      } else {
        continue;
      };
      return self.carve(env, span, n).map(Some);
    }

    match self.best_large(n) {
      Some(span) => self.carve(env, span, n).map(Some),
      None => Ok(None),
    }
  }

  /// Smallest large span of at least `n` pages, lowest address on ties.
  fn best_large(&self, n: usize) -> Option<*mut Span> {
    let mut best: Option<*mut Span> = None;
    for span in self.large.normal.iter().chain(self.large.returned.iter()) {
      let s = unsafe { &*span };
      if s.length < n {
        continue;
      }
      let better = match best {
        None => true,
        Some(b) => {
          let b = unsafe { &*b };
          s.length < b.length || (s.length == b.length && s.start < b.start)
        }
      };
      if better {
        best = Some(span);
      }
    }
    best
  }

  /// Takes `n` pages off the front of a free span and puts the rest back.
  fn carve(
    &mut self,
    env: &mut PageEnv<'_>,
    span: *mut Span,
    n: usize,
  ) -> Result<NonNull<Span>, AllocError> {
    let extra = unsafe { (*span).length } - n;
    // The descriptor for the remainder must exist before the span is
    // unlinked; failing later would lose the pages.
    let leftover = if extra > 0 {
      Some(
        env
          .spans
          .alloc(env.system)
          .ok_or(AllocError::OutOfMemory { pages: n })?,
      )
    } else {
      None
    };

    unsafe {
      self.unlink(span);
      let s = &mut *span;
      let old_state = s.state;
      if let Some(rest) = leftover {
        rest
          .as_ptr()
          .write(Span::new(s.start + n, extra, old_state));
        s.length = n;
        env.pagemap.set_endpoints(rest.as_ptr());
        self.link(rest.as_ptr());
      }
      if old_state == SpanState::FreeDecommitted
        && let Some(ptr) = NonNull::new(s.start_addr() as *mut u8)
      {
        env.system.recommit(ptr, s.bytes());
      }
      s.state = SpanState::InUseLarge;
      env.pagemap.set_endpoints(span);
      self.in_use_pages += n;
      Ok(NonNull::new_unchecked(span))
    }
  }

  fn grow_heap(&mut self, env: &mut PageEnv<'_>, n: usize) -> Result<(), AllocError> {
    let oom = AllocError::OutOfMemory { pages: n };
    let ask = n.max(MIN_SYSTEM_ALLOC_PAGES);
    // The descriptor comes first so a failure here cannot strand new memory.
    let descriptor = env.spans.alloc(env.system).ok_or(oom)?;
    let system = env.system;
    let grow = |pages: usize| {
      pages
        .checked_mul(PAGE_SIZE)
        .and_then(|bytes| system.grow(bytes))
    };
    let grown = match grow(ask) {
      Some(ptr) => Some((ptr, ask)),
      None if ask > n => grow(n).map(|ptr| (ptr, n)),
      None => None,
    };
    let Some((ptr, pages)) = grown else {
      unsafe { env.spans.free(descriptor) };
      return Err(oom);
    };

    let start = ptr.as_ptr() as usize >> PAGE_SHIFT;
    if !env.pagemap.ensure(start, pages, env.system) {
      env.system.give_back(ptr, pages << PAGE_SHIFT);
      unsafe { env.spans.free(descriptor) };
      return Err(oom);
    }
    let span = descriptor.as_ptr();
    self.system_pages += pages;
    self.grow_count += 1;
    Self::record_growth(env, pages);

    unsafe {
      span.write(Span::new(start, pages, SpanState::FreeNormal));
      self.merge_into_free_list(env, span, false);
    }
    Ok(())
  }

  fn record_growth(env: &mut PageEnv<'_>, pages: usize) {
    let trace = StackTrace::capture(pages << PAGE_SHIFT, 2);
    let record = TraceRecord {
      trace,
      next: core::ptr::null_mut(),
    };
    if let Some(record) = env.traces.alloc_with(env.system, record) {
      unsafe { env.growth.push(record.as_ptr()) };
    }
  }

  // ===========================================================================
  // Release
  // ===========================================================================

  /// Returns an in-use span to the free index.
  ///
  /// # Safety
  /// `span` came from this heap and is not used by the caller afterwards.
  pub unsafe fn release_span(&mut self, env: &mut PageEnv<'_>, span: *mut Span) {
    let s = unsafe { &mut *span };
    check!(
      matches!(s.state, SpanState::InUseLarge | SpanState::InUseSmall(_)),
      "span at page {:#x} released while {}",
      s.start,
      s.state.name()
    );
    self.in_use_pages -= s.length;
    *s = Span::new(s.start, s.length, SpanState::FreeNormal);
    let decommit = self.aggressive_decommit;
    unsafe { self.merge_into_free_list(env, span, decommit) };
  }

  /// `span` is free and on no list.
  unsafe fn merge_into_free_list(
    &mut self,
    env: &mut PageEnv<'_>,
    span: *mut Span,
    decommit_now: bool,
  ) {
    unsafe {
      if decommit_now
        && (*span).state == SpanState::FreeNormal
        && Self::decommit(env, &*span)
      {
        (*span).state = SpanState::FreeDecommitted;
      }

      let start = (*span).start;
      if start > 0 {
        let prev = env.pagemap.get(start - 1);
        if !prev.is_null()
          && prev != span
          && (*prev).state.is_free()
          && (*prev).end_page() == start
        {
          self.absorb(env, span, prev);
        }
      }

      let end = (*span).end_page();
      let next = env.pagemap.get(end);
      if !next.is_null() && next != span && (*next).state.is_free() && (*next).start == end {
        self.absorb(env, span, next);
      }

      env.pagemap.set_endpoints(span);
      self.link(span);
    }
  }

  /// Merges the free, linked neighbour `other` into `span`. Mixed commit
  /// states are resolved by decommitting the committed side; if that fails
  /// the two stay apart.
  unsafe fn absorb(&mut self, env: &mut PageEnv<'_>, span: *mut Span, other: *mut Span) -> bool {
    unsafe {
      let (s_state, o_state) = ((*span).state, (*other).state);
      if s_state != o_state {
        if s_state == SpanState::FreeDecommitted {
          if !Self::decommit(env, &*other) {
            return false;
          }
        } else {
          if !Self::decommit(env, &*span) {
            return false;
          }
          (*span).state = SpanState::FreeDecommitted;
        }
      }

      self.unlink(other);
      let s = &mut *span;
      if (*other).start < s.start {
        s.start = (*other).start;
      }
      s.length += (*other).length;
      env.spans.free(NonNull::new_unchecked(other));
      true
    }
  }

  /// Decommits free spans, round-robin over the lists, until at least
  /// `pages` pages were given back or nothing committed is left. Returns the
  /// number of pages decommitted.
  pub fn release_at_least(&mut self, env: &mut PageEnv<'_>, pages: usize) -> usize {
    let before = self.decommitted_pages;
    let mut failures = 0;
    while self.decommitted_pages - before < pages && failures <= MAX_PAGES {
      let Some(span) = self.next_release_candidate() else {
        break;
      };
      unsafe {
        self.unlink(span);
        if Self::decommit(env, &*span) {
          (*span).state = SpanState::FreeDecommitted;
        } else {
          failures += 1;
        }
        self.merge_into_free_list(env, span, false);
      }
    }
    self.decommitted_pages.saturating_sub(before)
  }

  fn next_release_candidate(&mut self) -> Option<*mut Span> {
    for _ in 0..MAX_PAGES {
      let index = self.release_index;
      self.release_index = if index >= MAX_PAGES { 1 } else { index + 1 };
      let list = if index >= MAX_PAGES {
        &self.large.normal
      } else {
        &self.free[index].normal
      };
      if !list.is_empty() {
        return Some(list.last());
      }
    }
    None
  }

  // ===========================================================================
  // Consistency
  // ===========================================================================

  /// Walks every free list and checks lengths, states, page map endpoints,
  /// coalescing and the page counters.
  pub fn verify(&self, pagemap: &PageMap) -> Result<(), HeapCorruption> {
    let mut normal = 0;
    let mut returned = 0;
    for length in 1..MAX_PAGES {
      let lists = &self.free[length];
      Self::check_list(&lists.normal, Some(length), SpanState::FreeNormal, pagemap, &mut normal)?;
      Self::check_list(
        &lists.returned,
        Some(length),
        SpanState::FreeDecommitted,
        pagemap,
        &mut returned,
      )?;
    }
    Self::check_list(&self.large.normal, None, SpanState::FreeNormal, pagemap, &mut normal)?;
    Self::check_list(
      &self.large.returned,
      None,
      SpanState::FreeDecommitted,
      pagemap,
      &mut returned,
    )?;

    if normal != self.free_pages {
      return Err(HeapCorruption::CounterMismatch {
        counter: "free",
        recorded: self.free_pages,
        actual: normal,
      });
    }
    if returned != self.decommitted_pages {
      return Err(HeapCorruption::CounterMismatch {
        counter: "decommitted",
        recorded: self.decommitted_pages,
        actual: returned,
      });
    }
    let accounted = self.in_use_pages + self.free_pages + self.decommitted_pages;
    if accounted != self.system_pages {
      return Err(HeapCorruption::CounterMismatch {
        counter: "system",
        recorded: self.system_pages,
        actual: accounted,
      });
    }
    Ok(())
  }

  fn check_list(
    list: &SpanList,
    length: Option<usize>,
    state: SpanState,
    pagemap: &PageMap,
    total: &mut usize,
  ) -> Result<(), HeapCorruption> {
    for span in list.iter() {
      let s = unsafe { &*span };
      if s.state != state {
        return Err(HeapCorruption::WrongState {
          start: s.start,
          expected: state.name(),
          found: s.state.name(),
        });
      }
      let misplaced = match length {
        Some(l) => s.length != l,
        None => s.length < MAX_PAGES,
      };
      if misplaced {
        return Err(HeapCorruption::WrongLength {
          start: s.start,
          length: s.length,
          list: length.unwrap_or(MAX_PAGES),
        });
      }
      for page in [s.start, s.end_page() - 1] {
        if pagemap.get(page) != span {
          return Err(HeapCorruption::PageMapMismatch { page });
        }
      }
      let next = pagemap.get(s.end_page());
      if !next.is_null() {
        let n = unsafe { &*next };
        if n.start == s.end_page() && n.state == s.state {
          return Err(HeapCorruption::Uncoalesced {
            first: s.start,
            second: n.start,
          });
        }
      }
      *total += s.length;
    }
    Ok(())
  }
}

impl Default for PageHeap {
  fn default() -> Self {
    Self::new()
  }
}
