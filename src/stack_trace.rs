//! Call stacks for sampled allocations and heap growth.

use core::{
  ffi::c_void,
  ptr::null_mut,
  sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

pub const MAX_DEPTH: usize = 31;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackTrace {
  /// Bytes requested by the allocation (or the growth) that was recorded.
  pub size: usize,
  pub depth: usize,
  pub stack: [usize; MAX_DEPTH],
}

impl StackTrace {
  pub const fn empty(size: usize) -> Self {
    Self {
      size,
      depth: 0,
      stack: [0; MAX_DEPTH],
    }
  }

  /// Captures the caller's stack, dropping the innermost `skip` frames.
  /// Walks frames without resolving symbols, so nothing is allocated.
  #[inline(never)]
  pub fn capture(size: usize, skip: usize) -> Self {
    let mut trace = Self::empty(size);
    let mut seen = 0;
    unsafe {
      backtrace::trace_unsynchronized(|frame| {
        seen += 1;
        if seen <= skip + 1 {
          return true;
        }
        trace.stack[trace.depth] = frame.ip() as usize;
        trace.depth += 1;
        trace.depth < MAX_DEPTH
      });
    }
    trace
  }

  pub fn frames(&self) -> &[usize] {
    &self.stack[..self.depth]
  }

  /// Frames as instruction pointers, for `backtrace::resolve`.
  pub fn ips(&self) -> impl Iterator<Item = *mut c_void> + '_ {
    self.frames().iter().map(|&ip| ip as *mut c_void)
  }
}

/// A stack trace in slab memory, linked into the growth log or owned by a
/// sampled span.
pub struct TraceRecord {
  pub trace: StackTrace,
  pub next: *mut TraceRecord,
}

/// Append-only record of every heap growth.
pub struct GrowthLog {
  head: AtomicPtr<TraceRecord>,
  len: AtomicUsize,
}

impl GrowthLog {
  pub const fn new() -> Self {
    Self {
      head: AtomicPtr::new(null_mut()),
      len: AtomicUsize::new(0),
    }
  }

  /// # Safety
  /// `record` is valid, initialized and never freed.
  pub unsafe fn push(&self, record: *mut TraceRecord) {
    let mut head = self.head.load(Ordering::Relaxed);
    loop {
      unsafe { (*record).next = head };
      match self
        .head
        .compare_exchange_weak(head, record, Ordering::Release, Ordering::Relaxed)
      {
        Ok(_) => break,
        Err(cur) => head = cur,
      }
    }
    self.len.fetch_add(1, Ordering::Relaxed);
  }

  pub fn len(&self) -> usize {
    self.len.load(Ordering::Relaxed)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Newest first. Records are immutable once pushed.
  pub fn iter(&self) -> impl Iterator<Item = &StackTrace> + '_ {
    let mut cur = self.head.load(Ordering::Acquire);
    core::iter::from_fn(move || {
      if cur.is_null() {
        return None;
      }
      let record = unsafe { &*cur };
      cur = record.next;
      Some(&record.trace)
    })
  }
}

impl Default for GrowthLog {
  fn default() -> Self {
    Self::new()
  }
}
