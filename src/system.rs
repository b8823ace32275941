//! The system allocator: where pages come from and where they go back to.
//!
//! `SystemAllocator` is the OS boundary. `SysAlloc` wraps one behind the
//! system-allocator lock, the last lock in the global order.

use core::{
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicUsize, Ordering},
};

use crate::{PAGE_SIZE, align_up, sync::SpinLock};

/// Source of page-aligned, zero-filled memory.
pub trait SystemAllocator: Sync {
  /// Maps `size` bytes aligned to `align`. Both are multiples of the OS page
  /// size. The memory must read as zeroes.
  fn grow(&self, size: usize, align: usize) -> Option<NonNull<u8>>;

  /// Drops the physical backing of a range while keeping the reservation.
  /// Returns `false` when the range stays committed.
  fn decommit(&self, ptr: NonNull<u8>, size: usize) -> bool;

  /// Makes a decommitted range usable again. Touching the pages is enough on
  /// the platforms supported here.
  fn recommit(&self, _ptr: NonNull<u8>, _size: usize) {}

  /// Gives back a range from `grow` that the heap never started using.
  /// Backends that cannot unmap keep the reservation and drop the backing.
  fn release(&self, ptr: NonNull<u8>, size: usize) {
    let _ = self.decommit(ptr, size);
  }
}

// =============================================================================
// Platform
// =============================================================================

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

/// Anonymous private mappings, over-mapped and trimmed for alignment.
pub struct MmapSystem;

impl SystemAllocator for MmapSystem {
  fn grow(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
    let total = size.checked_add(align)?;
    let raw = unsafe { os_mmap(total) };
    if raw.is_null() {
      return None;
    }

    let addr = raw as usize;
    let aligned = align_up(addr, align);
    let head = aligned - addr;
    let tail = total - head - size;
    unsafe {
      if head > 0 {
        os_munmap(raw, head);
      }
      if tail > 0 {
        os_munmap((aligned + size) as *mut u8, tail);
      }
    }
    NonNull::new(aligned as *mut u8)
  }

  fn decommit(&self, ptr: NonNull<u8>, size: usize) -> bool {
    unsafe { libc::madvise(ptr.as_ptr().cast(), size, libc::MADV_DONTNEED) == 0 }
  }

  fn release(&self, ptr: NonNull<u8>, size: usize) {
    unsafe { os_munmap(ptr.as_ptr(), size) };
  }
}

/// `MmapSystem` with call counters and an optional byte cap, for tests and
/// for observing how often the heap reaches the OS.
pub struct CountingSystem {
  limit: AtomicUsize,
  grown_bytes: AtomicUsize,
  grow_calls: AtomicUsize,
  decommit_calls: AtomicUsize,
  recommit_calls: AtomicUsize,
  release_calls: AtomicUsize,
}

impl CountingSystem {
  pub const fn new() -> Self {
    Self::with_limit(usize::MAX)
  }

  /// Refuses growth once `limit` bytes have been handed out.
  pub const fn with_limit(limit: usize) -> Self {
    Self {
      limit: AtomicUsize::new(limit),
      grown_bytes: AtomicUsize::new(0),
      grow_calls: AtomicUsize::new(0),
      decommit_calls: AtomicUsize::new(0),
      recommit_calls: AtomicUsize::new(0),
      release_calls: AtomicUsize::new(0),
    }
  }

  pub fn set_limit(&self, limit: usize) {
    self.limit.store(limit, Ordering::Relaxed);
  }

  pub fn grown_bytes(&self) -> usize {
    self.grown_bytes.load(Ordering::Relaxed)
  }

  pub fn grow_calls(&self) -> usize {
    self.grow_calls.load(Ordering::Relaxed)
  }

  pub fn decommit_calls(&self) -> usize {
    self.decommit_calls.load(Ordering::Relaxed)
  }

  pub fn recommit_calls(&self) -> usize {
    self.recommit_calls.load(Ordering::Relaxed)
  }

  pub fn release_calls(&self) -> usize {
    self.release_calls.load(Ordering::Relaxed)
  }

  /// Every call into the OS so far.
  pub fn total_calls(&self) -> usize {
    self.grow_calls() + self.decommit_calls() + self.recommit_calls() + self.release_calls()
  }
}

impl Default for CountingSystem {
  fn default() -> Self {
    Self::new()
  }
}

impl SystemAllocator for CountingSystem {
  fn grow(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
    self.grow_calls.fetch_add(1, Ordering::Relaxed);
    let granted = self.grown_bytes.load(Ordering::Relaxed);
    if granted.saturating_add(size) > self.limit.load(Ordering::Relaxed) {
      return None;
    }
    let ptr = MmapSystem.grow(size, align)?;
    self.grown_bytes.fetch_add(size, Ordering::Relaxed);
    Some(ptr)
  }

  fn decommit(&self, ptr: NonNull<u8>, size: usize) -> bool {
    self.decommit_calls.fetch_add(1, Ordering::Relaxed);
    MmapSystem.decommit(ptr, size)
  }

  fn recommit(&self, ptr: NonNull<u8>, size: usize) {
    self.recommit_calls.fetch_add(1, Ordering::Relaxed);
    MmapSystem.recommit(ptr, size);
  }

  fn release(&self, ptr: NonNull<u8>, size: usize) {
    self.release_calls.fetch_add(1, Ordering::Relaxed);
    self.grown_bytes.fetch_sub(size, Ordering::Relaxed);
    MmapSystem.release(ptr, size);
  }
}

// =============================================================================
// Locked front end
// =============================================================================

pub struct SysAlloc {
  lock: SpinLock,
  backend: &'static dyn SystemAllocator,
  heap_bytes: AtomicUsize,
  metadata_bytes: AtomicUsize,
}

impl SysAlloc {
  pub const fn new(backend: &'static dyn SystemAllocator) -> Self {
    Self {
      lock: SpinLock::new(),
      backend,
      heap_bytes: AtomicUsize::new(0),
      metadata_bytes: AtomicUsize::new(0),
    }
  }

  /// Heap memory for the page heap. `size` is a multiple of `PAGE_SIZE`.
  pub fn grow(&self, size: usize) -> Option<NonNull<u8>> {
    debug_assert!(size % PAGE_SIZE == 0);
    let ptr = {
      let _g = self.lock.lock();
      self.backend.grow(size, PAGE_SIZE)?
    };
    self.heap_bytes.fetch_add(size, Ordering::Relaxed);
    Some(ptr)
  }

  /// Memory for allocator metadata (slabs, page map, registry arena).
  pub fn meta_alloc(&self, bytes: usize) -> Option<NonNull<u8>> {
    let size = align_up(bytes.max(1), PAGE_SIZE);
    let ptr = {
      let _g = self.lock.lock();
      self.backend.grow(size, PAGE_SIZE)?
    };
    self.metadata_bytes.fetch_add(size, Ordering::Relaxed);
    Some(ptr)
  }

  pub fn decommit(&self, ptr: NonNull<u8>, size: usize) -> bool {
    let _g = self.lock.lock();
    self.backend.decommit(ptr, size)
  }

  pub fn recommit(&self, ptr: NonNull<u8>, size: usize) {
    let _g = self.lock.lock();
    self.backend.recommit(ptr, size);
  }

  /// Returns heap memory from `grow` that was never used.
  pub fn give_back(&self, ptr: NonNull<u8>, size: usize) {
    {
      let _g = self.lock.lock();
      self.backend.release(ptr, size);
    }
    self.heap_bytes.fetch_sub(size, Ordering::Relaxed);
  }

  pub fn lock(&self) -> &SpinLock {
    &self.lock
  }

  pub fn heap_bytes(&self) -> usize {
    self.heap_bytes.load(Ordering::Relaxed)
  }

  pub fn metadata_bytes(&self) -> usize {
    self.metadata_bytes.load(Ordering::Relaxed)
  }
}
