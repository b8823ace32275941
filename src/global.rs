//! The process-wide heap: `GlobalAlloc`, the C entry points and the
//! per-thread caches behind them.

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::Cell,
  ptr::{self, NonNull, null_mut},
};
use std::{cell::UnsafeCell, sync::OnceLock};

use crate::{
  config::Config,
  error::AllocError,
  fork::platform_notifier,
  stack_trace::StackTrace,
  statics::{HeapStats, SampledObject, Static},
  system::MmapSystem,
  thread_cache::{self, CacheSlot, Fallback, ThreadCache},
};

/// Alignment the C entry points guarantee.
const C_ALIGN: usize = 16;

static SYSTEM: MmapSystem = MmapSystem;
static HEAP: OnceLock<Static> = OnceLock::new();

/// The global heap, initialized on first use.
pub fn global_heap() -> &'static Static {
  let heap = HEAP.get_or_init(|| Static::new(Config::from_env(), &SYSTEM));
  if !heap.is_inited() {
    init_heap(heap);
  }
  heap
}

#[cold]
#[inline(never)]
fn init_heap(heap: &'static Static) {
  if let Err(e) = heap.init_early() {
    crash!("cannot initialize the heap: {}", e);
  }
  // Not fork-safe is not fatal; init_late already logged why.
  let _ = heap.init_late(&platform_notifier());
}

// =============================================================================
// TLS
// =============================================================================

struct TlsCache {
  cache: ThreadCache,
}

impl Drop for TlsCache {
  fn drop(&mut self) {
    if let Some(heap) = HEAP.get()
      && heap.is_inited()
    {
      thread_cache::flush(&mut self.cache, heap);
    }
  }
}

thread_local! {
  static CACHE: UnsafeCell<TlsCache> = const {
    UnsafeCell::new(TlsCache { cache: ThreadCache::new() })
  };
  static IN_ALLOC: Cell<bool> = const { Cell::new(false) };
}

/// The calling thread's cache, or the shared fallback when the thread's
/// cache is gone or already in use further up the stack.
enum CacheRef<'a> {
  Local(&'a mut ThreadCache),
  Shared(Fallback<'a>),
}

impl CacheSlot for CacheRef<'_> {
  #[inline]
  fn with<R>(&mut self, f: impl FnOnce(&mut ThreadCache) -> R) -> R {
    match self {
      CacheRef::Local(cache) => f(cache),
      CacheRef::Shared(fallback) => fallback.with(f),
    }
  }
}

fn local_cache() -> Option<*mut ThreadCache> {
  CACHE
    .try_with(|tls| unsafe { &raw mut (*tls.get()).cache })
    .ok()
}

fn with_cache<R>(f: impl FnOnce(&'static Static, &mut CacheRef<'_>) -> R) -> R {
  let heap = global_heap();
  // TLS may already be destroyed during thread exit.
  let entered = IN_ALLOC.try_with(|flag| !flag.replace(true)).unwrap_or(false);
  let local = if entered { local_cache() } else { None };

  let result = match local {
    Some(cache) => f(heap, &mut CacheRef::Local(unsafe { &mut *cache })),
    None => f(heap, &mut CacheRef::Shared(heap.fallback_slot())),
  };
  if entered {
    let _ = IN_ALLOC.try_with(|flag| flag.set(false));
  }
  result
}

fn allocate(size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
  with_cache(|heap, cache| heap.allocate_in(cache, size, align))
}

unsafe fn deallocate(ptr: NonNull<u8>) {
  with_cache(|heap, cache| heap.deallocate_in(cache, ptr));
}

unsafe fn reallocate(ptr: NonNull<u8>, new_size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
  with_cache(|heap, cache| heap.reallocate_in(cache, ptr, new_size, align))
}

// =============================================================================
// GlobalAlloc
// =============================================================================

pub struct Allocator;

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    allocate(layout.size(), layout.align()).map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    if let Some(ptr) = NonNull::new(ptr) {
      unsafe { deallocate(ptr) };
    }
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    let Some(old) = NonNull::new(ptr) else {
      return allocate(new_size, layout.align()).map_or(null_mut(), NonNull::as_ptr);
    };
    unsafe { reallocate(old, new_size, layout.align()) }.map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    let ptr = unsafe { self.alloc(layout) };
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) }
    }
    ptr
  }
}

// =============================================================================
// Rust entry points
// =============================================================================

pub unsafe fn tier_malloc(size: usize) -> *mut u8 {
  allocate(size, C_ALIGN).map_or(null_mut(), NonNull::as_ptr)
}

pub unsafe fn tier_free(ptr: *mut u8) {
  if let Some(ptr) = NonNull::new(ptr) {
    unsafe { deallocate(ptr) };
  }
}

/// Bytes usable at a pointer from the global heap. 0 for null.
pub unsafe fn tier_usable_size(ptr: *mut u8) -> usize {
  NonNull::new(ptr)
    .and_then(|ptr| global_heap().usable_size(ptr))
    .unwrap_or(0)
}

/// Hands the calling thread's cached objects back to the shared lists.
pub fn flush_thread_cache() {
  with_cache(|heap, cache| thread_cache::flush(cache, heap));
}

pub fn release_free_memory() -> usize {
  global_heap().release_free_memory()
}

pub fn heap_stats() -> HeapStats {
  global_heap().stats()
}

pub fn sampled_objects() -> Vec<SampledObject> {
  global_heap().sampled_objects()
}

pub fn growth_stacks() -> Vec<StackTrace> {
  global_heap().growth_stacks()
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
fn aligned(alignment: usize, size: usize) -> *mut u8 {
  allocate(size, alignment.max(C_ALIGN)).map_or(null_mut(), NonNull::as_ptr)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  unsafe { tier_malloc(size) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  unsafe { tier_free(ptr) }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  let Some(total) = nmemb.checked_mul(size) else {
    return null_mut();
  };
  let ptr = unsafe { tier_malloc(total) };
  if !ptr.is_null() {
    unsafe { ptr::write_bytes(ptr, 0, total) }
  }
  ptr
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  let Some(old) = NonNull::new(ptr) else {
    return unsafe { tier_malloc(size) };
  };
  if size == 0 {
    unsafe { deallocate(old) };
    return null_mut();
  }
  unsafe { reallocate(old, size, C_ALIGN) }.map_or(null_mut(), NonNull::as_ptr)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(
  memptr: *mut *mut u8,
  alignment: usize,
  size: usize,
) -> i32 {
  if !alignment.is_power_of_two() || alignment < core::mem::size_of::<*mut u8>() {
    return libc::EINVAL;
  }
  let ptr = aligned(alignment, size);
  if ptr.is_null() {
    return libc::ENOMEM;
  }
  unsafe { *memptr = ptr };
  0
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn aligned_alloc(alignment: usize, size: usize) -> *mut u8 {
  if !alignment.is_power_of_two() {
    return null_mut();
  }
  aligned(alignment, size)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn memalign(alignment: usize, size: usize) -> *mut u8 {
  if !alignment.is_power_of_two() {
    return null_mut();
  }
  aligned(alignment, size)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  unsafe { tier_usable_size(ptr) }
}
