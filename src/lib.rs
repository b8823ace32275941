#![allow(clippy::missing_safety_doc)]

//! A thread-caching, multi-tier memory allocator.
//!
//! Small requests are served from per-thread caches, which refill from
//! per-class central free lists, which carve spans taken from a page heap,
//! which grows through a system allocator. Large requests go straight to the
//! page heap. A small fraction of allocations is sampled with its call stack.
//!
//! Use [`Allocator`] as `#[global_allocator]`, build the crate with
//! `--features c_api` to replace the C `malloc` family, or create private
//! heaps with [`Static`].

#[macro_use]
pub mod error;

mod central;
pub mod config;
pub mod fork;
mod global;
mod page_heap;
mod pagemap;
mod registry;
mod sampler;
pub mod size_class;
mod slab;
mod span;
pub mod stack_trace;
pub mod statics;
mod storage;
mod sync;
pub mod system;
mod thread_cache;

// =============================================================================
// Constants
// =============================================================================

pub const PAGE_SHIFT: usize = 13;
/// The page heap's unit of allocation.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(size_class::MAX_SIZE % PAGE_SIZE == 0);

#[inline]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  (x + align - 1) & !(align - 1)
}

pub use central::CentralStats;
pub use config::Config;
pub use error::{AllocError, ForkError, HeapCorruption};
pub use global::{
  Allocator, flush_thread_cache, global_heap, growth_stacks, heap_stats, release_free_memory,
  sampled_objects, tier_free, tier_malloc, tier_usable_size,
};
pub use page_heap::PageHeapStats;
pub use stack_trace::StackTrace;
pub use statics::{CacheHandle, HeapStats, InitStep, SampledObject, Static};
pub use system::{CountingSystem, MmapSystem, SystemAllocator};
pub use thread_cache::ThreadCache;

#[cfg(feature = "c_api")]
pub use global::{
  aligned_alloc, calloc, free, malloc, malloc_usable_size, memalign, posix_memalign, realloc,
};
