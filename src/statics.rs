//! The composition root.
//!
//! `Static` owns every shared component of one heap. Construction reserves
//! storage only; `init_early` builds the components in a fixed order without
//! allocating from the heap itself, and `init_late` hooks the heap into
//! `fork()`. Any number of heaps can live in one process.
//!
//! Lock order, highest first: page heap (also guarding the slabs and the
//! sampled registry), central free lists by ascending class, the fallback
//! cache, the system allocator. `lock_all` takes them in that order.

use core::{
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicBool, AtomicIsize, Ordering},
};

use crate::{
  PAGE_SHIFT, PAGE_SIZE,
  central::{CentralFreeList, CentralStats, SpanSource},
  config::Config,
  error::{AllocError, ForkError, HeapCorruption},
  fork::{self, ForkNotifier},
  page_heap::{PageEnv, PageHeap, PageHeapStats},
  pagemap::PageMap,
  registry::SampledRegistry,
  size_class::{MAX_CLASSES, SizeMap},
  slab::{SLAB_CHUNK, Slab},
  span::{Span, SpanState},
  stack_trace::{GrowthLog, StackTrace, TraceRecord},
  storage::StaticStorage,
  sync::{SpinLock, SpinLockGuard, SpinMutex},
  system::{SysAlloc, SystemAllocator},
  thread_cache::{self, CacheSlot, Fallback, ThreadCache},
};

/// Placeholder objects taken from each metadata slab at init.
const SLAB_PREWARM: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitStep {
  SizeMap,
  SlabAllocators,
  CentralFreeLists,
  PageHeap,
  SampledRegistry,
  DecommitPolicy,
}

const INIT_STEPS: usize = 6;

struct InitLog {
  steps: [Option<InitStep>; INIT_STEPS],
  len: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
  pub page_heap: PageHeapStats,
  /// Free objects held by the central lists, spans and transfer caches.
  pub central_free_objects: usize,
  pub central_free_bytes: usize,
  /// Objects carved over the heap's lifetime, minus those whose spans went
  /// back to the page heap.
  pub outstanding_carved_objects: usize,
  pub fallback_cache_bytes: usize,
  pub sampled_objects: usize,
  pub growth_events: usize,
  pub heap_bytes: usize,
  pub metadata_bytes: usize,
  pub span_descriptors: usize,
  /// Thread-cache budget not claimed by any cache. Negative when caches
  /// were forced past the configured total.
  pub unclaimed_cache_bytes: isize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SampledObject {
  pub address: usize,
  /// Bytes reserved for the object.
  pub allocated_bytes: usize,
  /// Requested size and call stack.
  pub trace: StackTrace,
}

pub struct Static {
  config: Config,
  system: SysAlloc,
  init_lock: SpinLock,
  inited: AtomicBool,
  late_inited: AtomicBool,
  aggressive_decommit: AtomicBool,
  init_log: SpinMutex<InitLog>,
  sizemap: StaticStorage<SizeMap>,
  pageheap_lock: SpinLock,
  span_allocator: StaticStorage<Slab<Span>>,
  stacktrace_allocator: StaticStorage<Slab<TraceRecord>>,
  pageheap: StaticStorage<PageHeap>,
  sampled_objects: StaticStorage<SampledRegistry>,
  central_cache: [CentralFreeList; MAX_CLASSES],
  pagemap: PageMap,
  growth_stacks: GrowthLog,
  fallback_cache: SpinMutex<ThreadCache>,
  unclaimed_cache_space: AtomicIsize,
}

unsafe impl Sync for Static {}
unsafe impl Send for Static {}

/// The page heap with everything its lock guards.
struct PageHeapGuard<'a> {
  _lock: SpinLockGuard<'a>,
  heap: &'a mut PageHeap,
  registry: &'a mut SampledRegistry,
  env: PageEnv<'a>,
}

impl Static {
  /// Reserves storage for a heap. Nothing is allocated until `init_early`.
  pub fn new(config: Config, system: &'static dyn SystemAllocator) -> Self {
    Self {
      system: SysAlloc::new(system),
      init_lock: SpinLock::new(),
      inited: AtomicBool::new(false),
      late_inited: AtomicBool::new(false),
      aggressive_decommit: AtomicBool::new(false),
      init_log: SpinMutex::new(InitLog {
        steps: [None; INIT_STEPS],
        len: 0,
      }),
      sizemap: StaticStorage::new(),
      pageheap_lock: SpinLock::new(),
      span_allocator: StaticStorage::new(),
      stacktrace_allocator: StaticStorage::new(),
      pageheap: StaticStorage::new(),
      sampled_objects: StaticStorage::new(),
      central_cache: [const { CentralFreeList::new() }; MAX_CLASSES],
      pagemap: PageMap::new(),
      growth_stacks: GrowthLog::new(),
      fallback_cache: SpinMutex::new(ThreadCache::new()),
      unclaimed_cache_space: AtomicIsize::new(
        config.max_total_thread_cache_bytes.min(isize::MAX as usize) as isize,
      ),
      config,
    }
  }

  // ===========================================================================
  // Init
  // ===========================================================================

  /// Builds every component, once. Later calls return immediately. A call
  /// that fails part way can be retried and resumes at the failed step.
  pub fn init_early(&self) -> Result<(), AllocError> {
    if self.is_inited() {
      return Ok(());
    }
    let _g = self.init_lock.lock();
    if self.is_inited() {
      return Ok(());
    }
    let meta_oom = |bytes: usize| AllocError::OutOfMemory {
      pages: bytes.div_ceil(PAGE_SIZE),
    };

    if !self.sizemap.is_ready() {
      self.sizemap.construct(SizeMap::new());
      self.record_step(InitStep::SizeMap);
    }

    if !self.span_allocator.is_ready() {
      let mut spans = Slab::new();
      spans
        .prewarm(&self.system, SLAB_PREWARM)
        .ok_or(meta_oom(SLAB_CHUNK))?;
      let mut traces = Slab::new();
      traces
        .prewarm(&self.system, SLAB_PREWARM)
        .ok_or(meta_oom(SLAB_CHUNK))?;
      self.span_allocator.construct(spans);
      self.stacktrace_allocator.construct(traces);
      self.record_step(InitStep::SlabAllocators);
    }

    if !self.step_done(InitStep::CentralFreeLists) {
      let map = self.size_map();
      for class in 1..map.num_classes() {
        self.central_cache[class].init(
          class,
          map.size_of(class),
          map.pages_of(class),
          map.num_objects_to_move(class),
          map.objects_per_span(class),
        );
      }
      self.record_step(InitStep::CentralFreeLists);
    }

    if !self.pageheap.is_ready() {
      self
        .pagemap
        .init(&self.system)
        .ok_or(meta_oom(PAGE_SIZE))?;
      self.pageheap.construct(PageHeap::new());
      self.record_step(InitStep::PageHeap);
    }

    if !self.sampled_objects.is_ready() {
      let mut registry = SampledRegistry::new();
      registry.init(&self.system).ok_or(meta_oom(PAGE_SIZE))?;
      self.sampled_objects.construct(registry);
      self.record_step(InitStep::SampledRegistry);
    }

    let aggressive = self.config.resolve_aggressive_decommit();
    self.lock_page_heap().heap.set_aggressive_decommit(aggressive);
    self.aggressive_decommit.store(aggressive, Ordering::Release);
    self.record_step(InitStep::DecommitPolicy);

    self.inited.store(true, Ordering::Release);
    Ok(())
  }

  /// Registers the fork hooks, unless this platform opts out. Allocation
  /// works either way; the error says why the heap is not fork-safe.
  pub fn init_late(&'static self, notifier: &dyn ForkNotifier) -> Result<(), ForkError> {
    check!(self.is_inited(), "init_late called before init_early");
    if self.late_inited.swap(true, Ordering::AcqRel) {
      return Ok(());
    }
    // The unwinder may allocate on first use. Growth traces are captured
    // under the page-heap lock, so get that out of the way here.
    let _ = StackTrace::capture(0, 0);

    let os = std::env::consts::OS;
    let result = match fork::skip_reason(os) {
      Some(reason) => Err(ForkError::Unsupported { os, reason }),
      None => fork::add_target(self).and_then(|()| {
        notifier.register(fork::prepare_fork, fork::after_fork, fork::after_fork)
      }),
    };

    match &result {
      Ok(()) => log::debug!(
        "tiermalloc: heap ready, {} size classes, aggressive decommit {}",
        self.size_map().num_classes() - 1,
        self.aggressive_decommit()
      ),
      Err(e) => log::warn!("tiermalloc: heap is not fork-safe: {e}"),
    }
    result
  }

  pub fn is_inited(&self) -> bool {
    self.inited.load(Ordering::Acquire)
  }

  /// The init steps completed so far, in order.
  pub fn init_steps(&self) -> Vec<InitStep> {
    let (steps, len) = {
      let log = self.init_log.lock();
      (log.steps, log.len)
    };
    steps[..len].iter().flatten().copied().collect()
  }

  fn record_step(&self, step: InitStep) {
    let mut log = self.init_log.lock();
    let len = log.len;
    if len < INIT_STEPS {
      log.steps[len] = Some(step);
      log.len += 1;
    }
  }

  fn step_done(&self, step: InitStep) -> bool {
    let log = self.init_log.lock();
    log.steps[..log.len].contains(&Some(step))
  }

  // ===========================================================================
  // Locks
  // ===========================================================================

  /// Takes every lock of the heap in the global order.
  pub fn lock_all(&self) {
    self.pageheap_lock.lock_raw();
    for central in &self.central_cache {
      central.raw_lock().lock_raw();
    }
    self.fallback_cache.raw().lock_raw();
    self.system.lock().lock_raw();
  }

  /// Releases what `lock_all` took, in reverse.
  ///
  /// # Safety
  /// Every lock must be held through `lock_all`, in this process or in the
  /// parent of a fork.
  pub unsafe fn unlock_all(&self) {
    unsafe {
      self.system.lock().unlock_raw();
      self.fallback_cache.raw().unlock_raw();
      for central in self.central_cache.iter().rev() {
        central.raw_lock().unlock_raw();
      }
      self.pageheap_lock.unlock_raw();
    }
  }

  fn lock_page_heap(&self) -> PageHeapGuard<'_> {
    check!(
      self.pageheap.is_ready(),
      "page heap used before init_early"
    );
    let lock = self.pageheap_lock.lock();
    unsafe {
      PageHeapGuard {
        _lock: lock,
        heap: self.pageheap.get_mut_unchecked(),
        registry: self.sampled_objects.get_mut_unchecked(),
        env: PageEnv {
          spans: self.span_allocator.get_mut_unchecked(),
          traces: self.stacktrace_allocator.get_mut_unchecked(),
          pagemap: &self.pagemap,
          system: &self.system,
          growth: &self.growth_stacks,
        },
      }
    }
  }

  // ===========================================================================
  // Components
  // ===========================================================================

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn size_map(&self) -> &SizeMap {
    match self.sizemap.get() {
      Some(map) => map,
      None => crash!("heap used before init_early"),
    }
  }

  pub(crate) fn central(&self, class: usize) -> &CentralFreeList {
    &self.central_cache[class]
  }

  pub fn central_stats(&self, class: usize) -> CentralStats {
    self.central_cache[class].stats()
  }

  pub fn aggressive_decommit(&self) -> bool {
    self.aggressive_decommit.load(Ordering::Acquire)
  }

  pub(crate) fn cache_pool(&self) -> &AtomicIsize {
    &self.unclaimed_cache_space
  }

  fn log_growth(&self) {
    log::trace!(
      "tiermalloc: heap grew to {} bytes ({} growths)",
      self.system.heap_bytes(),
      self.growth_stacks.len()
    );
  }

  // ===========================================================================
  // Allocation
  // ===========================================================================

  pub(crate) fn allocate_in<C: CacheSlot>(
    &self,
    slot: &mut C,
    size: usize,
    align: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    if !align.is_power_of_two() {
      return Err(AllocError::BadAlignment(align));
    }
    if size > isize::MAX as usize {
      return Err(AllocError::SizeOverflow);
    }
    let sampled = slot.with(|c| {
      c.ensure_init(self);
      c.should_sample(size)
    });
    if sampled {
      return self.allocate_sampled(size, align);
    }
    match self.size_map().class_for(size, align) {
      Some(class) => thread_cache::allocate(slot, self, class),
      None => self.allocate_large(size, align),
    }
  }

  fn pages_for(size: usize) -> Result<usize, AllocError> {
    let rounded = size
      .checked_add(PAGE_SIZE - 1)
      .ok_or(AllocError::SizeOverflow)?;
    Ok((rounded >> PAGE_SHIFT).max(1))
  }

  fn allocate_large(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
    let pages = Self::pages_for(size)?;
    let align_pages = (align >> PAGE_SHIFT).max(1);
    let (span, grew) = {
      let mut g = self.lock_page_heap();
      let before = g.heap.stats().grow_count;
      let span = g.heap.acquire_aligned(&mut g.env, pages, align_pages)?;
      (span, g.heap.stats().grow_count != before)
    };
    if grew {
      self.log_growth();
    }
    Ok(span_start(span))
  }

  /// A sampled allocation gets a span of its own, so freeing it finds the
  /// record through the span.
  fn allocate_sampled(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
    let trace = StackTrace::capture(size, 2);
    let pages = Self::pages_for(size)?;
    let align_pages = (align >> PAGE_SHIFT).max(1);
    let (span, grew) = {
      let mut g = self.lock_page_heap();
      let before = g.heap.stats().grow_count;
      let span = g.heap.acquire_aligned(&mut g.env, pages, align_pages)?;
      let record = TraceRecord {
        trace,
        next: null_mut(),
      };
      if let Some(record) = g.env.traces.alloc_with(g.env.system, record) {
        match g.registry.insert(span.as_ptr(), g.env.system) {
          Some(node) => unsafe {
            let s = &mut *span.as_ptr();
            s.sampled = true;
            s.trace = record.as_ptr();
            s.sample_node = node;
          },
          None => unsafe { g.env.traces.free(record) },
        }
      }
      (span, g.heap.stats().grow_count != before)
    };
    if grew {
      self.log_growth();
    }
    Ok(span_start(span))
  }

  pub(crate) fn deallocate_in<C: CacheSlot>(&self, slot: &mut C, ptr: NonNull<u8>) {
    let span = self.pagemap.get(ptr.as_ptr() as usize >> PAGE_SHIFT);
    check!(!span.is_null(), "free of {:p}, which the heap does not own", ptr);
    match unsafe { (*span).state } {
      SpanState::InUseSmall(class) => thread_cache::deallocate(slot, self, class as usize, ptr),
      SpanState::InUseLarge => {
        check!(
          unsafe { (*span).start_addr() } == ptr.as_ptr() as usize,
          "free of {:p}, which is inside a large allocation",
          ptr
        );
        self.free_large(span);
      }
      _ => crash!("free of {:p}, which is already free", ptr),
    }
  }

  fn free_large(&self, span: *mut Span) {
    let mut g = self.lock_page_heap();
    unsafe {
      let s = &mut *span;
      if s.sampled {
        g.registry.remove(s.sample_node);
        if let Some(record) = NonNull::new(s.trace) {
          g.env.traces.free(record);
        }
      }
      g.heap.release_span(&mut g.env, span);
    }
  }

  /// Keeps the block when it shrinks by less than half; otherwise moves it,
  /// growing by at least a quarter.
  pub(crate) fn reallocate_in<C: CacheSlot>(
    &self,
    slot: &mut C,
    ptr: NonNull<u8>,
    new_size: usize,
    align: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    let Some(old_size) = self.usable_size(ptr) else {
      crash!("realloc of {:p}, which the heap does not own", ptr);
    };
    if new_size <= old_size && new_size >= old_size / 2 {
      return Ok(ptr);
    }

    let lower_bound_to_grow = old_size + old_size / 4;
    let mut moved = None;
    if new_size > old_size && new_size < lower_bound_to_grow {
      moved = self.allocate_in(slot, lower_bound_to_grow, align).ok();
    }
    let moved = match moved {
      Some(p) => p,
      None => self.allocate_in(slot, new_size, align)?,
    };
    unsafe { ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), old_size.min(new_size)) };
    self.deallocate_in(slot, ptr);
    Ok(moved)
  }

  /// Bytes usable at `ptr`, or `None` for memory the heap does not own.
  pub fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
    let span = self.pagemap.get(ptr.as_ptr() as usize >> PAGE_SHIFT);
    if span.is_null() {
      return None;
    }
    let s = unsafe { &*span };
    match s.state {
      SpanState::InUseSmall(class) => Some(self.size_map().size_of(class as usize)),
      SpanState::InUseLarge => Some(s.bytes() - (ptr.as_ptr() as usize - s.start_addr())),
      _ => None,
    }
  }

  // ===========================================================================
  // Fallback cache
  // ===========================================================================

  /// Allocates through the shared fallback cache.
  pub fn fallback_allocate(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
    self.allocate_in(&mut Fallback(&self.fallback_cache), size, align)
  }

  /// # Safety
  /// `ptr` came from this heap and is not used afterwards.
  pub unsafe fn fallback_deallocate(&self, ptr: NonNull<u8>) {
    self.deallocate_in(&mut Fallback(&self.fallback_cache), ptr);
  }

  /// # Safety
  /// `ptr` came from this heap and is not used afterwards.
  pub unsafe fn fallback_reallocate(
    &self,
    ptr: NonNull<u8>,
    new_size: usize,
    align: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    self.reallocate_in(&mut Fallback(&self.fallback_cache), ptr, new_size, align)
  }

  pub(crate) fn fallback_slot(&self) -> Fallback<'_> {
    Fallback(&self.fallback_cache)
  }

  /// A private thread cache on this heap.
  pub fn cache(&self) -> CacheHandle<'_> {
    check!(self.is_inited(), "cache requested before init_early");
    CacheHandle {
      heap: self,
      cache: ThreadCache::new(),
    }
  }

  // ===========================================================================
  // Maintenance and introspection
  // ===========================================================================

  /// Returns every free span to the page heap and decommits every free page.
  /// Returns the number of pages decommitted.
  pub fn release_free_memory(&self) -> usize {
    thread_cache::flush(&mut self.fallback_slot(), self);
    let mut spans = 0;
    for class in 1..self.size_map().num_classes() {
      spans += self.central_cache[class].release_free(self);
    }
    let pages = {
      let mut g = self.lock_page_heap();
      g.heap.release_at_least(&mut g.env, usize::MAX)
    };
    log::debug!("tiermalloc: released {spans} central spans and {pages} pages");
    pages
  }

  pub fn stats(&self) -> HeapStats {
    let (page_heap, span_descriptors, sampled_objects) = {
      let g = self.lock_page_heap();
      (g.heap.stats(), g.env.spans.inuse(), g.registry.len())
    };
    let mut stats = HeapStats {
      page_heap,
      span_descriptors,
      sampled_objects,
      fallback_cache_bytes: self.fallback_cache.lock().size(),
      growth_events: self.growth_stacks.len(),
      heap_bytes: self.system.heap_bytes(),
      metadata_bytes: self.system.metadata_bytes(),
      unclaimed_cache_bytes: self.unclaimed_cache_space.load(Ordering::Relaxed),
      ..HeapStats::default()
    };
    for class in 1..self.size_map().num_classes() {
      let c = self.central_cache[class].stats();
      let free = c.free_objects + c.transfer_objects;
      stats.central_free_objects += free;
      stats.central_free_bytes += free * c.object_size;
      stats.outstanding_carved_objects += c.carved_objects - c.released_objects;
    }
    stats
  }

  /// Live sampled allocations, newest first.
  pub fn sampled_objects(&self) -> Vec<SampledObject> {
    loop {
      let expected = self.lock_page_heap().registry.len();
      // Reserved before locking: the heap may be the global allocator.
      let mut out = Vec::with_capacity(expected + 8);
      let g = self.lock_page_heap();
      if g.registry.len() > out.capacity() {
        drop(g);
        continue;
      }
      for span in g.registry.iter() {
        let s = unsafe { &*span };
        let trace = match NonNull::new(s.trace) {
          Some(record) => unsafe { record.as_ref().trace },
          None => StackTrace::empty(0),
        };
        out.push(SampledObject {
          address: s.start_addr(),
          allocated_bytes: s.bytes(),
          trace,
        });
      }
      return out;
    }
  }

  /// Stacks recorded at each heap growth, newest first.
  pub fn growth_stacks(&self) -> Vec<StackTrace> {
    self.growth_stacks.iter().copied().collect()
  }

  /// Checks the page heap's free lists against the page map and counters.
  pub fn verify(&self) -> Result<(), HeapCorruption> {
    let g = self.lock_page_heap();
    g.heap.verify(&self.pagemap)
  }
}

fn span_start(span: NonNull<Span>) -> NonNull<u8> {
  let addr = unsafe { span.as_ref() }.start_addr();
  match NonNull::new(addr as *mut u8) {
    Some(ptr) => ptr,
    None => crash!("span at address zero"),
  }
}

impl SpanSource for Static {
  fn acquire_small(&self, class: usize, pages: usize) -> Result<NonNull<Span>, AllocError> {
    let (span, grew) = {
      let mut g = self.lock_page_heap();
      let before = g.heap.stats().grow_count;
      let span = g.heap.acquire_span(&mut g.env, pages)?;
      unsafe {
        (*span.as_ptr()).state = SpanState::InUseSmall(class as u8);
        self.pagemap.set_all(span.as_ptr());
      }
      (span, g.heap.stats().grow_count != before)
    };
    if grew {
      self.log_growth();
    }
    Ok(span)
  }

  unsafe fn release_small(&self, span: NonNull<Span>) {
    let mut g = self.lock_page_heap();
    unsafe { g.heap.release_span(&mut g.env, span.as_ptr()) };
  }

  fn span_of(&self, obj: NonNull<u8>) -> *mut Span {
    self.pagemap.get(obj.as_ptr() as usize >> PAGE_SHIFT)
  }

  fn retained_empty_spans(&self) -> usize {
    if self.aggressive_decommit() { 0 } else { 1 }
  }
}

// =============================================================================
// Cache handles
// =============================================================================

/// A thread cache bound to one heap. Dropping it returns its objects and its
/// budget to the heap.
pub struct CacheHandle<'h> {
  heap: &'h Static,
  cache: ThreadCache,
}

impl CacheHandle<'_> {
  pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
    self.heap.allocate_in(&mut self.cache, size, 1)
  }

  pub fn allocate_aligned(&mut self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
    self.heap.allocate_in(&mut self.cache, size, align)
  }

  /// # Safety
  /// `ptr` came from this heap and is not used afterwards.
  pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
    self.heap.deallocate_in(&mut self.cache, ptr);
  }

  /// # Safety
  /// `ptr` came from this heap; on success it is not used afterwards.
  pub unsafe fn reallocate(
    &mut self,
    ptr: NonNull<u8>,
    new_size: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    self.heap.reallocate_in(&mut self.cache, ptr, new_size, 1)
  }

  pub fn usable_size(&self, ptr: NonNull<u8>) -> Option<usize> {
    self.heap.usable_size(ptr)
  }

  /// Trims idle objects back to the central lists.
  pub fn scavenge(&mut self) {
    thread_cache::scavenge(&mut self.cache, self.heap);
  }

  /// Returns every cached object to the central lists.
  pub fn flush(&mut self) {
    thread_cache::flush(&mut self.cache, self.heap);
  }

  pub fn cache(&self) -> &ThreadCache {
    &self.cache
  }
}

impl Drop for CacheHandle<'_> {
  fn drop(&mut self) {
    thread_cache::flush(&mut self.cache, self.heap);
  }
}
