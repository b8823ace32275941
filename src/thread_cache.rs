//! Per-thread object caches.
//!
//! A cache keeps one LIFO list per size class. Lists refill from and spill to
//! the central free lists in batches, and adapt their length limits to the
//! thread's behaviour: a list that keeps running dry is allowed to grow, a
//! list that keeps overflowing or sits idle is trimmed. All caches share one
//! byte budget; a cache that hits its own limit scavenges and then tries to
//! take a little more of the shared budget.
//!
//! The flows (`allocate`, `deallocate`, `scavenge`, `flush`) reach the cache
//! only through `CacheSlot::with` and never call into a central list from
//! inside it. For the shared fallback cache `with` takes the fallback lock,
//! so that lock is never held across a central list operation.

use core::{
  ptr::{NonNull, null_mut},
  sync::atomic::{AtomicIsize, AtomicU64, Ordering},
};

use crate::{
  error::AllocError,
  sampler::Sampler,
  size_class::{MAX_CLASSES, MAX_SIZE},
  span::{Batch, FreeObject},
  statics::Static,
  sync::SpinMutex,
};

/// Budget a cache gets when the shared pool is exhausted.
pub const MIN_THREAD_CACHE_SIZE: usize = MAX_SIZE * 2;
/// A single cache never grows past this.
pub const MAX_THREAD_CACHE_SIZE: usize = 4 << 20;
/// Budget moved from the shared pool at a time.
pub const STEAL_AMOUNT: usize = 64 << 10;
/// Longest a list may become through slow start.
pub const MAX_DYNAMIC_FREE_LIST_LENGTH: usize = 8192;
/// Overflows tolerated before a list's limit shrinks.
const MAX_OVERAGES: usize = 3;
/// Deallocations between periodic scavenges.
pub const SCAVENGE_INTERVAL: usize = 16384;

static SEED: AtomicU64 = AtomicU64::new(0x9E37_79B9_7F4A_7C15);

struct FreeList {
  head: *mut FreeObject,
  length: usize,
  lowater: usize,
  max_length: usize,
  overages: usize,
}

impl FreeList {
  const fn new() -> Self {
    Self {
      head: null_mut(),
      length: 0,
      lowater: 0,
      max_length: 1,
      overages: 0,
    }
  }

  /// Freeing the object at the head twice in a row is caught here. Other
  /// double frees surface when the object reaches its central list.
  #[inline]
  fn push(&mut self, obj: NonNull<u8>) {
    let node = obj.as_ptr() as *mut FreeObject;
    check!(node != self.head, "double free of {:p}", obj);
    unsafe { (*node).next = self.head };
    self.head = node;
    self.length += 1;
  }

  #[inline]
  fn pop(&mut self) -> Option<NonNull<u8>> {
    let obj = NonNull::new(self.head)?;
    self.head = unsafe { (*obj.as_ptr()).next };
    self.length -= 1;
    if self.length < self.lowater {
      self.lowater = self.length;
    }
    Some(obj.cast())
  }

  fn take(&mut self, n: usize) -> Batch {
    let mut batch = Batch::new();
    for _ in 0..n {
      let Some(obj) = self.pop() else { break };
      unsafe { batch.push(obj) };
    }
    batch
  }

  fn push_batch(&mut self, batch: Batch) {
    self.length += batch.len();
    self.head = unsafe { batch.prepend_to(self.head) };
  }
}

pub struct ThreadCache {
  lists: [FreeList; MAX_CLASSES],
  /// Bytes held across all lists.
  size: usize,
  max_size: usize,
  deallocs: usize,
  sampler: Sampler,
  initialized: bool,
}

unsafe impl Send for ThreadCache {}

impl ThreadCache {
  pub const fn new() -> Self {
    Self {
      lists: [const { FreeList::new() }; MAX_CLASSES],
      size: 0,
      max_size: 0,
      deallocs: 0,
      sampler: Sampler::new(),
      initialized: false,
    }
  }

  /// Claims a budget and seeds the sampler on first use.
  #[inline]
  pub(crate) fn ensure_init(&mut self, heap: &Static) {
    if self.initialized {
      return;
    }
    self.initialized = true;
    let pool = heap.cache_pool();
    self.max_size = if pool.load(Ordering::Relaxed) > 0 {
      pool.fetch_sub(STEAL_AMOUNT as isize, Ordering::Relaxed);
      STEAL_AMOUNT
    } else {
      pool.fetch_sub(MIN_THREAD_CACHE_SIZE as isize, Ordering::Relaxed);
      MIN_THREAD_CACHE_SIZE
    };
    let seed = SEED.fetch_add(0x6A09_E667_F3BC_C909, Ordering::Relaxed) ^ (self as *const Self as u64);
    self.sampler.init(seed, heap.config().sample_parameter);
  }

  /// Bytes cached.
  pub fn size(&self) -> usize {
    self.size
  }

  pub fn max_size(&self) -> usize {
    self.max_size
  }

  pub fn list_length(&self, class: usize) -> usize {
    self.lists[class].length
  }

  pub fn max_length(&self, class: usize) -> usize {
    self.lists[class].max_length
  }

  /// Objects cached across all classes.
  pub fn objects(&self) -> usize {
    self.lists.iter().map(|l| l.length).sum()
  }

  /// Accounts an allocation of `size` bytes with the sampler.
  #[inline]
  pub(crate) fn should_sample(&mut self, size: usize) -> bool {
    self.sampler.record(size)
  }

  #[inline]
  fn pop(&mut self, class: usize, size: usize) -> Option<NonNull<u8>> {
    let obj = self.lists[class].pop()?;
    self.size -= size;
    Some(obj)
  }

  fn refill_count(&self, class: usize, batch_size: usize) -> usize {
    self.lists[class].max_length.min(batch_size)
  }

  /// Stores a refill and lets the list grow: one object at a time up to a
  /// batch, then whole batches.
  fn absorb(&mut self, class: usize, size: usize, batch_size: usize, batch: Batch) {
    let list = &mut self.lists[class];
    self.size += batch.len() * size;
    list.push_batch(batch);
    if list.max_length < batch_size {
      list.max_length += 1;
    } else {
      let mut new_length = (list.max_length + batch_size).min(MAX_DYNAMIC_FREE_LIST_LENGTH);
      new_length -= new_length % batch_size;
      list.max_length = new_length;
    }
  }

  /// Caches a freed object. Returns the batch to spill, if the list grew too
  /// long, and whether a scavenge is due.
  fn push(
    &mut self,
    class: usize,
    size: usize,
    batch_size: usize,
    obj: NonNull<u8>,
  ) -> (Option<Batch>, bool) {
    let list = &mut self.lists[class];
    list.push(obj);
    self.size += size;

    let mut spill = None;
    if list.length > list.max_length {
      let n = batch_size.min(list.length);
      spill = Some(list.take(n));
      self.size -= n * size;
      if list.max_length < batch_size {
        list.max_length += 1;
      } else if list.max_length > batch_size {
        list.overages += 1;
        if list.overages > MAX_OVERAGES {
          list.max_length -= batch_size;
          list.overages = 0;
        }
      }
    }

    self.deallocs += 1;
    let tick = self.deallocs >= SCAVENGE_INTERVAL;
    if tick {
      self.deallocs = 0;
    }
    (spill, tick || self.size > self.max_size)
  }

  /// Releases half of what a list never dipped into since the last scavenge.
  fn scavenge_class(&mut self, class: usize, size: usize, batch_size: usize) -> Option<Batch> {
    let list = &mut self.lists[class];
    let lowmark = list.lowater;
    let mut out = None;
    if lowmark > 0 {
      let drop = if lowmark > 1 { lowmark / 2 } else { 1 };
      let batch = list.take(drop);
      self.size -= batch.len() * size;
      out = Some(batch);
      if list.max_length > batch_size {
        list.max_length = (list.max_length - batch_size).max(batch_size);
      }
    }
    list.lowater = list.length;
    out
  }

  fn drain(&mut self, class: usize, size: usize) -> Batch {
    let list = &mut self.lists[class];
    let batch = list.take(list.length);
    list.lowater = 0;
    self.size -= batch.len() * size;
    batch
  }

  fn grow_budget(&mut self, pool: &AtomicIsize) {
    if self.max_size + STEAL_AMOUNT > MAX_THREAD_CACHE_SIZE {
      return;
    }
    if pool.load(Ordering::Relaxed) > 0 {
      pool.fetch_sub(STEAL_AMOUNT as isize, Ordering::Relaxed);
      self.max_size += STEAL_AMOUNT;
    }
  }

  fn return_budget(&mut self, pool: &AtomicIsize) {
    if self.initialized {
      pool.fetch_add(self.max_size as isize, Ordering::Relaxed);
      self.max_size = 0;
      self.initialized = false;
    }
  }
}

impl Default for ThreadCache {
  fn default() -> Self {
    Self::new()
  }
}

// =============================================================================
// Access
// =============================================================================

/// A cache reachable for one short, central-free critical section.
pub(crate) trait CacheSlot {
  fn with<R>(&mut self, f: impl FnOnce(&mut ThreadCache) -> R) -> R;
}

impl CacheSlot for ThreadCache {
  #[inline]
  fn with<R>(&mut self, f: impl FnOnce(&mut ThreadCache) -> R) -> R {
    f(self)
  }
}

/// The shared cache behind the fallback lock.
pub(crate) struct Fallback<'a>(pub &'a SpinMutex<ThreadCache>);

impl CacheSlot for Fallback<'_> {
  #[inline]
  fn with<R>(&mut self, f: impl FnOnce(&mut ThreadCache) -> R) -> R {
    let mut cache = self.0.lock();
    f(&mut cache)
  }
}

// =============================================================================
// Flows
// =============================================================================

pub(crate) fn allocate<C: CacheSlot>(
  slot: &mut C,
  heap: &Static,
  class: usize,
) -> Result<NonNull<u8>, AllocError> {
  let size = heap.size_map().size_of(class);
  if let Some(obj) = slot.with(|c| {
    c.ensure_init(heap);
    c.pop(class, size)
  }) {
    return Ok(obj);
  }
  fetch_from_central(slot, heap, class)
}

fn fetch_from_central<C: CacheSlot>(
  slot: &mut C,
  heap: &Static,
  class: usize,
) -> Result<NonNull<u8>, AllocError> {
  let map = heap.size_map();
  let size = map.size_of(class);
  let batch_size = map.num_objects_to_move(class);
  let n = slot.with(|c| c.refill_count(class, batch_size));

  let mut batch = heap.central(class).remove_range(heap, n)?;
  let Some(obj) = batch.pop() else {
    crash!("central list for class {} returned an empty batch", class);
  };
  slot.with(|c| c.absorb(class, size, batch_size, batch));
  Ok(obj)
}

pub(crate) fn deallocate<C: CacheSlot>(slot: &mut C, heap: &Static, class: usize, obj: NonNull<u8>) {
  let map = heap.size_map();
  let size = map.size_of(class);
  let batch_size = map.num_objects_to_move(class);
  let (spill, scavenge_due) = slot.with(|c| {
    c.ensure_init(heap);
    c.push(class, size, batch_size, obj)
  });
  if let Some(batch) = spill {
    release_to_central(heap, class, batch);
  }
  if scavenge_due {
    scavenge(slot, heap);
  }
}

/// Trims every list by half its low-water mark, then asks the shared pool
/// for more budget.
pub(crate) fn scavenge<C: CacheSlot>(slot: &mut C, heap: &Static) {
  let map = heap.size_map();
  let mut released = 0;
  for class in 1..map.num_classes() {
    let size = map.size_of(class);
    let batch_size = map.num_objects_to_move(class);
    if let Some(batch) = slot.with(|c| c.scavenge_class(class, size, batch_size)) {
      released += batch.len();
      release_to_central(heap, class, batch);
    }
  }
  let budget = slot.with(|c| {
    c.grow_budget(heap.cache_pool());
    c.max_size()
  });
  log::trace!("tiermalloc: scavenged {released} objects, cache budget {budget} bytes");
}

/// Returns every cached object and the cache's budget.
pub(crate) fn flush<C: CacheSlot>(slot: &mut C, heap: &Static) {
  let map = heap.size_map();
  for class in 1..map.num_classes() {
    let size = map.size_of(class);
    let batch = slot.with(|c| c.drain(class, size));
    release_to_central(heap, class, batch);
  }
  slot.with(|c| c.return_budget(heap.cache_pool()));
}

fn release_to_central(heap: &Static, class: usize, mut batch: Batch) {
  let batch_size = heap.size_map().num_objects_to_move(class);
  let central = heap.central(class);
  while batch.len() > batch_size {
    central.insert_range(heap, batch.split_front(batch_size));
  }
  central.insert_range(heap, batch);
}

#[cfg(test)]
mod tests {
  use super::*;

  fn objects(n: usize) -> Vec<Box<[usize; 4]>> {
    (0..n).map(|_| Box::new([0; 4])).collect()
  }

  fn ptr(b: &mut [usize; 4]) -> NonNull<u8> {
    NonNull::from(b).cast()
  }

  #[test]
  fn slow_start_grows_one_then_batches() {
    let mut cache = ThreadCache::new();
    let mut objs = objects(200);
    let mut it = objs.iter_mut();
    for expected in 2..=32 {
      let mut batch = Batch::new();
      unsafe { batch.push(ptr(it.next().unwrap())) };
      cache.absorb(3, 32, 32, batch);
      assert_eq!(cache.max_length(3), expected);
    }
    let mut batch = Batch::new();
    unsafe { batch.push(ptr(it.next().unwrap())) };
    cache.absorb(3, 32, 32, batch);
    assert_eq!(cache.max_length(3), 64);
    assert_eq!(cache.list_length(3), 32);
    assert_eq!(cache.size(), 32 * 32);
  }

  #[test]
  fn overflowing_list_spills_one_batch() {
    let mut cache = ThreadCache::new();
    cache.max_size = usize::MAX;
    let mut objs = objects(8);
    let mut spilled = 0;
    for obj in objs.iter_mut() {
      let (spill, _) = cache.push(2, 16, 4, ptr(obj));
      spilled += spill.map_or(0, |b| b.len());
    }
    assert_eq!(spilled + cache.list_length(2), 8);
    assert!(cache.list_length(2) <= cache.max_length(2));
    assert_eq!(cache.size(), cache.list_length(2) * 16);
  }

  #[test]
  fn scavenge_releases_half_the_low_water_mark() {
    let mut cache = ThreadCache::new();
    cache.max_size = usize::MAX;
    cache.lists[4].max_length = 100;
    let mut objs = objects(10);
    for obj in objs.iter_mut() {
      let _ = cache.push(4, 48, 32, ptr(obj));
    }
    // Never dipped into since the list was filled.
    cache.lists[4].lowater = 10;
    let batch = cache.scavenge_class(4, 48, 32).unwrap();
    assert_eq!(batch.len(), 5);
    assert_eq!(cache.list_length(4), 5);
    assert_eq!(cache.size(), 5 * 48);
    assert_eq!(cache.max_length(4), 68);

    // Used since: low-water mark now tracks pops.
    cache.pop(4, 48).unwrap();
    cache.pop(4, 48).unwrap();
    let batch = cache.scavenge_class(4, 48, 32).unwrap();
    assert_eq!(batch.len(), 1);
    assert_eq!(cache.list_length(4), 2);
  }

  #[test]
  fn budget_goes_back_to_the_pool() {
    let pool = AtomicIsize::new(STEAL_AMOUNT as isize);
    let mut cache = ThreadCache::new();
    cache.initialized = true;
    cache.max_size = STEAL_AMOUNT;
    cache.grow_budget(&pool);
    assert_eq!(cache.max_size(), 2 * STEAL_AMOUNT);
    assert_eq!(pool.load(Ordering::Relaxed), 0);
    cache.grow_budget(&pool);
    assert_eq!(cache.max_size(), 2 * STEAL_AMOUNT);
    cache.return_budget(&pool);
    assert_eq!(pool.load(Ordering::Relaxed), 2 * STEAL_AMOUNT as isize);
  }
}
