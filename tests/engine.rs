//! Private heaps driven through cache handles, from several threads.

use std::{
  ptr::NonNull,
  sync::{Barrier, mpsc},
  thread,
};

use tiermalloc::{AllocError, Config, CountingSystem, PAGE_SIZE, Static};

fn new_heap(config: Config) -> (&'static Static, &'static CountingSystem) {
  let system: &'static CountingSystem = Box::leak(Box::new(CountingSystem::new()));
  let heap: &'static Static = Box::leak(Box::new(Static::new(config, system)));
  heap.init_early().unwrap();
  (heap, system)
}

fn unsampled() -> Config {
  Config::default()
    .with_sample_parameter(0)
    .with_aggressive_decommit(false)
}

/// Deterministic sizes without pulling in an RNG crate.
struct Lcg(u64);

impl Lcg {
  fn next(&mut self) -> u64 {
    self.0 = self
      .0
      .wrapping_mul(6364136223846793005)
      .wrapping_add(1442695040888963407);
    self.0 >> 33
  }

  fn size(&mut self) -> usize {
    match self.next() % 16 {
      0 => 32 * 1024 + (self.next() % (512 * 1024)) as usize,
      1..=3 => 1024 + (self.next() % 8192) as usize,
      _ => 1 + (self.next() % 512) as usize,
    }
  }
}

#[test]
fn threads_share_one_heap() {
  let (heap, _) = new_heap(unsampled());
  let handles: Vec<_> = (0..8)
    .map(|t| {
      thread::spawn(move || {
        let mut cache = heap.cache();
        let mut rng = Lcg(t as u64 + 1);
        let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
        for i in 0..20_000 {
          if live.len() > 200 || (i % 3 == 0 && !live.is_empty()) {
            let (p, size, tag) = live.swap_remove(rng.next() as usize % live.len());
            unsafe {
              assert_eq!(*p.as_ptr(), tag);
              assert_eq!(*p.as_ptr().add(size - 1), tag);
              cache.deallocate(p);
            }
          } else {
            let size = rng.size();
            let p = cache.allocate(size).unwrap();
            let tag = (i % 251) as u8;
            unsafe { std::ptr::write_bytes(p.as_ptr(), tag, size) };
            live.push((p, size, tag));
          }
        }
        for (p, _, _) in live {
          unsafe { cache.deallocate(p) };
        }
      })
    })
    .collect();
  for h in handles {
    h.join().unwrap();
  }

  heap.verify().unwrap();
  heap.release_free_memory();
  let stats = heap.stats();
  assert_eq!(stats.page_heap.in_use_pages, 0);
  assert_eq!(stats.central_free_objects, 0);
  heap.verify().unwrap();
}

#[test]
fn objects_freed_on_another_thread() {
  let (heap, _) = new_heap(unsampled());
  let (tx, rx) = mpsc::channel::<Vec<usize>>();
  let producer = thread::spawn(move || {
    let mut cache = heap.cache();
    for round in 0..50 {
      let batch = (0..100)
        .map(|i| cache.allocate(16 + (round + i) % 200).unwrap().as_ptr() as usize)
        .collect();
      tx.send(batch).unwrap();
    }
  });
  let consumer = thread::spawn(move || {
    let mut cache = heap.cache();
    for batch in rx {
      for addr in batch {
        unsafe { cache.deallocate(NonNull::new(addr as *mut u8).unwrap()) };
      }
    }
  });
  producer.join().unwrap();
  consumer.join().unwrap();

  let stats = heap.stats();
  assert_eq!(stats.outstanding_carved_objects, stats.central_free_objects);
  heap.verify().unwrap();
}

#[test]
fn carved_objects_are_live_or_free() {
  let (heap, _) = new_heap(unsampled());
  let mut live = Vec::new();
  {
    let mut cache = heap.cache();
    for i in 0..5_000 {
      let p = cache.allocate(8 + (i % 64) * 8).unwrap();
      if i % 2 == 0 {
        unsafe { cache.deallocate(p) };
      } else {
        live.push(p);
      }
    }
  }
  let stats = heap.stats();
  assert_eq!(
    stats.outstanding_carved_objects,
    live.len() + stats.central_free_objects
  );

  let mut cache = heap.cache();
  for p in live {
    unsafe { cache.deallocate(p) };
  }
  cache.flush();
  let stats = heap.stats();
  assert_eq!(stats.outstanding_carved_objects, stats.central_free_objects);
}

#[test]
fn aggressive_decommit_returns_freed_pages() {
  let (heap, system) = new_heap(unsampled().with_aggressive_decommit(true));
  let mut cache = heap.cache();
  let p = cache.allocate(1 << 20).unwrap();
  unsafe { cache.deallocate(p) };
  let stats = heap.stats().page_heap;
  assert_eq!(stats.free_pages, 0);
  assert_eq!(stats.decommitted_pages, (1 << 20) / PAGE_SIZE);
  assert!(system.decommit_calls() > 0);

  // Reused decommitted memory is recommitted first.
  let q = cache.allocate(1 << 20).unwrap();
  assert!(system.recommit_calls() > 0);
  unsafe {
    std::ptr::write_bytes(q.as_ptr(), 1, 1 << 20);
    cache.deallocate(q);
  }
  heap.verify().unwrap();
}

#[test]
fn small_spans_go_back_under_aggressive_decommit() {
  let (heap, _) = new_heap(unsampled().with_aggressive_decommit(true));
  let mut cache = heap.cache();
  let ptrs: Vec<_> = (0..1_000).map(|_| cache.allocate(64).unwrap()).collect();
  assert!(heap.stats().page_heap.in_use_pages > 0);
  for p in ptrs {
    unsafe { cache.deallocate(p) };
  }
  drop(cache);

  let stats = heap.stats();
  assert_eq!(stats.page_heap.in_use_pages, 0);
  assert_eq!(stats.page_heap.free_pages, 0);
  assert!(stats.page_heap.decommitted_pages > 0);
  assert_eq!(stats.central_free_objects, 0);
  assert_eq!(stats.outstanding_carved_objects, 0);
  heap.verify().unwrap();
}

#[test]
fn threads_working_one_class_keep_objects_accounted() {
  const THREADS: usize = 4;
  let (heap, _) = new_heap(unsampled());
  let start = &Barrier::new(THREADS);
  let live: Vec<usize> = thread::scope(|s| {
    let workers: Vec<_> = (0..THREADS)
      .map(|_| {
        s.spawn(move || {
          let mut cache = heap.cache();
          start.wait();
          let mut ptrs: Vec<_> = (0..500).map(|_| cache.allocate(48).unwrap()).collect();
          let kept = ptrs.split_off(ptrs.len() / 2);
          for p in ptrs {
            unsafe { cache.deallocate(p) };
          }
          kept.iter().map(|p| p.as_ptr() as usize).collect::<Vec<_>>()
        })
      })
      .collect();
    workers
      .into_iter()
      .flat_map(|w| w.join().unwrap())
      .collect()
  });

  // Every handle flushed on drop: objects are either live or central.
  let stats = heap.stats();
  assert_eq!(live.len(), THREADS * 250);
  assert_eq!(
    stats.outstanding_carved_objects,
    live.len() + stats.central_free_objects
  );
  heap.verify().unwrap();

  let mut cache = heap.cache();
  for addr in live {
    unsafe { cache.deallocate(NonNull::new(addr as *mut u8).unwrap()) };
  }
  cache.flush();
  let stats = heap.stats();
  assert_eq!(stats.outstanding_carved_objects, stats.central_free_objects);
  heap.verify().unwrap();
}

#[test]
fn exhausted_system_is_an_error() {
  let (heap, system) = new_heap(unsampled());
  system.set_limit(system.grown_bytes());
  let mut cache = heap.cache();
  assert!(matches!(
    cache.allocate(1 << 20),
    Err(AllocError::OutOfMemory { .. })
  ));
  assert!(matches!(
    cache.allocate(64),
    Err(AllocError::OutOfMemory { .. })
  ));
  heap.verify().unwrap();

  system.set_limit(usize::MAX);
  let p = cache.allocate(64).unwrap();
  unsafe { cache.deallocate(p) };
}

#[test]
fn sampled_objects_follow_their_lifetime() {
  let (heap, _) = new_heap(unsampled().with_sample_parameter(4096));
  let mut cache = heap.cache();
  let ptrs: Vec<_> = (0..2_000).map(|_| cache.allocate(256).unwrap()).collect();

  let sampled = heap.sampled_objects();
  assert!(!sampled.is_empty());
  assert_eq!(sampled.len(), heap.stats().sampled_objects);
  for obj in &sampled {
    assert!(ptrs.iter().any(|p| p.as_ptr() as usize == obj.address));
    assert_eq!(obj.trace.size, 256);
    assert!(obj.allocated_bytes >= PAGE_SIZE);
  }

  for p in ptrs {
    unsafe { cache.deallocate(p) };
  }
  assert!(heap.sampled_objects().is_empty());
  heap.verify().unwrap();
}

#[test]
fn cache_budget_is_shared() {
  let (heap, _) = new_heap(unsampled().with_max_total_thread_cache_bytes(1 << 20));
  assert_eq!(heap.stats().unclaimed_cache_bytes, 1 << 20);
  {
    let mut cache = heap.cache();
    let p = cache.allocate(32).unwrap();
    assert_eq!(heap.stats().unclaimed_cache_bytes, (1 << 20) - (64 << 10));
    assert_eq!(cache.cache().max_size(), 64 << 10);
    unsafe { cache.deallocate(p) };
  }
  assert_eq!(heap.stats().unclaimed_cache_bytes, 1 << 20);
}

#[test]
fn fallback_cache_is_safe_to_share() {
  let (heap, _) = new_heap(unsampled());
  let handles: Vec<_> = (0..4)
    .map(|t| {
      thread::spawn(move || {
        let mut rng = Lcg(100 + t);
        for _ in 0..2_000 {
          let ptrs: Vec<_> = (0..8)
            .map(|_| heap.fallback_allocate(rng.size(), 8).unwrap())
            .collect();
          for p in ptrs {
            unsafe { heap.fallback_deallocate(p) };
          }
        }
      })
    })
    .collect();
  for h in handles {
    h.join().unwrap();
  }
  heap.verify().unwrap();
}

#[test]
fn heaps_are_independent() {
  let (a, sys_a) = new_heap(unsampled());
  let (b, sys_b) = new_heap(unsampled());
  let mut ca = a.cache();
  let p = ca.allocate(100).unwrap();
  assert!(b.usable_size(p).is_none());
  assert!(sys_a.grown_bytes() > sys_b.grown_bytes());
  unsafe { ca.deallocate(p) };
}
