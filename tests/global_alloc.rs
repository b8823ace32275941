//! The crate as the process-wide allocator.

use std::{collections::HashMap, thread};

use tiermalloc::Allocator;

#[global_allocator]
static GLOBAL: Allocator = Allocator;

#[test]
fn collections_work() {
  let mut map = HashMap::new();
  for i in 0..10_000u64 {
    map.insert(i, format!("value-{i}"));
  }
  assert_eq!(map.len(), 10_000);
  assert_eq!(map[&1234], "value-1234");

  let mut v: Vec<u64> = Vec::new();
  for i in 0..1_000_000 {
    v.push(i);
  }
  assert_eq!(v.iter().sum::<u64>(), 999_999 * 1_000_000 / 2);
  v.shrink_to_fit();
  drop(v);

  let big = vec![7u8; 8 << 20];
  assert!(big.iter().all(|&b| b == 7));
}

#[test]
fn over_aligned_layouts() {
  #[repr(align(4096))]
  struct Page([u8; 4096]);
  #[repr(align(64))]
  struct Line([u8; 64]);

  let pages: Vec<Box<Page>> = (0..16).map(|_| Box::new(Page([1; 4096]))).collect();
  let lines: Vec<Box<Line>> = (0..256).map(|_| Box::new(Line([2; 64]))).collect();
  for p in &pages {
    assert_eq!(&**p as *const Page as usize % 4096, 0);
  }
  for l in &lines {
    assert_eq!(&**l as *const Line as usize % 64, 0);
  }
}

#[test]
fn many_threads_allocate_and_exit() {
  let handles: Vec<_> = (0..16)
    .map(|t| {
      thread::spawn(move || {
        let mut strings = Vec::new();
        for i in 0..5_000 {
          strings.push(format!("{t}-{i}"));
          if i % 7 == 0 {
            strings.swap_remove(0);
          }
        }
        strings.len()
      })
    })
    .collect();
  for h in handles {
    assert!(h.join().unwrap() > 0);
  }
  tiermalloc::global_heap().verify().unwrap();
}

#[test]
fn introspection_reports_the_global_heap() {
  let keep: Vec<Vec<u8>> = (0..64).map(|i| vec![0u8; 1024 * (i + 1)]).collect();
  let stats = tiermalloc::heap_stats();
  assert!(stats.page_heap.in_use_pages > 0);
  assert!(stats.heap_bytes >= stats.page_heap.in_use_pages * tiermalloc::PAGE_SIZE);
  assert!(!tiermalloc::growth_stacks().is_empty());
  for obj in tiermalloc::sampled_objects() {
    assert!(obj.allocated_bytes >= obj.trace.size);
  }
  drop(keep);

  tiermalloc::flush_thread_cache();
  tiermalloc::release_free_memory();
  tiermalloc::global_heap().verify().unwrap();
}

#[test]
fn raw_entry_points() {
  unsafe {
    let p = tiermalloc::tier_malloc(0);
    assert!(!p.is_null());
    assert!(tiermalloc::tier_usable_size(p) > 0);
    tiermalloc::tier_free(p);
  }
}
