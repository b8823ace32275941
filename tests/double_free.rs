//! Freeing the same object twice aborts instead of corrupting a cache list.
#![cfg(target_os = "linux")]

use tiermalloc::{Config, MmapSystem, Static};

static SYSTEM: MmapSystem = MmapSystem;

fn exit_signal(child: impl FnOnce()) -> Option<i32> {
  let pid = unsafe { libc::fork() };
  assert!(pid >= 0, "fork failed");
  if pid == 0 {
    child();
    unsafe { libc::_exit(0) };
  }
  let mut status = 0;
  let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
  assert_eq!(waited, pid);
  libc::WIFSIGNALED(status).then(|| libc::WTERMSIG(status))
}

#[test]
fn repeated_free_of_cached_object_aborts() {
  let heap: &'static Static = Box::leak(Box::new(Static::new(
    Config::default().with_sample_parameter(0),
    &SYSTEM,
  )));
  heap.init_early().unwrap();

  let signal = exit_signal(|| {
    let mut cache = heap.cache();
    let p = cache.allocate(64).unwrap();
    unsafe {
      cache.deallocate(p);
      cache.deallocate(p);
    }
  });
  assert_eq!(signal, Some(libc::SIGABRT));
}

#[test]
fn single_frees_exit_cleanly() {
  let heap: &'static Static = Box::leak(Box::new(Static::new(
    Config::default().with_sample_parameter(0),
    &SYSTEM,
  )));
  heap.init_early().unwrap();

  let signal = exit_signal(|| {
    let mut cache = heap.cache();
    let p = cache.allocate(64).unwrap();
    let q = cache.allocate(64).unwrap();
    unsafe {
      cache.deallocate(p);
      cache.deallocate(q);
    }
  });
  assert_eq!(signal, None);
}
