//! Keeping the allocator usable across `fork()`.
//!
//! Before a fork every registered heap takes all of its locks; after the fork
//! both parent and child release them. The child therefore starts with
//! consistent free lists even if another thread was inside the allocator when
//! the fork happened.

use core::{
  ptr::null_mut,
  sync::atomic::{AtomicBool, AtomicPtr, Ordering},
};

use crate::{error::ForkError, statics::Static};

pub type ForkHook = unsafe extern "C" fn();

/// Registers callbacks around `fork()`.
pub trait ForkNotifier {
  fn register(&self, prepare: ForkHook, parent: ForkHook, child: ForkHook) -> Result<(), ForkError>;
}

/// `pthread_atfork`. The hooks are process-wide, so they are registered once
/// however many heaps ask.
pub struct PthreadAtFork;

static PTHREAD_HOOKS_REGISTERED: AtomicBool = AtomicBool::new(false);

impl ForkNotifier for PthreadAtFork {
  fn register(&self, prepare: ForkHook, parent: ForkHook, child: ForkHook) -> Result<(), ForkError> {
    if PTHREAD_HOOKS_REGISTERED.swap(true, Ordering::AcqRel) {
      return Ok(());
    }
    let rc = unsafe { libc::pthread_atfork(Some(prepare), Some(parent), Some(child)) };
    if rc == 0 {
      Ok(())
    } else {
      PTHREAD_HOOKS_REGISTERED.store(false, Ordering::Release);
      Err(ForkError::Registration(rc))
    }
  }
}

/// Registers nothing.
pub struct NoFork;

impl ForkNotifier for NoFork {
  fn register(&self, _: ForkHook, _: ForkHook, _: ForkHook) -> Result<(), ForkError> {
    Ok(())
  }
}

/// Platforms where fork hooks are not installed, and why.
pub const PLATFORM_ATFORK_SKIP: &[(&str, &str)] = &[
  ("macos", "fork is handled by the malloc zone integration"),
  ("ios", "fork is handled by the malloc zone integration"),
  ("windows", "there is no fork"),
  ("freebsd", "pthread_atfork cannot be called this early"),
  ("aix", "pthread_atfork cannot be called this early"),
];

/// Why hooks are not installed on `os`, if they are not.
pub fn skip_reason(os: &str) -> Option<&'static str> {
  if cfg!(feature = "no-atfork") {
    return Some("disabled by the no-atfork feature");
  }
  PLATFORM_ATFORK_SKIP
    .iter()
    .find(|(name, _)| *name == os)
    .map(|&(_, reason)| reason)
}

cfg_if::cfg_if! {
  if #[cfg(unix)] {
    pub type PlatformNotifier = PthreadAtFork;

    pub fn platform_notifier() -> PlatformNotifier {
      PthreadAtFork
    }
  } else {
    pub type PlatformNotifier = NoFork;

    pub fn platform_notifier() -> PlatformNotifier {
      NoFork
    }
  }
}

// =============================================================================
// Hooks
// =============================================================================

/// Heaps the hooks act on, locked in slot order.
const MAX_FORK_TARGETS: usize = 16;

static FORK_TARGETS: [AtomicPtr<Static>; MAX_FORK_TARGETS] =
  [const { AtomicPtr::new(null_mut()) }; MAX_FORK_TARGETS];

pub(crate) fn add_target(heap: &'static Static) -> Result<(), ForkError> {
  let ptr = heap as *const Static as *mut Static;
  for slot in FORK_TARGETS.iter() {
    let cur = slot.load(Ordering::Acquire);
    if cur == ptr {
      return Ok(());
    }
    if cur.is_null()
      && slot
        .compare_exchange(null_mut(), ptr, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
      return Ok(());
    }
  }
  Err(ForkError::TooManyHeaps(MAX_FORK_TARGETS))
}

pub(crate) unsafe extern "C" fn prepare_fork() {
  for slot in FORK_TARGETS.iter() {
    let heap = slot.load(Ordering::Acquire);
    if heap.is_null() {
      break;
    }
    unsafe { (*heap).lock_all() };
  }
}

pub(crate) unsafe extern "C" fn after_fork() {
  for slot in FORK_TARGETS.iter().rev() {
    let heap = slot.load(Ordering::Acquire);
    if !heap.is_null() {
      unsafe { (*heap).unlock_all() };
    }
  }
}
