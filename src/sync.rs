//! Spin locks that never allocate.
//!
//! Every allocator lock is one of these. The fork protocol needs to take and
//! release locks without guards, so the raw `lock_raw`/`unlock_raw` pair is
//! public next to the guard API.

use core::{
  cell::UnsafeCell,
  hint,
  ops::{Deref, DerefMut},
  sync::atomic::{AtomicBool, Ordering},
};

/// Spins before yielding the CPU to the scheduler.
const SPINS_BEFORE_YIELD: u32 = 64;

pub struct SpinLock {
  locked: AtomicBool,
}

impl SpinLock {
  pub const fn new() -> Self {
    Self {
      locked: AtomicBool::new(false),
    }
  }

  #[inline]
  pub fn lock(&self) -> SpinLockGuard<'_> {
    self.lock_raw();
    SpinLockGuard { lock: self }
  }

  #[inline]
  pub fn lock_raw(&self) {
    let mut spins = 0u32;
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        if spins < SPINS_BEFORE_YIELD {
          spins += 1;
          hint::spin_loop();
        } else {
          std::thread::yield_now();
        }
      }
    }
  }

  #[inline]
  pub fn try_lock_raw(&self) -> bool {
    self
      .locked
      .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_ok()
  }

  /// # Safety
  /// The caller must hold the lock, acquired through `lock_raw` or
  /// `try_lock_raw` (possibly in a parent process before `fork`).
  #[inline]
  pub unsafe fn unlock_raw(&self) {
    self.locked.store(false, Ordering::Release);
  }

  pub fn is_locked(&self) -> bool {
    self.locked.load(Ordering::Relaxed)
  }
}

impl Default for SpinLock {
  fn default() -> Self {
    Self::new()
  }
}

pub struct SpinLockGuard<'a> {
  lock: &'a SpinLock,
}

impl Drop for SpinLockGuard<'_> {
  #[inline]
  fn drop(&mut self) {
    unsafe { self.lock.unlock_raw() };
  }
}

/// A `SpinLock` owning the data it protects.
pub struct SpinMutex<T> {
  lock: SpinLock,
  data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinMutex<T> {}
unsafe impl<T: Send> Send for SpinMutex<T> {}

impl<T> SpinMutex<T> {
  pub const fn new(value: T) -> Self {
    Self {
      lock: SpinLock::new(),
      data: UnsafeCell::new(value),
    }
  }

  #[inline]
  pub fn lock(&self) -> SpinMutexGuard<'_, T> {
    self.lock.lock_raw();
    SpinMutexGuard { mutex: self }
  }

  /// The underlying lock, for the fork protocol.
  pub fn raw(&self) -> &SpinLock {
    &self.lock
  }

  pub fn get_mut(&mut self) -> &mut T {
    self.data.get_mut()
  }
}

pub struct SpinMutexGuard<'a, T> {
  mutex: &'a SpinMutex<T>,
}

impl<T> Deref for SpinMutexGuard<'_, T> {
  type Target = T;

  fn deref(&self) -> &T {
    unsafe { &*self.mutex.data.get() }
  }
}

impl<T> DerefMut for SpinMutexGuard<'_, T> {
  fn deref_mut(&mut self) -> &mut T {
    unsafe { &mut *self.mutex.data.get() }
  }
}

impl<T> Drop for SpinMutexGuard<'_, T> {
  #[inline]
  fn drop(&mut self) {
    unsafe { self.mutex.lock.unlock_raw() };
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  #[test]
  fn guard_releases_on_drop() {
    let lock = SpinLock::new();
    {
      let _g = lock.lock();
      assert!(lock.is_locked());
      assert!(!lock.try_lock_raw());
    }
    assert!(!lock.is_locked());
    assert!(lock.try_lock_raw());
    unsafe { lock.unlock_raw() };
  }

  #[test]
  fn mutex_serializes_increments() {
    let counter = Arc::new(SpinMutex::new(0usize));
    let threads: Vec<_> = (0..4)
      .map(|_| {
        let counter = Arc::clone(&counter);
        std::thread::spawn(move || {
          for _ in 0..10_000 {
            *counter.lock() += 1;
          }
        })
      })
      .collect();
    for t in threads {
      t.join().unwrap();
    }
    assert_eq!(*counter.lock(), 40_000);
  }
}
