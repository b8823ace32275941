//! Reserved storage for components whose construction must be sequenced
//! explicitly rather than left to static-initialization order.

use core::{
  cell::UnsafeCell,
  mem::MaybeUninit,
  sync::atomic::{AtomicBool, Ordering},
};

pub struct StaticStorage<T> {
  claimed: AtomicBool,
  ready: AtomicBool,
  slot: UnsafeCell<MaybeUninit<T>>,
}

unsafe impl<T: Send + Sync> Sync for StaticStorage<T> {}
unsafe impl<T: Send> Send for StaticStorage<T> {}

impl<T> StaticStorage<T> {
  pub const fn new() -> Self {
    Self {
      claimed: AtomicBool::new(false),
      ready: AtomicBool::new(false),
      slot: UnsafeCell::new(MaybeUninit::uninit()),
    }
  }

  /// Moves `value` into the reserved slot. Constructing twice is fatal.
  pub fn construct(&self, value: T) -> &T {
    check!(
      !self.claimed.swap(true, Ordering::AcqRel),
      "component constructed twice"
    );
    let value = unsafe { (*self.slot.get()).write(value) };
    self.ready.store(true, Ordering::Release);
    value
  }

  #[inline]
  pub fn get(&self) -> Option<&T> {
    if self.ready.load(Ordering::Acquire) {
      Some(unsafe { (*self.slot.get()).assume_init_ref() })
    } else {
      None
    }
  }

  pub fn is_ready(&self) -> bool {
    self.ready.load(Ordering::Acquire)
  }

  /// # Safety
  /// The value must be constructed, and the caller must hold whatever lock
  /// guards it so no other reference to it is live.
  #[inline]
  #[allow(clippy::mut_from_ref)]
  pub unsafe fn get_mut_unchecked(&self) -> &mut T {
    debug_assert!(self.is_ready());
    unsafe { (*self.slot.get()).assume_init_mut() }
  }
}

impl<T> Default for StaticStorage<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> Drop for StaticStorage<T> {
  fn drop(&mut self) {
    if *self.ready.get_mut() {
      unsafe { self.slot.get_mut().assume_init_drop() };
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::rc::Rc;

  #[test]
  fn empty_until_constructed() {
    let storage: StaticStorage<u32> = StaticStorage::new();
    assert!(storage.get().is_none());
    assert_eq!(*storage.construct(5), 5);
    assert_eq!(storage.get(), Some(&5));
  }

  #[test]
  fn drops_constructed_value() {
    let witness = Rc::new(());
    {
      let storage = StaticStorage::new();
      storage.construct(Rc::clone(&witness));
      assert_eq!(Rc::strong_count(&witness), 2);
    }
    assert_eq!(Rc::strong_count(&witness), 1);
  }
}
