//! Page number to span lookup.
//!
//! A two-level radix tree over the 35-bit page numbers of a 48-bit address
//! space. The root is allocated at init, leaves on demand when the heap grows
//! into a new region. Reads are plain atomic loads; writes happen under the
//! page-heap lock.

use core::{
  mem::size_of,
  ptr::null_mut,
  sync::atomic::{AtomicPtr, Ordering},
};

use crate::{
  PAGE_SHIFT,
  span::{PageId, Span},
  system::SysAlloc,
};

const ADDRESS_BITS: usize = 48;
const PAGE_ID_BITS: usize = ADDRESS_BITS - PAGE_SHIFT;
const ROOT_BITS: usize = 15;
const LEAF_BITS: usize = PAGE_ID_BITS - ROOT_BITS;
const ROOT_LEN: usize = 1 << ROOT_BITS;
const LEAF_LEN: usize = 1 << LEAF_BITS;

const _: () = assert!(PAGE_ID_BITS == ROOT_BITS + LEAF_BITS);

type Leaf = [AtomicPtr<Span>; LEAF_LEN];
type Root = [AtomicPtr<Leaf>; ROOT_LEN];

pub struct PageMap {
  root: AtomicPtr<Root>,
}

impl PageMap {
  pub const fn new() -> Self {
    Self {
      root: AtomicPtr::new(null_mut()),
    }
  }

  /// Allocates the root. Fresh system memory is zeroed, so every slot starts
  /// out null.
  pub fn init(&self, sys: &SysAlloc) -> Option<()> {
    if !self.root.load(Ordering::Acquire).is_null() {
      return Some(());
    }
    let root = sys.meta_alloc(size_of::<Root>())?;
    self.root.store(root.as_ptr().cast(), Ordering::Release);
    Some(())
  }

  #[inline]
  fn split(page: PageId) -> Option<(usize, usize)> {
    if page >> PAGE_ID_BITS != 0 {
      return None;
    }
    Some((page >> LEAF_BITS, page & (LEAF_LEN - 1)))
  }

  #[inline]
  fn leaf(&self, index: usize) -> *mut Leaf {
    let root = self.root.load(Ordering::Acquire);
    if root.is_null() {
      return null_mut();
    }
    unsafe { (*root)[index].load(Ordering::Acquire) }
  }

  /// The span registered for `page`, or null.
  #[inline]
  pub fn get(&self, page: PageId) -> *mut Span {
    let Some((i, j)) = Self::split(page) else {
      return null_mut();
    };
    let leaf = self.leaf(i);
    if leaf.is_null() {
      return null_mut();
    }
    unsafe { (*leaf)[j].load(Ordering::Acquire) }
  }

  /// Makes sure `[start, start + n)` can be stored.
  pub fn ensure(&self, start: PageId, n: usize, sys: &SysAlloc) -> bool {
    let root = self.root.load(Ordering::Acquire);
    if root.is_null() || n == 0 {
      return !root.is_null();
    }
    let Some(last) = start.checked_add(n - 1) else {
      return false;
    };
    let (Some((first_leaf, _)), Some((last_leaf, _))) = (Self::split(start), Self::split(last))
    else {
      return false;
    };
    for i in first_leaf..=last_leaf {
      let slot = unsafe { &(*root)[i] };
      if slot.load(Ordering::Acquire).is_null() {
        let Some(leaf) = sys.meta_alloc(size_of::<Leaf>()) else {
          return false;
        };
        slot.store(leaf.as_ptr().cast(), Ordering::Release);
      }
    }
    true
  }

  /// Stores `span` for `page`. The page must be covered by `ensure`.
  #[inline]
  pub fn set(&self, page: PageId, span: *mut Span) {
    let Some((i, j)) = Self::split(page) else {
      crash!("page {:#x} is outside the mapped address space", page);
    };
    let leaf = self.leaf(i);
    check!(!leaf.is_null(), "page {:#x} has no page map leaf", page);
    unsafe { (*leaf)[j].store(span, Ordering::Release) };
  }

  /// Registers the first and last page of `span`.
  ///
  /// # Safety
  /// `span` is a valid descriptor.
  pub unsafe fn set_endpoints(&self, span: *mut Span) {
    let (start, length) = unsafe { ((*span).start, (*span).length) };
    self.set(start, span);
    if length > 1 {
      self.set(start + length - 1, span);
    }
  }

  /// Registers every page of `span`.
  ///
  /// # Safety
  /// `span` is a valid descriptor.
  pub unsafe fn set_all(&self, span: *mut Span) {
    let (start, length) = unsafe { ((*span).start, (*span).length) };
    for page in start..start + length {
      self.set(page, span);
    }
  }
}

impl Default for PageMap {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{span::SpanState, system::CountingSystem};

  #[test]
  fn lookups_before_init_miss() {
    let map = PageMap::new();
    assert!(map.get(12).is_null());
    assert!(map.get(usize::MAX).is_null());
  }

  #[test]
  fn stores_and_finds_spans() {
    static SYS: CountingSystem = CountingSystem::new();
    let sys = SysAlloc::new(&SYS);
    let map = PageMap::new();
    map.init(&sys).unwrap();

    let mut span = Span::new(LEAF_LEN - 2, 4, SpanState::InUseLarge);
    let ptr = &mut span as *mut Span;
    assert!(map.ensure(span.start, span.length, &sys));
    unsafe { map.set_endpoints(ptr) };
    assert_eq!(map.get(LEAF_LEN - 2), ptr);
    assert_eq!(map.get(LEAF_LEN + 1), ptr);
    assert!(map.get(LEAF_LEN).is_null());

    unsafe { map.set_all(ptr) };
    assert_eq!(map.get(LEAF_LEN), ptr);
    assert!(!map.ensure(1 << PAGE_ID_BITS, 1, &sys));
  }
}
