//! Fixed-size allocators for allocator metadata.
//!
//! Objects are carved from chunks obtained from the system allocator and
//! recycled through an intrusive free list. Memory is never returned. The
//! slabs hold no lock of their own; the page-heap lock guards them.

use core::{
  marker::PhantomData,
  mem::{align_of, size_of},
  ptr::{NonNull, null_mut},
};

use crate::{align_up, system::SysAlloc};

/// Bytes requested from the system each time a slab runs dry.
pub const SLAB_CHUNK: usize = 128 << 10;

struct SlabFree {
  next: *mut SlabFree,
}

pub struct Slab<T> {
  free: *mut SlabFree,
  cursor: usize,
  end: usize,
  inuse: usize,
  chunks: usize,
  _marker: PhantomData<T>,
}

unsafe impl<T> Send for Slab<T> {}

impl<T> Slab<T> {
  const OBJECT_SIZE: usize = {
    let size = if size_of::<T>() > size_of::<SlabFree>() {
      size_of::<T>()
    } else {
      size_of::<SlabFree>()
    };
    align_up(size, Self::OBJECT_ALIGN)
  };

  const OBJECT_ALIGN: usize = if align_of::<T>() > align_of::<SlabFree>() {
    align_of::<T>()
  } else {
    align_of::<SlabFree>()
  };

  pub const fn new() -> Self {
    Self {
      free: null_mut(),
      cursor: 0,
      end: 0,
      inuse: 0,
      chunks: 0,
      _marker: PhantomData,
    }
  }

  /// Storage for one `T`, uninitialized. `None` when the system is out of
  /// memory.
  pub fn alloc(&mut self, sys: &SysAlloc) -> Option<NonNull<T>> {
    let obj = if let Some(free) = NonNull::new(self.free) {
      self.free = unsafe { (*free.as_ptr()).next };
      free.cast()
    } else {
      if self.end - self.cursor < Self::OBJECT_SIZE {
        let bytes = SLAB_CHUNK.max(Self::OBJECT_SIZE);
        let chunk = sys.meta_alloc(bytes)?;
        self.cursor = chunk.as_ptr() as usize;
        self.end = self.cursor + bytes;
        self.chunks += 1;
      }
      let obj = self.cursor;
      self.cursor += Self::OBJECT_SIZE;
      NonNull::new(obj as *mut T)?
    };
    self.inuse += 1;
    Some(obj)
  }

  /// Allocates and moves `value` in.
  pub fn alloc_with(&mut self, sys: &SysAlloc, value: T) -> Option<NonNull<T>> {
    let obj = self.alloc(sys)?;
    unsafe { obj.as_ptr().write(value) };
    Some(obj)
  }

  /// # Safety
  /// `obj` came from `alloc` on this slab and is not used afterwards. The
  /// value is not dropped.
  pub unsafe fn free(&mut self, obj: NonNull<T>) {
    let node = obj.as_ptr() as *mut SlabFree;
    unsafe { (*node).next = self.free };
    self.free = node;
    self.inuse -= 1;
  }

  /// Takes `n` objects up front and never gives them back, so the first real
  /// objects do not share the chunk's first cache lines.
  pub fn prewarm(&mut self, sys: &SysAlloc, n: usize) -> Option<()> {
    for _ in 0..n {
      self.alloc(sys)?;
    }
    Some(())
  }

  pub fn inuse(&self) -> usize {
    self.inuse
  }

  pub fn chunks(&self) -> usize {
    self.chunks
  }
}

impl<T> Default for Slab<T> {
  fn default() -> Self {
    Self::new()
  }
}
