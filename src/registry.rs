//! Registry of live sampled allocations.
//!
//! A doubly linked list kept in an index arena: links are `u32` indices, not
//! addresses, and index 0 is the sentinel. Nodes live in chunks taken from
//! the system allocator and are recycled through a free-index list. Guarded
//! by the page-heap lock.

use core::{mem::size_of, ptr::null_mut};

use crate::{span::Span, system::SysAlloc};

const CHUNK_BITS: u32 = 12;
const CHUNK_LEN: usize = 1 << CHUNK_BITS;
const MAX_CHUNKS: usize = 1024;

/// Sentinel index. Also what a span holds when it is not registered.
pub const SENTINEL: u32 = 0;

#[derive(Clone, Copy)]
struct Node {
  prev: u32,
  next: u32,
  span: *mut Span,
}

pub struct SampledRegistry {
  chunks: [*mut Node; MAX_CHUNKS],
  capacity: u32,
  /// Head of the free-index list, threaded through `next`. 0 when empty.
  free: u32,
  len: usize,
}

unsafe impl Send for SampledRegistry {}

impl SampledRegistry {
  pub const fn new() -> Self {
    Self {
      chunks: [null_mut(); MAX_CHUNKS],
      capacity: 0,
      free: SENTINEL,
      len: 0,
    }
  }

  /// Allocates the first chunk and links the sentinel to itself.
  pub fn init(&mut self, sys: &SysAlloc) -> Option<()> {
    if self.capacity == 0 {
      self.grow(sys)?;
      // `grow` put index 0 on the free list; it is the sentinel instead.
      let first = self.free;
      debug_assert_eq!(first, SENTINEL + 1);
      let sentinel = self.node_mut(SENTINEL);
      sentinel.prev = SENTINEL;
      sentinel.next = SENTINEL;
      sentinel.span = null_mut();
    }
    Some(())
  }

  fn grow(&mut self, sys: &SysAlloc) -> Option<()> {
    let chunk_index = self.capacity as usize / CHUNK_LEN;
    if chunk_index >= MAX_CHUNKS {
      return None;
    }
    let chunk = sys.meta_alloc(CHUNK_LEN * size_of::<Node>())?;
    self.chunks[chunk_index] = chunk.as_ptr().cast();
    let base = self.capacity;
    self.capacity += CHUNK_LEN as u32;
    // Thread the new nodes onto the free list, lowest index first. Index 0
    // never goes on the list.
    for i in (base..self.capacity).rev() {
      if i == SENTINEL {
        continue;
      }
      let free = self.free;
      self.node_mut(i).next = free;
      self.free = i;
    }
    Some(())
  }

  #[inline]
  fn node(&self, index: u32) -> &Node {
    let index = index as usize;
    unsafe { &*self.chunks[index >> CHUNK_BITS].add(index & (CHUNK_LEN - 1)) }
  }

  #[inline]
  fn node_mut(&mut self, index: u32) -> &mut Node {
    let index = index as usize;
    unsafe { &mut *self.chunks[index >> CHUNK_BITS].add(index & (CHUNK_LEN - 1)) }
  }

  /// Links `span` in and returns its node index, or `None` when the arena
  /// cannot grow.
  pub fn insert(&mut self, span: *mut Span, sys: &SysAlloc) -> Option<u32> {
    check!(self.capacity > 0, "sampled registry used before init");
    if self.free == SENTINEL {
      self.grow(sys)?;
    }
    let index = self.free;
    self.free = self.node(index).next;

    let first = self.node(SENTINEL).next;
    *self.node_mut(index) = Node {
      prev: SENTINEL,
      next: first,
      span,
    };
    self.node_mut(first).prev = index;
    self.node_mut(SENTINEL).next = index;
    self.len += 1;
    Some(index)
  }

  pub fn remove(&mut self, index: u32) {
    check!(
      index != SENTINEL && index < self.capacity && !self.node(index).span.is_null(),
      "sampled registry node {} is not live",
      index
    );
    let Node { prev, next, .. } = *self.node(index);
    self.node_mut(prev).next = next;
    self.node_mut(next).prev = prev;
    let free = self.free;
    let node = self.node_mut(index);
    node.span = null_mut();
    node.next = free;
    self.free = index;
    self.len -= 1;
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  /// Newest first.
  pub fn iter(&self) -> impl Iterator<Item = *mut Span> + '_ {
    let mut cur = if self.capacity == 0 {
      SENTINEL
    } else {
      self.node(SENTINEL).next
    };
    core::iter::from_fn(move || {
      if cur == SENTINEL {
        return None;
      }
      let node = self.node(cur);
      cur = node.next;
      Some(node.span)
    })
  }
}

impl Default for SampledRegistry {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{span::SpanState, system::CountingSystem};

  fn spans(n: usize) -> Vec<Span> {
    (0..n).map(|i| Span::new(i, 1, SpanState::InUseLarge)).collect()
  }

  #[test]
  fn insert_remove_iterate() {
    static SYS: CountingSystem = CountingSystem::new();
    let sys = SysAlloc::new(&SYS);
    let mut reg = SampledRegistry::new();
    reg.init(&sys).unwrap();
    assert!(reg.is_empty());

    let mut spans = spans(3);
    let ptrs: Vec<*mut Span> = spans.iter_mut().map(|s| s as *mut Span).collect();
    let idx: Vec<u32> = ptrs.iter().map(|&p| reg.insert(p, &sys).unwrap()).collect();
    assert!(idx.iter().all(|&i| i != SENTINEL));
    assert_eq!(reg.iter().collect::<Vec<_>>(), vec![ptrs[2], ptrs[1], ptrs[0]]);

    reg.remove(idx[1]);
    assert_eq!(reg.iter().collect::<Vec<_>>(), vec![ptrs[2], ptrs[0]]);
    assert_eq!(reg.len(), 2);

    // Freed indices are reused.
    assert_eq!(reg.insert(ptrs[1], &sys), Some(idx[1]));
  }

  #[test]
  fn grows_past_one_chunk() {
    static SYS: CountingSystem = CountingSystem::new();
    let sys = SysAlloc::new(&SYS);
    let mut reg = SampledRegistry::new();
    reg.init(&sys).unwrap();
    let mut span = Span::new(0, 1, SpanState::InUseLarge);
    let p = &mut span as *mut Span;
    let idx: Vec<u32> = (0..CHUNK_LEN + 10).map(|_| reg.insert(p, &sys).unwrap()).collect();
    assert_eq!(reg.len(), CHUNK_LEN + 10);
    assert_eq!(reg.iter().count(), CHUNK_LEN + 10);
    for i in idx {
      reg.remove(i);
    }
    assert!(reg.is_empty());
    assert_eq!(reg.iter().count(), 0);
  }
}
