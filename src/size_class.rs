//! Size classes.
//!
//! Classes are found at init by a packing search: walk candidate sizes at a
//! size-dependent alignment, give each the smallest span whose tail waste is
//! at most an eighth, and fold a size into its predecessor when both would
//! pack the same number of objects into the same number of pages. Class 0 is
//! "no class": anything above `MAX_SIZE` goes straight to the page heap.

use crate::{PAGE_SHIFT, PAGE_SIZE};

/// Largest size served from a size class.
pub const MAX_SIZE: usize = 256 << 10;
/// Sizes up to here use the fine-grained (8 byte) half of the lookup table.
pub const MAX_SMALL_SIZE: usize = 1024;
/// Smallest class size and the step of the lookup table.
pub const ALIGNMENT: usize = 8;
/// Alignment of every class from 16 bytes up.
pub const MIN_ALIGN: usize = 16;
/// Upper bound on the number of classes (the search produces fewer).
pub const MAX_CLASSES: usize = 128;
/// Cap on objects moved between a thread cache and a central list at once.
pub const MAX_TRANSFER_OBJECTS: usize = 32;

const CLASS_ARRAY_SIZE: usize = class_index(MAX_SIZE) + 1;

#[inline(always)]
const fn class_index(size: usize) -> usize {
  if size <= MAX_SMALL_SIZE {
    (size + 7) >> 3
  } else {
    (size + 127 + (120 << 7)) >> 7
  }
}

#[inline(always)]
const fn lg_floor(n: usize) -> usize {
  (usize::BITS - 1 - n.leading_zeros()) as usize
}

/// Alignment used both to step the search and to align objects of `size`.
pub const fn alignment_for_size(size: usize) -> usize {
  let alignment = if size > MAX_SIZE {
    PAGE_SIZE
  } else if size >= 128 {
    (1 << lg_floor(size)) / 8
  } else if size >= MIN_ALIGN {
    MIN_ALIGN
  } else {
    ALIGNMENT
  };
  if alignment > PAGE_SIZE {
    PAGE_SIZE
  } else {
    alignment
  }
}

/// Objects per central-list transfer for objects of `size` bytes.
pub const fn num_move_size(size: usize) -> usize {
  if size == 0 {
    return 0;
  }
  let num = (64 << 10) / size;
  if num < 2 {
    2
  } else if num > MAX_TRANSFER_OBJECTS {
    MAX_TRANSFER_OBJECTS
  } else {
    num
  }
}

pub struct SizeMap {
  num_classes: usize,
  class_array: [u8; CLASS_ARRAY_SIZE],
  class_to_size: [usize; MAX_CLASSES],
  class_to_pages: [usize; MAX_CLASSES],
  num_objects_to_move: [usize; MAX_CLASSES],
}

impl SizeMap {
  pub fn new() -> Self {
    let mut map = SizeMap {
      num_classes: 0,
      class_array: [0; CLASS_ARRAY_SIZE],
      class_to_size: [0; MAX_CLASSES],
      class_to_pages: [0; MAX_CLASSES],
      num_objects_to_move: [0; MAX_CLASSES],
    };

    let mut sc = 1;
    let mut size = ALIGNMENT;
    while size <= MAX_SIZE {
      let alignment = alignment_for_size(size);
      let blocks_to_move = num_move_size(size) / 4;

      let mut psize = 0;
      loop {
        psize += PAGE_SIZE;
        while psize % size > psize >> 3 {
          psize += PAGE_SIZE;
        }
        if psize / size >= blocks_to_move {
          break;
        }
      }
      let pages = psize >> PAGE_SHIFT;

      if sc > 1 && pages == map.class_to_pages[sc - 1] {
        let objects = (pages << PAGE_SHIFT) / size;
        let prev_objects = (map.class_to_pages[sc - 1] << PAGE_SHIFT) / map.class_to_size[sc - 1];
        if objects == prev_objects {
          // Same packing, so the bigger size costs nothing.
          map.class_to_size[sc - 1] = size;
          size += alignment;
          continue;
        }
      }

      check!(sc < MAX_CLASSES, "too many size classes ({})", sc);
      map.class_to_pages[sc] = pages;
      map.class_to_size[sc] = size;
      sc += 1;
      size += alignment;
    }
    map.num_classes = sc;

    let mut next_size = 0;
    for c in 1..sc {
      let max_size_in_class = map.class_to_size[c];
      let mut s = next_size;
      while s <= max_size_in_class {
        map.class_array[class_index(s)] = c as u8;
        s += ALIGNMENT;
      }
      next_size = max_size_in_class + ALIGNMENT;
    }

    for c in 1..sc {
      map.num_objects_to_move[c] = num_move_size(map.class_to_size[c]);
    }

    map
  }

  /// Number of classes including the reserved class 0.
  #[inline]
  pub fn num_classes(&self) -> usize {
    self.num_classes
  }

  /// Smallest class holding `size` bytes, or 0 above `MAX_SIZE`.
  #[inline]
  pub fn class_of(&self, size: usize) -> usize {
    if size > MAX_SIZE {
      return 0;
    }
    self.class_array[class_index(size)] as usize
  }

  /// Smallest class holding `size` bytes at alignment `align`, if any.
  pub fn class_for(&self, size: usize, align: usize) -> Option<usize> {
    if align > PAGE_SIZE {
      return None;
    }
    let size = if align > ALIGNMENT {
      crate::align_up(size.max(1), align)
    } else {
      size
    };
    let mut class = self.class_of(size);
    if class == 0 {
      return None;
    }
    while class < self.num_classes && self.class_to_size[class] % align != 0 {
      class += 1;
    }
    (class < self.num_classes).then_some(class)
  }

  #[inline]
  pub fn size_of(&self, class: usize) -> usize {
    self.class_to_size[class]
  }

  #[inline]
  pub fn pages_of(&self, class: usize) -> usize {
    self.class_to_pages[class]
  }

  #[inline]
  pub fn num_objects_to_move(&self, class: usize) -> usize {
    self.num_objects_to_move[class]
  }

  pub fn objects_per_span(&self, class: usize) -> usize {
    (self.class_to_pages[class] << PAGE_SHIFT) / self.class_to_size[class]
  }

  pub fn min_span_pages(&self) -> usize {
    (1..self.num_classes)
      .map(|c| self.class_to_pages[c])
      .min()
      .unwrap_or(1)
  }
}

impl Default for SizeMap {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn every_size_maps_to_smallest_fitting_class() {
    let map = SizeMap::new();
    for size in 0..=MAX_SIZE {
      let c = map.class_of(size);
      assert!(c > 0 && c < map.num_classes(), "size {size} mapped to {c}");
      assert!(map.size_of(c) >= size, "class {c} too small for {size}");
      if c > 1 {
        assert!(map.size_of(c - 1) < size, "class {} also fits {size}", c - 1);
      }
    }
  }

  #[test]
  fn boundaries_map_exactly() {
    let map = SizeMap::new();
    for c in 1..map.num_classes() {
      let size = map.size_of(c);
      assert_eq!(map.class_of(size), c);
      if c + 1 < map.num_classes() {
        assert_eq!(map.class_of(size + 1), c + 1);
      }
    }
    assert_eq!(map.class_of(MAX_SIZE + 1), 0);
    assert_eq!(map.size_of(0), 0);
  }

  #[test]
  fn classes_are_strictly_increasing_and_aligned() {
    let map = SizeMap::new();
    for c in 2..map.num_classes() {
      assert!(map.size_of(c) > map.size_of(c - 1));
    }
    for c in 1..map.num_classes() {
      let size = map.size_of(c);
      assert_eq!(size % ALIGNMENT, 0);
      if size >= MIN_ALIGN {
        assert_eq!(size % MIN_ALIGN, 0, "class {c} size {size}");
      }
    }
    assert_eq!(map.size_of(1), ALIGNMENT);
    assert_eq!(map.size_of(map.num_classes() - 1), MAX_SIZE);
  }

  #[test]
  fn spans_waste_at_most_an_eighth() {
    let map = SizeMap::new();
    for c in 1..map.num_classes() {
      let span = map.pages_of(c) << PAGE_SHIFT;
      let objects = map.objects_per_span(c);
      assert!(objects >= 1);
      assert!(span - objects * map.size_of(c) <= span / 8, "class {c}");
      let moved = map.num_objects_to_move(c);
      assert!((2..=MAX_TRANSFER_OBJECTS).contains(&moved));
    }
    assert_eq!(map.min_span_pages(), 1);
  }

  #[test]
  fn aligned_lookup_returns_multiples() {
    let map = SizeMap::new();
    for align in [1, 8, 16, 32, 64, 256, 4096, PAGE_SIZE] {
      for size in [1, 7, 24, 100, 1000, 5000] {
        let c = map.class_for(size, align).unwrap();
        assert!(map.size_of(c) >= size);
        assert_eq!(map.size_of(c) % align, 0, "size {size} align {align}");
      }
    }
    assert_eq!(map.class_for(64, 2 * PAGE_SIZE), None);
    assert_eq!(map.class_for(MAX_SIZE + 1, 8), None);
  }

  #[test]
  fn deterministic() {
    let a = SizeMap::new();
    let b = SizeMap::new();
    assert_eq!(a.num_classes(), b.num_classes());
    for c in 0..a.num_classes() {
      assert_eq!(a.size_of(c), b.size_of(c));
      assert_eq!(a.pages_of(c), b.pages_of(c));
    }
  }
}
