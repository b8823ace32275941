//! Error types and the fatal-abort path.
//!
//! Recoverable conditions are typed errors. Corruption is not recoverable:
//! `crash!` writes one line to stderr without touching the heap and aborts.

use core::fmt::{self, Write};
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
  #[error("out of memory: the system allocator could not supply {pages} pages")]
  OutOfMemory { pages: usize },
  #[error("requested size overflows the address space")]
  SizeOverflow,
  #[error("alignment {0} is not a power of two")]
  BadAlignment(usize),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ForkError {
  #[error("fork handlers are not registered on {os}: {reason}")]
  Unsupported { os: &'static str, reason: &'static str },
  #[error("pthread_atfork failed with code {0}")]
  Registration(i32),
  #[error("at most {0} heaps can be protected across fork")]
  TooManyHeaps(usize),
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HeapCorruption {
  #[error("span at page {start} on the {expected} list has state {found}")]
  WrongState {
    start: usize,
    expected: &'static str,
    found: &'static str,
  },
  #[error("span at page {start} of length {length} is on the list for length {list}")]
  WrongLength {
    start: usize,
    length: usize,
    list: usize,
  },
  #[error("page map entry for page {page} does not point at its span")]
  PageMapMismatch { page: usize },
  #[error("free spans at pages {first} and {second} are adjacent but not coalesced")]
  Uncoalesced { first: usize, second: usize },
  #[error("{counter} counter says {recorded} pages but the lists hold {actual}")]
  CounterMismatch {
    counter: &'static str,
    recorded: usize,
    actual: usize,
  },
}

/// Formats into a fixed stack buffer; output past the end is dropped.
struct StackBuf {
  buf: [u8; 256],
  len: usize,
}

impl Write for StackBuf {
  fn write_str(&mut self, s: &str) -> fmt::Result {
    let room = self.buf.len() - self.len;
    let n = s.len().min(room);
    self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
    self.len += n;
    Ok(())
  }
}

#[cold]
#[inline(never)]
pub fn crash_with(args: fmt::Arguments<'_>) -> ! {
  let mut out = StackBuf {
    buf: [0; 256],
    len: 0,
  };
  let _ = out.write_str("tiermalloc: fatal: ");
  let _ = out.write_fmt(args);
  let _ = out.write_str("\n");
  unsafe {
    libc::write(2, out.buf.as_ptr().cast(), out.len);
    libc::abort()
  }
}

/// Aborts the process after printing a message. Never allocates.
#[macro_export]
macro_rules! crash {
  ($($arg:tt)*) => {
    $crate::error::crash_with(format_args!($($arg)*))
  };
}

/// `crash!` unless the condition holds.
#[macro_export]
macro_rules! check {
  ($cond:expr, $($arg:tt)*) => {
    if !$cond {
      $crate::crash!($($arg)*);
    }
  };
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn stack_buf_truncates() {
    let mut out = StackBuf {
      buf: [0; 256],
      len: 0,
    };
    for _ in 0..100 {
      let _ = out.write_str("abcd");
    }
    assert_eq!(out.len, 256);
  }

  #[test]
  fn messages_name_the_problem() {
    let err = AllocError::OutOfMemory { pages: 3 };
    assert!(err.to_string().contains("3 pages"));
    let err = HeapCorruption::Uncoalesced {
      first: 10,
      second: 12,
    };
    assert!(err.to_string().contains("not coalesced"));
  }
}
