//! Runtime configuration.
//!
//! The environment is read with `libc::getenv`, which hands back a pointer
//! into the process environment without allocating. That matters: the global
//! heap reads its configuration while it is being initialized.

use core::ffi::CStr;

pub const AGGRESSIVE_DECOMMIT_ENV: &CStr = c"TIERMALLOC_AGGRESSIVE_DECOMMIT";
pub const SAMPLE_PARAMETER_ENV: &CStr = c"TIERMALLOC_SAMPLE_PARAMETER";
pub const MAX_TOTAL_THREAD_CACHE_BYTES_ENV: &CStr = c"TIERMALLOC_MAX_TOTAL_THREAD_CACHE_BYTES";

/// Used when `TIERMALLOC_AGGRESSIVE_DECOMMIT` is unset or empty.
pub const DEFAULT_AGGRESSIVE_DECOMMIT: bool = cfg!(feature = "aggressive-decommit");

/// Mean bytes between sampled allocations.
pub const DEFAULT_SAMPLE_PARAMETER: usize = 512 << 10;

/// Byte budget shared by all thread caches.
pub const DEFAULT_MAX_TOTAL_THREAD_CACHE_BYTES: usize = 32 << 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
  /// `None` defers to the environment, read during init.
  pub aggressive_decommit: Option<bool>,
  /// `0` disables sampling.
  pub sample_parameter: usize,
  pub max_total_thread_cache_bytes: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      aggressive_decommit: None,
      sample_parameter: DEFAULT_SAMPLE_PARAMETER,
      max_total_thread_cache_bytes: DEFAULT_MAX_TOTAL_THREAD_CACHE_BYTES,
    }
  }
}

impl Config {
  /// Reads the tunables that are fixed at construction. The decommit switch
  /// stays deferred; init resolves it.
  pub fn from_env() -> Self {
    let defaults = Self::default();
    Self {
      aggressive_decommit: None,
      sample_parameter: parse_usize(getenv(SAMPLE_PARAMETER_ENV), defaults.sample_parameter),
      max_total_thread_cache_bytes: parse_usize(
        getenv(MAX_TOTAL_THREAD_CACHE_BYTES_ENV),
        defaults.max_total_thread_cache_bytes,
      ),
    }
  }

  pub fn with_aggressive_decommit(mut self, on: bool) -> Self {
    self.aggressive_decommit = Some(on);
    self
  }

  pub fn with_sample_parameter(mut self, bytes: usize) -> Self {
    self.sample_parameter = bytes;
    self
  }

  pub fn with_max_total_thread_cache_bytes(mut self, bytes: usize) -> Self {
    self.max_total_thread_cache_bytes = bytes;
    self
  }

  /// The explicit setting, or the environment, or the build default.
  pub fn resolve_aggressive_decommit(&self) -> bool {
    self
      .aggressive_decommit
      .unwrap_or_else(|| parse_bool(getenv(AGGRESSIVE_DECOMMIT_ENV), DEFAULT_AGGRESSIVE_DECOMMIT))
  }
}

fn getenv(name: &CStr) -> Option<&'static [u8]> {
  let value = unsafe { libc::getenv(name.as_ptr()) };
  if value.is_null() {
    None
  } else {
    Some(unsafe { CStr::from_ptr(value) }.to_bytes())
  }
}

/// Unset or empty keeps the default; a leading `t`, `y` or `1` (any case)
/// means true; anything else means false.
pub fn parse_bool(value: Option<&[u8]>, default: bool) -> bool {
  match value {
    None | Some([]) => default,
    Some([first, ..]) => matches!(first, b't' | b'T' | b'y' | b'Y' | b'1'),
  }
}

/// Decimal digits only; anything unparseable keeps the default.
pub fn parse_usize(value: Option<&[u8]>, default: usize) -> usize {
  let Some(digits) = value else {
    return default;
  };
  if digits.is_empty() {
    return default;
  }
  let mut n: usize = 0;
  for &d in digits {
    if !d.is_ascii_digit() {
      return default;
    }
    n = match n
      .checked_mul(10)
      .and_then(|n| n.checked_add((d - b'0') as usize))
    {
      Some(n) => n,
      None => return default,
    };
  }
  n
}
