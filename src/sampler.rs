//! Allocation sampling.
//!
//! Each thread cache decides independently whether an allocation is sampled.
//! The distance in bytes between samples is drawn from a geometric
//! distribution with the configured mean, so every byte allocated has the
//! same chance of being the sampled one.

/// 48-bit linear congruential generator, as in `drand48`.
const PRNG_MULT: u64 = 0x5_DEEC_E66D;
const PRNG_ADD: u64 = 0xB;
const PRNG_BITS: u32 = 48;
const PRNG_MASK: u64 = (1 << PRNG_BITS) - 1;

/// Bits of the generator state used to draw `q` in `(0, 1]`.
const Q_BITS: u32 = 26;

pub struct Sampler {
  bytes_until_sample: usize,
  rnd: u64,
  parameter: usize,
}

impl Sampler {
  pub const fn new() -> Self {
    Self {
      bytes_until_sample: 0,
      rnd: 0,
      parameter: 0,
    }
  }

  /// Seeds the generator. `parameter` is the mean distance between samples;
  /// 0 disables sampling.
  pub fn init(&mut self, seed: u64, parameter: usize) {
    self.parameter = parameter;
    self.rnd = seed & PRNG_MASK;
    // Low-entropy seeds (addresses) take a few rounds to spread.
    for _ in 0..20 {
      self.rnd = next_random(self.rnd);
    }
    self.bytes_until_sample = self.pick_next_sample_period();
  }

  pub fn enabled(&self) -> bool {
    self.parameter != 0
  }

  /// Accounts `size` bytes. Returns `true` when this allocation is sampled.
  #[inline]
  pub fn record(&mut self, size: usize) -> bool {
    if self.parameter == 0 {
      return false;
    }
    if size < self.bytes_until_sample {
      self.bytes_until_sample -= size;
      false
    } else {
      self.bytes_until_sample = self.pick_next_sample_period();
      true
    }
  }

  fn pick_next_sample_period(&mut self) -> usize {
    if self.parameter == 0 {
      return usize::MAX;
    }
    self.rnd = next_random(self.rnd);
    let q = (self.rnd >> (PRNG_BITS - Q_BITS)) as f64 + 1.0;
    let log_val = q.log2() - Q_BITS as f64;
    (log_val.min(0.0) * -(core::f64::consts::LN_2 * self.parameter as f64)) as usize + 1
  }
}

impl Default for Sampler {
  fn default() -> Self {
    Self::new()
  }
}

#[inline]
fn next_random(rnd: u64) -> u64 {
  rnd.wrapping_mul(PRNG_MULT).wrapping_add(PRNG_ADD) & PRNG_MASK
}
