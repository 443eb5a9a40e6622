// Small helpers shared by the generator, the compiler and the artifact container
use std::time::Instant;

use sha2::{Digest, Sha256};

/// Number of samples covering `duration_ms` at `fs_hz` (rounded to the nearest sample).
pub fn ms_to_samples(duration_ms: f64, fs_hz: f64) -> usize {
    if duration_ms <= 0. {
        return 0;
    }
    (duration_ms * fs_hz / 1e3).round() as usize
}

pub fn samples_to_ms(n_samples: usize, fs_hz: f64) -> f64 {
    n_samples as f64 * 1e3 / fs_hz
}

/// Hex sha256 digest over the little-endian bytes of `values`.
pub fn hash_f64s(values: impl IntoIterator<Item = f64>) -> String {
    let mut hasher = Sha256::new();
    for v in values {
        hasher.update(v.to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

pub fn hash_u32s(values: impl IntoIterator<Item = u32>) -> String {
    let mut hasher = Sha256::new();
    for v in values {
        hasher.update(v.to_le_bytes());
    }
    format!("{:x}", hasher.finalize())
}

pub fn rms(values: impl IntoIterator<Item = f64>) -> f64 {
    let (sum, n) = values
        .into_iter()
        .fold((0., 0usize), |(sum, n), x| (sum + x * x, n + 1));
    if n == 0 {
        0.
    } else {
        (sum / n as f64).sqrt()
    }
}

// Utility class for time-tracking
pub struct TickTimer {
    last: Instant,
}

impl TickTimer {
    pub fn new() -> Self {
        Self { last: Instant::now() }
    }

    /// Milliseconds elapsed since the previous tick (or construction).
    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let diff = now.duration_since(self.last).as_secs_f64() * 1e3;
        self.last = now;
        diff
    }

    pub fn tick_log(&mut self, msg: &str) -> f64 {
        let diff = self.tick();
        tracing::debug!("{}: {:.3} ms", msg, diff);
        diff
    }
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ms_sample_conversion() {
        assert_eq!(ms_to_samples(50., 48000.), 2400);
        assert_eq!(ms_to_samples(-3., 48000.), 0);
        assert_eq!(samples_to_ms(2400, 48000.), 50.);
    }

    #[test]
    fn hash_is_order_sensitive() {
        assert_eq!(hash_f64s([1., 2.]), hash_f64s(vec![1., 2.]));
        assert_ne!(hash_f64s([1., 2.]), hash_f64s([2., 1.]));
        assert_eq!(hash_f64s([]).len(), 64);
    }
}
