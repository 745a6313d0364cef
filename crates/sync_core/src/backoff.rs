use std::time::Duration;

use rand::Rng;

/// Exponential reconnect backoff with proportional jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Fraction of the computed delay that may be shaved off at random, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    /// Un-jittered delay before attempt `retry_count + 1`: `min(cap, base * 2^retry_count)`.
    pub fn ceiling(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count.min(31)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Deterministic delay for a given jitter sample in `[0, 1)`.
    pub fn delay(&self, retry_count: u32, sample: f64) -> Duration {
        let ceiling = self.ceiling(retry_count);
        let jitter = self.jitter.clamp(0.0, 1.0) * sample.clamp(0.0, 1.0);
        ceiling.mul_f64(1.0 - jitter)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, retry_count: u32, rng: &mut R) -> Duration {
        self.delay(retry_count, rng.gen::<f64>())
    }
}

#[cfg(test)]
#[path = "tests/backoff_tests.rs"]
mod tests;
