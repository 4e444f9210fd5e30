//! Exponential reconnect backoff.

use std::time::Duration;

/// Capped exponential backoff: `min(base * multiplier^attempts, max)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry, in milliseconds.
    pub base_ms: f64,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Upper bound, in milliseconds.
    pub max_ms: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_ms: 1000.0,
            multiplier: 1.5,
            max_ms: 30_000.0,
        }
    }
}

impl Backoff {
    /// Delay in milliseconds after `attempts` failed attempts.
    #[must_use]
    pub fn delay_ms(&self, attempts: u32) -> f64 {
        let exponent = i32::try_from(attempts).unwrap_or(i32::MAX);
        (self.base_ms * self.multiplier.powi(exponent)).min(self.max_ms)
    }

    /// Delay after `attempts` failed attempts.
    #[must_use]
    pub fn delay(&self, attempts: u32) -> Duration {
        Duration::from_secs_f64(self.delay_ms(attempts).max(0.0) / 1000.0)
    }
}
