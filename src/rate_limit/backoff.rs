//! Admission Backoff
//!
//! Capped exponential backoff with jitter for admission retries:
//!
//! ```text
//! ceiling = min(base_delay * 2^attempt, max_delay, retry_after_hint)   (floored at 1ms)
//! delay   = uniform[ceiling * (1 - jitter), ceiling]
//! ```
//!
//! The sleep never exceeds the store's `retry_after` hint, and the jitter
//! spreads callers sharing one bucket so they do not all wake on the same tick.

use rand::Rng;
use std::time::Duration;

/// Smallest delay between admission attempts
pub const MIN_DELAY: Duration = Duration::from_millis(1);

/// Backoff configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay ceiling for the first retry
    pub base_delay: Duration,

    /// Absolute delay ceiling
    pub max_delay: Duration,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(25),
            max_delay: Duration::from_secs(5),
            jitter: 0.5,
        }
    }
}

impl BackoffConfig {
    /// Create a new backoff configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base delay
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the maximum delay
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the jitter factor
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Upper bound of the delay for a zero-indexed retry attempt
    pub fn ceiling(&self, attempt: u32, retry_after: Duration) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
            .min(retry_after)
            .max(MIN_DELAY)
    }

    /// Jittered delay for a zero-indexed retry attempt
    pub fn delay(&self, attempt: u32, retry_after: Duration) -> Duration {
        let ceiling = self.ceiling(attempt, retry_after);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return ceiling;
        }

        let ceiling_us = ceiling.as_micros() as u64;
        let floor_us = ((ceiling_us as f64) * (1.0 - jitter)) as u64;
        let chosen = rand::rng().random_range(floor_us..=ceiling_us);
        Duration::from_micros(chosen).max(MIN_DELAY)
    }
}
