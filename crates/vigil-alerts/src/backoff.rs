//! Delivery retry policy and exponential backoff.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::duration_str;

/// Configuration for delivery retries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    #[serde(with = "duration_str")]
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    #[serde(with = "duration_str")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Relative jitter applied to every delay, e.g. `0.2` for ±20%.
    pub jitter: f64,
    /// Maximum number of delivery attempts, including the first.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: 0.2,
            max_attempts: 5,
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay after the given failed attempt, without jitter.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = self
            .backoff_multiplier
            .powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);
        let delay_millis = (self.initial_delay.as_millis() as f64 * multiplier).min(u64::MAX as f64) as u64;
        Duration::from_millis(delay_millis).min(self.max_delay)
    }

    /// Calculate the delay after the given failed attempt with jitter applied.
    #[must_use]
    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.delay_for_attempt(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        base.mul_f64(rng.gen_range((1.0 - jitter)..=(1.0 + jitter)))
    }

    /// Check whether another attempt is allowed after `attempts` attempts.
    #[must_use]
    pub const fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}
