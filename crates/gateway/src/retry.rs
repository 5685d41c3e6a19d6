use inbox_core::config::RetryConfig;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry configuration with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first call.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum backoff duration in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff multiplier per attempt.
    pub multiplier: f64,
    /// Scale each delay by a uniform factor in [0.5, 1.0].
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            multiplier: config.multiplier,
            jitter: config.jitter,
        }
    }
}

impl RetryPolicy {
    /// Un-jittered backoff after the given failed attempt (0-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base_ms = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.max_delay_ms as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// Backoff with jitter applied.
    pub fn delay_for_attempt<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let backoff = self.backoff_for_attempt(attempt);
        if self.jitter {
            backoff.mul_f64(rng.gen_range(0.5..=1.0))
        } else {
            backoff
        }
    }

    /// Bounds on the total time spent sleeping if every retry is used.
    pub fn total_wait_bounds(&self) -> (Duration, Duration) {
        let full: Duration = (0..self.max_attempts.saturating_sub(1))
            .map(|attempt| self.backoff_for_attempt(attempt))
            .sum();
        if self.jitter {
            (full / 2, full)
        } else {
            (full, full)
        }
    }
}
