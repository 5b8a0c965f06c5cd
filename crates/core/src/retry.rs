//! Bounded exponential-backoff policy for failed jobs.
//!
//! A failed job is re-enqueued after [`RetryConfig::delay_for_attempt`]
//! until [`RetryConfig::max_attempts`] attempts have been made; after that
//! the job is terminally failed.

use std::time::Duration;

/// Tunable parameters for the retry policy.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first one. `1` disables retries.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// A policy that never retries.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Whether another attempt is allowed after `attempts` have failed.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before the retry that follows the `attempts`-th failure.
    ///
    /// `attempts` is 1-based; the first retry waits `initial_delay`.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let mut delay = self.initial_delay.min(self.max_delay);
        for _ in 1..attempts {
            delay = next_delay(delay, self);
        }
        delay
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`RetryConfig::max_delay`].
pub fn next_delay(current: Duration, config: &RetryConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}
