//! Retry policy for push deliveries.

use std::time::Duration;

use crate::constants::DEFAULT_THROTTLE_DELAY;

/// Bounded exponential backoff for transient failures plus a single
/// throttled retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt for transient failures.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Multiplier applied per retry.
    pub factor: u32,
    /// Upper bound on a server-requested throttle delay.
    pub max_throttle_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            factor: 2,
            max_throttle_wait: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based): `base * factor^retry`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let multiplier = self.factor.saturating_pow(retry);
        self.base_delay.saturating_mul(multiplier)
    }

    /// Delay before the throttled retry.
    pub fn throttle_wait(&self, retry_after: Option<Duration>) -> Duration {
        retry_after
            .unwrap_or(DEFAULT_THROTTLE_DELAY)
            .min(self.max_throttle_wait)
    }
}
