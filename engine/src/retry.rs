//! Retry policy for failed queue entries.
//!
//! Failed pushes are retried with exponential backoff up to a bounded
//! number of attempts. Past the cap, the entry is surfaced as a conflict
//! requiring manual intervention — never silently dropped.

use serde::{Deserialize, Serialize};

/// Exponential backoff bounded by a maximum attempt count.
///
/// Defaults: 5 attempts, delays 1s, 2s, 4s, 8s, 16s, with the curve
/// capped at 5 minutes should the attempt cap ever be raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of failed attempts before the entry is surfaced
    /// as a conflict.
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: i64,
    /// Upper bound on any single delay, in milliseconds.
    pub max_delay_ms: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, given how many attempts have
    /// already failed (1-indexed: after the first failure pass 1).
    pub fn delay_ms(&self, failed_attempts: u32) -> i64 {
        let exponent = failed_attempts.saturating_sub(1).min(30);
        let delay = self.base_delay_ms.saturating_mul(1_i64 << exponent);
        delay.min(self.max_delay_ms)
    }

    /// Whether another attempt is allowed after `failed_attempts` failures.
    pub fn should_retry(&self, failed_attempts: u32) -> bool {
        failed_attempts < self.max_attempts
    }
}
