//! Bounded retry policy for collaborator calls.

use std::time::Duration;

/// Retry behavior for acquire and publish attempts.
///
/// Attempts are numbered from 1. An attempt that fails with a retryable
/// error is repeated after an exponentially growing delay until
/// `max_attempts` is exhausted, at which point the item moves to
/// `Failed`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum attempts per phase, per pass (default 3).
    pub max_attempts: u32,

    /// Delay before the second attempt; doubles each attempt after that.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the given bounds.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Whether another attempt is allowed after `attempt` failed.
    pub fn allows_another(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Backoff delay applied after the given failed attempt:
    /// `base * 2^(attempt-1)`, capped at 60s.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(5);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(Duration::from_secs(60))
    }
}
