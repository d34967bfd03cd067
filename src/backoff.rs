//! # Backoff Policy
//!
//! Exponential backoff shared by the breaker's bounded store-operation retry and
//! the stream delivery tracker: `delay_for(n) = min(base * 2^n, max_delay)`.

use std::time::Duration;

/// Pure retry-attempt → delay mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max_delay: Duration,
}

impl BackoffPolicy {
    /// Create a policy; `max_delay` is clamped up to at least `base` so the
    /// ceiling can never undercut the first delay.
    pub fn new(base: Duration, max_delay: Duration) -> Self {
        Self {
            base,
            max_delay: max_delay.max(base),
        }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Delay before the given retry. `delay_for(0)` is the base delay; the result
    /// doubles per retry and saturates at `max_delay`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        // 2^retry_count saturates instead of overflowing for pathological counts.
        let multiplier = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        let delay = self
            .base
            .checked_mul(u32::try_from(multiplier).unwrap_or(u32::MAX))
            .unwrap_or(self.max_delay);
        delay.min(self.max_delay)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}
