//! Bounded exponential backoff for provider retries.

use std::time::Duration;

use rand::Rng;

/// Retry budget and backoff parameters for a single provider.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 = try once).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_backoff: Duration,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
    /// Add up to 25% random jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// No retries, no delay. Used by tests.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: false,
        }
    }

    /// Delay before retry number `retry` (1-based): base * 2^(retry-1), capped.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16);
        let base_ms = u64::try_from(self.base_backoff.as_millis()).unwrap_or(u64::MAX);
        let cap_ms = u64::try_from(self.max_backoff.as_millis()).unwrap_or(u64::MAX);
        let mut delay_ms = base_ms.saturating_mul(1u64 << exp).min(cap_ms);

        if self.jitter && delay_ms > 0 {
            let extra = rand::thread_rng().gen_range(0..=delay_ms / 4);
            delay_ms = delay_ms.saturating_add(extra).min(cap_ms);
        }

        Duration::from_millis(delay_ms)
    }
}
