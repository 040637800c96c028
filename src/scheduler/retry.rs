//! The one retry policy every batch call goes through.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::gateway::ProviderError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts per batch, first try included.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Add up to 10% random jitter to each wait.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter: false,
        }
    }

    /// Wait after the `attempt`-th failure (1-based): `base * 2^(attempt-1)`,
    /// capped at `max_delay_ms`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(5);
        let ms = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(ms.min(self.max_delay_ms))
    }

    /// Whether a batch that just failed its `attempt`-th try gets another.
    pub fn should_retry(&self, attempt: u32, err: &ProviderError) -> bool {
        err.is_retryable() && attempt < self.max_attempts
    }

    /// Backoff, stretched to a server-requested Retry-After, still capped.
    pub fn delay_for(&self, attempt: u32, err: &ProviderError) -> Duration {
        let cap = Duration::from_millis(self.max_delay_ms);
        let base = match err.retry_after() {
            Some(after) => self.backoff(attempt).max(after).min(cap),
            None => self.backoff(attempt),
        };
        if self.jitter && !base.is_zero() {
            let extra = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 10);
            base + Duration::from_millis(extra)
        } else {
            base
        }
    }
}
