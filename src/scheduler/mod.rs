//! Batch scheduler: composition, retry policy, shared rate limit and
//! sliding-window dispatch.

pub mod batch;
pub mod dispatch;
pub mod rate_limit;
pub mod retry;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use batch::{build_batches, Batch, BatchShape};
pub use dispatch::{BatchCall, BatchOutcome, BatchReport, CallUsage, DispatchSummary, Dispatcher};
pub use rate_limit::RateLimiter;
pub use retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchingConfig {
    pub mapping_batch_size: usize,
    /// Components and POA&M narrative per call, within one tier.
    pub artifact_batch_size: usize,
    pub validation_batch_size: usize,
    pub remediation_batch_size: usize,
    /// In-flight batches per session.
    pub max_concurrent_batches: usize,
    /// Shared across all sessions.
    pub requests_per_minute: u32,
    pub group_by_family: bool,
    pub call_timeout_secs: u64,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            mapping_batch_size: 15,
            artifact_batch_size: 15,
            validation_batch_size: 10,
            remediation_batch_size: 15,
            max_concurrent_batches: 3,
            requests_per_minute: 60,
            group_by_family: true,
            call_timeout_secs: 120,
        }
    }
}

impl BatchingConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn shape(&self, max_size: usize) -> BatchShape {
        BatchShape {
            max_size,
            group_by_family: self.group_by_family,
        }
    }
}
