//! Gateway to the external reasoning service.
//!
//! One `chat` call is one attempt. Retries, timeouts and rate limiting are
//! applied by the batch scheduler so that every pass shares a single policy.

pub mod completions;
pub mod error;
pub mod pricing;
pub mod types;
pub mod usage;

use std::sync::Arc;

use completions::{ChatProvider, CompletionsAdapter};

pub use error::{ErrorContext, ProviderError, RateLimitSource};
pub use pricing::*;
pub use types::*;
pub use usage::{
    CallStatus, MemoryUsageSink, NoopUsageSink, ProviderCallRecord, TracingUsageSink, UsageSink,
};

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// The production gateway: one HTTP attempt per call, each reported to
/// the usage sink whether it succeeded or not.
pub struct ProviderGateway<U: UsageSink> {
    adapter: CompletionsAdapter,
    usage_sink: Arc<U>,
}

#[async_trait::async_trait]
impl<U: UsageSink> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl<U: UsageSink> ProviderGateway<U> {
    pub fn from_env(usage_sink: Arc<U>) -> Result<Self, ProviderError> {
        let adapter = CompletionsAdapter::from_env()?;
        Ok(Self::new(adapter, usage_sink))
    }

    pub fn new(adapter: CompletionsAdapter, usage_sink: Arc<U>) -> Self {
        Self {
            adapter,
            usage_sink,
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let outcome = self.adapter.chat(&req).await;
        let record = ProviderCallRecord::from_outcome(&req, outcome.as_ref());
        self.usage_sink.record(record).await;
        outcome
    }
}
