//! Per-call usage records and where they go.
//!
//! Session metrics count calls and tokens for the client; these records are
//! the operator's view, one per HTTP attempt including failed ones.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::error::ProviderError;
use super::types::{ChatRequest, ChatResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderCallRecord {
    pub model: String,
    pub caller: &'static str,
    pub session_id: Option<Uuid>,
    pub batch_id: Option<String>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
    pub upstream_cost_nanodollars: Option<i64>,
    pub latency_ms: u64,
    pub status: CallStatus,
    pub error_code: Option<&'static str>,
    pub request_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ProviderCallRecord {
    /// A failed attempt is recorded with zero tokens and cost.
    pub fn from_outcome(req: &ChatRequest, outcome: Result<&ChatResponse, &ProviderError>) -> Self {
        let mut record = Self {
            model: req.model.model_id().to_string(),
            caller: req.attribution.caller,
            session_id: req.attribution.session_id,
            batch_id: req.attribution.batch.clone(),
            input_tokens: 0,
            output_tokens: 0,
            cost_nanodollars: 0,
            upstream_cost_nanodollars: None,
            latency_ms: 0,
            status: CallStatus::Success,
            error_code: None,
            request_id: None,
            timestamp: Utc::now(),
        };
        match outcome {
            Ok(resp) => {
                record.input_tokens = resp.input_tokens;
                record.output_tokens = resp.output_tokens;
                record.cost_nanodollars = resp.cost_nanodollars;
                record.upstream_cost_nanodollars = resp.upstream_cost_nanodollars;
                record.latency_ms = resp.latency.as_millis() as u64;
            }
            Err(err) => {
                record.status = CallStatus::Error;
                record.error_code = Some(err.code());
                record.request_id = err.request_id().map(str::to_string);
            }
        }
        record
    }
}

#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Must not fail the call it describes.
    async fn record(&self, record: ProviderCallRecord);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {}
}

/// One `tracing` event per call under the `assessment_orchestrator::usage`
/// target, so operators can route them separately.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        tracing::info!(
            target: "assessment_orchestrator::usage",
            model = %record.model,
            caller = record.caller,
            session_id = ?record.session_id,
            batch = record.batch_id.as_deref().unwrap_or(""),
            tokens = record.input_tokens + record.output_tokens,
            cost_nanos = record.cost_nanodollars,
            latency_ms = record.latency_ms,
            status = record.status.as_str(),
            error_code = record.error_code.unwrap_or(""),
            request_id = record.request_id.as_deref().unwrap_or(""),
            "reasoning call"
        );
    }
}

#[derive(Debug, Default)]
pub struct MemoryUsageSink {
    records: Mutex<Vec<ProviderCallRecord>>,
}

impl MemoryUsageSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ProviderCallRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl UsageSink for MemoryUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record);
    }
}
