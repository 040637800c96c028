//! What can go wrong talking to the reasoning service.
//!
//! The scheduler only cares about two questions: is this transient, and
//! did the service ask us to wait. Everything else is carried for logs and
//! usage records.

use std::time::Duration;

use thiserror::Error;

/// Where a rate limit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitSource {
    /// The shared request budget had no capacity within the wait bound.
    Local,
    /// The service answered 429.
    Remote,
}

/// HTTP-level details of a failed call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub http_status: Option<u16>,
    /// Machine-readable code from the error body, e.g. "rate_limit_exceeded".
    pub provider_code: Option<String>,
    /// `x-request-id` response header.
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_status(status: u16, request_id: Option<String>) -> Self {
        Self {
            http_status: Some(status),
            provider_code: None,
            request_id,
        }
    }

    /// Error codes arrive as strings or numbers depending on the vendor.
    pub fn with_code_value(mut self, code: Option<serde_json::Value>) -> Self {
        self.provider_code = match code {
            Some(serde_json::Value::String(s)) => Some(s),
            Some(serde_json::Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };
        self
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("rate limited ({limit_source:?}), retry after {retry_after:?}")]
    RateLimited {
        retry_after: Duration,
        limit_source: RateLimitSource,
        context: Option<ErrorContext>,
    },

    #[error("invalid request: {message}")]
    InvalidRequest {
        message: String,
        context: Option<ErrorContext>,
    },

    /// The model declined to answer.
    #[error("refused: {message}")]
    Refused {
        message: String,
        context: Option<ErrorContext>,
    },

    #[error("{provider} error: {message}")]
    Provider {
        provider: &'static str,
        message: String,
        retryable: bool,
        context: Option<ErrorContext>,
    },

    #[error("timeout after {0:?}")]
    Timeout(Duration, Option<ErrorContext>),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway setup: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn rate_limited_local(retry_after: Duration) -> Self {
        Self::RateLimited {
            retry_after,
            limit_source: RateLimitSource::Local,
            context: None,
        }
    }

    pub fn rate_limited_remote(retry_after: Duration, context: ErrorContext) -> Self {
        Self::RateLimited {
            retry_after,
            limit_source: RateLimitSource::Remote,
            context: Some(context),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            context: None,
        }
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self::Refused {
            message: message.into(),
            context: None,
        }
    }

    pub fn provider(provider: &'static str, message: impl Into<String>, retryable: bool) -> Self {
        Self::Provider {
            provider,
            message: message.into(),
            retryable,
            context: None,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Attach HTTP details. No-op for variants that cannot carry them.
    pub fn with_context(mut self, ctx: ErrorContext) -> Self {
        if let Some(slot) = self.context_slot() {
            *slot = Some(ctx);
        }
        self
    }

    fn context_slot(&mut self) -> Option<&mut Option<ErrorContext>> {
        match self {
            Self::RateLimited { context, .. }
            | Self::InvalidRequest { context, .. }
            | Self::Refused { context, .. }
            | Self::Provider { context, .. }
            | Self::Timeout(_, context) => Some(context),
            Self::Http(_) | Self::Config(_) => None,
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::RateLimited { context, .. }
            | Self::InvalidRequest { context, .. }
            | Self::Refused { context, .. }
            | Self::Provider { context, .. }
            | Self::Timeout(_, context) => context.as_ref(),
            Self::Http(_) | Self::Config(_) => None,
        }
    }

    /// Transient failures are retried with backoff; the rest resolve the
    /// batch to fallback records immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout(..) => true,
            Self::Provider { retryable, .. } => *retryable,
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::InvalidRequest { .. } | Self::Refused { .. } | Self::Config(_) => false,
        }
    }

    /// Server-requested wait, when the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Short label for logs and usage records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { limit_source, .. } => match limit_source {
                RateLimitSource::Local => "rate_limited_local",
                RateLimitSource::Remote => "rate_limited_remote",
            },
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Refused { .. } => "refused",
            Self::Provider { .. } => "provider_error",
            Self::Timeout(..) => "timeout",
            Self::Http(_) => "http_error",
            Self::Config(_) => "config_error",
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.context()?.request_id.as_deref()
    }
}
