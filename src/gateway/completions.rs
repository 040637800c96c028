//! HTTP client for OpenAI-compatible `/chat/completions` endpoints.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::pricing::chat_cost;
use super::types::{ChatRequest, ChatResponse, FinishReason, Message};

/// One attempt against a chat endpoint. No retries here.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

const PROVIDER: &str = "reasoning";
const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// A 429 without Retry-After waits this long.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

const MAX_RESPONSE_BYTES: usize = 1 << 20;

/// Roughly 125k tokens of prompt.
const MAX_INPUT_CHARS: usize = 500_000;

/// First-line openers that mean the model declined the task.
static REFUSAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*(refus|i cannot|i can't|i won't|i will not|i(?: am|'m) unable to|unable to (?:comply|assist|help|provide))",
    )
    .expect("Invalid refusal regex")
});

fn is_refusal(text: &str) -> bool {
    let first_line = text.trim_start().lines().next().unwrap_or("");
    REFUSAL.is_match(first_line) || text.to_lowercase().contains("request was refused")
}

#[derive(Debug, Clone)]
pub struct CompletionsAdapter {
    client: reqwest::Client,
    chat_url: String,
    timeout: Duration,
}

impl CompletionsAdapter {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_config(api_key, DEFAULT_BASE_URL, DEFAULT_TIMEOUT, None, None)
    }

    /// `REASONING_API_KEY` is required. `REASONING_BASE_URL`,
    /// `REASONING_TIMEOUT_SECONDS`, `REASONING_REFERER` and
    /// `REASONING_APP_TITLE` are optional.
    pub fn from_env() -> Result<Self, ProviderError> {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());

        let api_key = var("REASONING_API_KEY")
            .ok_or_else(|| ProviderError::config("REASONING_API_KEY not set"))?;
        let base_url = var("REASONING_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let timeout = var("REASONING_TIMEOUT_SECONDS")
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT);

        Self::with_config(
            api_key,
            base_url,
            timeout,
            var("REASONING_REFERER"),
            var("REASONING_APP_TITLE"),
        )
    }

    /// `referer` and `app_title` become the attribution headers some
    /// routers use for per-application dashboards.
    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
        referer: Option<String>,
        app_title: Option<String>,
    ) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", api_key.into()))
            .map_err(|_| ProviderError::config("API key is not a valid header value"))?;
        headers.insert(AUTHORIZATION, bearer);

        let optional = [("http-referer", referer), ("x-title", app_title)];
        for (name, value) in optional {
            if let Some(v) = value.and_then(|v| HeaderValue::from_str(&v).ok()) {
                headers.insert(HeaderName::from_static(name), v);
            }
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("http client: {e}")))?;

        let base_url = base_url.into();
        Ok(Self {
            client,
            chat_url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            timeout,
        })
    }

    fn send_error(&self, err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout(self.timeout, None)
        } else {
            ProviderError::Http(err)
        }
    }

    async fn read_capped(&self, mut response: reqwest::Response) -> Result<Vec<u8>, ProviderError> {
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(|e| self.send_error(e))? {
            if bytes.len() + chunk.len() > MAX_RESPONSE_BYTES {
                return Err(ProviderError::provider(
                    PROVIDER,
                    format!("response exceeds {MAX_RESPONSE_BYTES} bytes"),
                    false,
                ));
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(bytes)
    }

    /// Non-2xx: 429 is a remote rate limit, 408/504 a timeout, 400/422 the
    /// caller's fault, other 5xx transient, anything else permanent.
    fn classify_failure(
        &self,
        status: StatusCode,
        retry_after: Option<Duration>,
        body: &[u8],
        ctx: ErrorContext,
    ) -> ProviderError {
        let error = serde_json::from_slice::<WireResponse>(body).ok().and_then(|r| r.error);
        let (message, ctx) = match error {
            Some(e) => (e.message.unwrap_or_default(), ctx.with_code_value(e.code)),
            None => (format!("HTTP {}", status.as_u16()), ctx),
        };

        match status.as_u16() {
            429 => ProviderError::rate_limited_remote(retry_after.unwrap_or(DEFAULT_RETRY_AFTER), ctx),
            408 | 504 => ProviderError::Timeout(self.timeout, Some(ctx)),
            400 | 422 => ProviderError::invalid_request(message).with_context(ctx),
            code => ProviderError::provider(PROVIDER, message, code >= 500).with_context(ctx),
        }
    }
}

/// Retry-After in delta-seconds form only; HTTP dates are ignored.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?;
    raw.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

// =============================================================================
// WIRE TYPES
// =============================================================================

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    choices: Vec<WireChoice>,
    usage: Option<WireUsage>,
    error: Option<WireError>,
}

#[derive(Deserialize)]
struct WireChoice {
    #[serde(default)]
    message: WireMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct WireMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

impl WireMessage {
    /// JSON-mode output sometimes arrives as tool-call arguments with empty
    /// content.
    fn into_text(self) -> String {
        match self.content {
            Some(text) if !text.trim().is_empty() => text,
            _ => self
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .filter_map(|call| call.function?.arguments)
                .find(|args| !args.trim().is_empty())
                .unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
struct WireToolCall {
    function: Option<WireFunction>,
}

#[derive(Deserialize)]
struct WireFunction {
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    cost_details: Option<WireCost>,
}

#[derive(Deserialize)]
struct WireCost {
    upstream_inference_cost: Option<f64>,
}

#[derive(Deserialize)]
struct WireError {
    message: Option<String>,
    code: Option<serde_json::Value>,
}

// =============================================================================
// CALL
// =============================================================================

#[async_trait]
impl ChatProvider for CompletionsAdapter {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let input_chars = req.input_chars();
        if input_chars > MAX_INPUT_CHARS {
            return Err(ProviderError::invalid_request(format!(
                "prompt is {input_chars} chars, limit {MAX_INPUT_CHARS}"
            )));
        }

        let started = Instant::now();
        let body = WireRequest {
            model: req.model.model_id(),
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            response_format: req
                .json_mode
                .then(|| serde_json::json!({ "type": "json_object" })),
        };

        let response = self
            .client
            .post(&self.chat_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.send_error(e))?;

        let status = response.status();
        let wait = retry_after(response.headers());
        let ctx = ErrorContext::for_status(status.as_u16(), request_id(response.headers()));
        let bytes = self.read_capped(response).await?;

        if !status.is_success() {
            return Err(self.classify_failure(status, wait, &bytes, ctx));
        }

        let parsed: WireResponse = serde_json::from_slice(&bytes).map_err(|e| {
            ProviderError::provider(PROVIDER, format!("unparseable response: {e}"), false)
        })?;

        if let Some(error) = parsed.error {
            let message = error.message.unwrap_or_default();
            return Err(if is_refusal(&message) {
                ProviderError::refused(message)
            } else {
                ProviderError::provider(PROVIDER, message, false)
            });
        }

        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::provider(PROVIDER, "response has no choices", false))?;
        let finish_reason = FinishReason::parse(choice.finish_reason.as_deref());
        let content = choice.message.into_text();

        if is_refusal(&content) {
            return Err(ProviderError::refused(content));
        }

        let usage = parsed
            .usage
            .ok_or_else(|| ProviderError::provider(PROVIDER, "response has no usage", false))?;
        let upstream_cost_nanodollars = usage
            .cost_details
            .and_then(|c| c.upstream_inference_cost)
            .map(|usd| ((usd * 1e9).round() as i64).max(0));

        Ok(ChatResponse {
            content,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cost_nanodollars: chat_cost(
                req.model.model_id(),
                usage.prompt_tokens,
                usage.completion_tokens,
            ),
            upstream_cost_nanodollars,
            latency: started.elapsed(),
            finish_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refusal_detection_looks_at_first_line() {
        assert!(is_refusal("I cannot help with that."));
        assert!(is_refusal("  I'm unable to assess this"));
        assert!(!is_refusal("{\"control_mappings\": []}\nI cannot"));
    }

    #[test]
    fn retry_after_parses_delta_seconds_only() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(retry_after(&headers), None);
    }

    #[test]
    fn tool_call_arguments_stand_in_for_empty_content() {
        let msg: WireMessage = serde_json::from_value(serde_json::json!({
            "content": " ",
            "tool_calls": [{ "function": { "arguments": "" } }, { "function": { "arguments": "{}" } }]
        }))
        .unwrap();
        assert_eq!(msg.into_text(), "{}");
    }
}
