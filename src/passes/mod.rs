//! The five reasoning passes.
//!
//! Each pass owns a strict wire format for the service's answer. Unknown
//! fields are rejected at this boundary, so a renamed attribute (a gap's
//! `risk_level` coming back as `severity`, say) fails the whole batch into
//! its fallback records instead of surfacing later as a missing value.

pub mod artifacts;
pub mod evidence;
pub mod mapping;
pub mod remediation;
pub mod validation;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::catalog::ControlId;
use crate::estimate::EstimatorConfig;
use crate::gateway::{Attribution, ChatModel, ChatRequest, ChatResponse, FinishReason, Message};
use crate::prioritize::Depth;
use crate::scope::AssessmentMode;

pub use artifacts::ArtifactPass;
pub use evidence::EvidencePass;
pub use mapping::MappingPass;
pub use remediation::RemediationPass;
pub use validation::ValidationPass;

#[derive(Debug, Error)]
pub enum PassError {
    #[error("empty response")]
    Empty,
    #[error("response does not match the expected schema: {0}")]
    Schema(#[from] serde_json::Error),
    #[error("response omitted controls: {}", join_ids(.0))]
    MissingControls(Vec<ControlId>),
    #[error("response cut off at the token limit after {output_tokens} output tokens")]
    Truncated { output_tokens: u32 },
}

fn join_ids(ids: &[ControlId]) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningConfig {
    /// Model for batched and evidence calls.
    pub model: String,
    /// Model for individual full-depth calls.
    pub deep_model: String,
    pub max_tokens_per_request: u32,
    pub temperature: f32,
    /// Token budget for the evidence inventory sent with each mapping batch.
    pub inventory_token_budget: usize,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            model: "google/gemini-2.5-flash".to_string(),
            deep_model: "google/gemini-2.5-pro".to_string(),
            max_tokens_per_request: 8_000,
            temperature: 0.2,
            inventory_token_budget: 6_000,
        }
    }
}

/// Per-session inputs every pass needs to build its requests.
#[derive(Debug, Clone)]
pub struct PassContext {
    pub session_id: Uuid,
    pub mode: AssessmentMode,
    pub reasoning: ReasoningConfig,
    pub estimator: EstimatorConfig,
}

impl PassContext {
    pub fn request(
        &self,
        caller: &'static str,
        batch_id: &str,
        depth: Depth,
        controls: usize,
        system: &str,
        user: String,
    ) -> ChatRequest {
        let model = match depth {
            Depth::Individual => &self.reasoning.deep_model,
            Depth::Batched | Depth::Skip => &self.reasoning.model,
        };
        let max_tokens = self.estimator.call_token_budget(
            self.mode,
            depth,
            controls,
            self.reasoning.max_tokens_per_request,
        );
        ChatRequest::new(
            ChatModel::new(model.clone()),
            vec![Message::system(system), Message::user(user)],
            Attribution::new(caller)
                .with_session(self.session_id)
                .with_batch(batch_id),
        )
        .temperature(self.reasoning.temperature)
        .max_tokens(max_tokens)
        .json()
    }
}

/// Cut a model answer down to its first top-level JSON object, tolerating
/// markdown fences and surrounding prose.
pub(crate) fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(start) = trimmed.find('{') else {
        return trimmed;
    };
    let remainder = &trimmed[start..];

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in remainder.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return &remainder[..=i];
                }
            }
            _ => {}
        }
    }
    remainder
}

pub(crate) fn parse_strict<T: DeserializeOwned>(raw: &str) -> Result<T, PassError> {
    let body = extract_json(raw);
    if body.is_empty() {
        return Err(PassError::Empty);
    }
    Ok(serde_json::from_str(body)?)
}

/// A reply that hit the token limit is rejected before parsing; its JSON
/// may still close early and drop controls without saying so.
pub(crate) fn parse_reply<T: DeserializeOwned>(response: &ChatResponse) -> Result<T, PassError> {
    if response.finish_reason == FinishReason::Length {
        return Err(PassError::Truncated {
            output_tokens: response.output_tokens,
        });
    }
    parse_strict(&response.content)
}

/// Parse a control code from the wire; `None` for anything malformed.
pub(crate) fn wire_control(raw: &str) -> Option<ControlId> {
    raw.parse().ok()
}

pub(crate) fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

pub(crate) fn control_list(ids: &[ControlId]) -> String {
    join_ids(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_json_handles_fences_and_braces_in_strings() {
        let raw = "```json\n{\"a\": \"}{\", \"b\": {\"c\": 1}}\n```\ntrailing";
        assert_eq!(extract_json(raw), "{\"a\": \"}{\", \"b\": {\"c\": 1}}");
        assert_eq!(extract_json("no json"), "no json");
    }

    #[test]
    fn parse_strict_reports_schema_errors() {
        #[derive(Debug, Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Gap {
            #[allow(dead_code)]
            risk_level: String,
        }
        assert!(parse_strict::<Gap>(r#"{"risk_level": "high"}"#).is_ok());
        assert!(matches!(
            parse_strict::<Gap>(r#"{"severity": "high"}"#),
            Err(PassError::Schema(_))
        ));
        assert!(matches!(parse_strict::<Gap>("  "), Err(PassError::Empty)));
    }

    #[test]
    fn length_finish_is_reported_as_truncation() {
        let mut response = ChatResponse {
            content: r#"{"risk_level": "high"}"#.into(),
            input_tokens: 10,
            output_tokens: 8000,
            cost_nanodollars: 0,
            upstream_cost_nanodollars: None,
            latency: std::time::Duration::ZERO,
            finish_reason: FinishReason::Length,
        };
        let err = parse_reply::<serde_json::Value>(&response).unwrap_err();
        assert!(matches!(err, PassError::Truncated { output_tokens: 8000 }));
        assert!(err.to_string().contains("token limit"));

        response.finish_reason = FinishReason::Stop;
        assert!(parse_reply::<serde_json::Value>(&response).is_ok());
    }

    #[test]
    fn request_uses_deep_model_for_individual_calls() {
        let ctx = PassContext {
            session_id: Uuid::nil(),
            mode: AssessmentMode::Smart,
            reasoning: ReasoningConfig::default(),
            estimator: EstimatorConfig::default(),
        };
        let batched = ctx.request("t", "b-1", Depth::Batched, 3, "sys", "user".into());
        assert_eq!(batched.model.model_id(), "google/gemini-2.5-flash");
        assert_eq!(batched.max_tokens, Some(3_000));
        assert!(batched.json_mode);
        let deep = ctx.request("t", "b-2", Depth::Individual, 1, "sys", "user".into());
        assert_eq!(deep.model.model_id(), "google/gemini-2.5-pro");
        assert_eq!(deep.max_tokens, Some(8_000));
        assert_eq!(deep.attribution.batch.as_deref(), Some("b-2"));
    }
}
