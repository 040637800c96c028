//! Pre-commit cost and latency estimates.
//!
//! Everything here is O(1) in the control count and never touches the
//! network. The same per-mode constants size the token budget of each
//! reasoning call, so cost tuning happens in one place.

use serde::{Deserialize, Serialize};

use crate::prioritize::Depth;
use crate::records::round_to;
use crate::scope::{self, AssessmentMode, AssessmentScope, ResolvedScope, ScopeError};

/// Floor for a batched call so tiny batches still have room to answer.
const MIN_CALL_TOKENS: u64 = 512;

/// Per-control cost constants for one mode.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModeProfile {
    pub tokens_per_control: u64,
    pub seconds_per_control: f64,
}

impl ModeProfile {
    pub const fn new(tokens_per_control: u64, seconds_per_control: f64) -> Self {
        Self {
            tokens_per_control,
            seconds_per_control,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub quick: ModeProfile,
    pub smart: ModeProfile,
    pub deep: ModeProfile,
    pub input_nanos_per_token: i64,
    pub output_nanos_per_token: i64,
    /// Fraction of estimated tokens that are output tokens.
    pub output_token_share: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            quick: ModeProfile::new(200, 0.5),
            smart: ModeProfile::new(1_000, 1.5),
            deep: ModeProfile::new(8_000, 5.0),
            // $5 per 1M tokens either way
            input_nanos_per_token: 5_000,
            output_nanos_per_token: 5_000,
            output_token_share: 0.25,
        }
    }
}

impl EstimatorConfig {
    pub fn profile(&self, mode: AssessmentMode) -> ModeProfile {
        match mode {
            AssessmentMode::Quick => self.quick,
            AssessmentMode::Smart => self.smart,
            AssessmentMode::Deep => self.deep,
        }
    }

    /// `max_tokens` for one reasoning call covering `controls` controls.
    ///
    /// Batched calls get the mode's per-control budget per control; an
    /// individual call is a full-depth pass and gets the deep budget. Both
    /// are capped by `max_tokens_per_request`.
    pub fn call_token_budget(
        &self,
        mode: AssessmentMode,
        depth: Depth,
        controls: usize,
        max_tokens_per_request: u32,
    ) -> u32 {
        let cap = u64::from(max_tokens_per_request);
        let raw = match depth {
            Depth::Skip => return 0,
            Depth::Batched => self
                .profile(mode)
                .tokens_per_control
                .saturating_mul(controls.max(1) as u64)
                .max(MIN_CALL_TOKENS),
            Depth::Individual => self.deep.tokens_per_control,
        };
        raw.min(cap) as u32
    }
}

/// Predicted resources for a scope and mode. Derived, never stored apart
/// from the copy a session keeps for its metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingEstimate {
    pub control_count: usize,
    pub mode: AssessmentMode,
    pub estimated_tokens: u64,
    pub estimated_input_tokens: u64,
    pub estimated_output_tokens: u64,
    pub estimated_minutes: f64,
    pub estimated_cost_usd: f64,
    pub estimated_cost_nanodollars: i64,
}

pub fn estimate(control_count: usize, mode: AssessmentMode, config: &EstimatorConfig) -> ProcessingEstimate {
    let profile = config.profile(mode);
    let tokens = profile.tokens_per_control.saturating_mul(control_count as u64);

    let share = config.output_token_share.clamp(0.0, 1.0);
    let output_tokens = (tokens as f64 * share).round() as u64;
    let input_tokens = tokens - output_tokens.min(tokens);

    let cost_nanos = (input_tokens as i64).saturating_mul(config.input_nanos_per_token)
        + (output_tokens as i64).saturating_mul(config.output_nanos_per_token);
    let minutes = control_count as f64 * profile.seconds_per_control / 60.0;

    ProcessingEstimate {
        control_count,
        mode,
        estimated_tokens: tokens,
        estimated_input_tokens: input_tokens,
        estimated_output_tokens: output_tokens,
        estimated_minutes: round_to(minutes, 1),
        estimated_cost_usd: round_to(cost_nanos as f64 / 1e9, 2),
        estimated_cost_nanodollars: cost_nanos,
    }
}

pub fn estimate_resolved(scope: &ResolvedScope, config: &EstimatorConfig) -> ProcessingEstimate {
    estimate(scope.len(), scope.mode, config)
}

/// Resolve then estimate; the client-facing scope preview.
pub fn estimate_scope(
    request: &AssessmentScope,
    config: &EstimatorConfig,
) -> Result<(ResolvedScope, ProcessingEstimate), ScopeError> {
    let resolved = scope::resolve(request)?;
    let estimate = estimate_resolved(&resolved, config);
    Ok((resolved, estimate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Baseline;

    #[test]
    fn low_quick_preview() {
        let request = AssessmentScope::baseline(Baseline::Low, AssessmentMode::Quick);
        let (resolved, est) = estimate_scope(&request, &EstimatorConfig::default()).unwrap();
        assert_eq!(est.control_count, resolved.len());
        assert_eq!(est.control_count, 139);
        assert_eq!(est.estimated_tokens, 139 * 200);
        assert_eq!(est.estimated_output_tokens, 6_950);
        assert_eq!(est.estimated_input_tokens, 20_850);
        assert_eq!(est.estimated_minutes, 1.2);
        assert_eq!(est.estimated_cost_nanodollars, 139_000_000);
        assert_eq!(est.estimated_cost_usd, 0.14);
    }

    #[test]
    fn monotonic_in_control_count() {
        let config = EstimatorConfig::default();
        for mode in [AssessmentMode::Quick, AssessmentMode::Smart, AssessmentMode::Deep] {
            let mut prev = estimate(0, mode, &config);
            for n in 1..300 {
                let next = estimate(n, mode, &config);
                assert!(next.estimated_tokens >= prev.estimated_tokens);
                assert!(next.estimated_cost_nanodollars >= prev.estimated_cost_nanodollars);
                assert!(next.estimated_minutes >= prev.estimated_minutes);
                prev = next;
            }
        }
    }

    #[test]
    fn call_budgets_are_capped() {
        let config = EstimatorConfig::default();
        assert_eq!(config.call_token_budget(AssessmentMode::Quick, Depth::Batched, 10, 8_000), 2_000);
        assert_eq!(config.call_token_budget(AssessmentMode::Quick, Depth::Batched, 1, 8_000), 512);
        assert_eq!(config.call_token_budget(AssessmentMode::Smart, Depth::Batched, 15, 8_000), 8_000);
        assert_eq!(config.call_token_budget(AssessmentMode::Smart, Depth::Individual, 1, 4_096), 4_096);
        assert_eq!(config.call_token_budget(AssessmentMode::Deep, Depth::Skip, 3, 8_000), 0);
    }
}
