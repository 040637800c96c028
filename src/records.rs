//! Records derived by the reasoning passes, keyed by control ID so they can
//! be correlated and served before a session completes.
//!
//! Gaps carry `risk_level`. It is the only name the attribute has, on the
//! wire and in serialized results.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::artifacts::OscalValidation;
use crate::catalog::{Baseline, ControlFamily, ControlId};
use crate::estimate::ProcessingEstimate;
use crate::prioritize::Depth;
use crate::scope::{AssessmentMode, ResolvedScope};

// =============================================================================
// SHARED ENUMS
// =============================================================================

/// How a record came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Parsed from a schema-conformant service response.
    #[default]
    Reasoned,
    /// Carried over from an earlier pass without a new call.
    Reused,
    /// Conservative stand-in after a malformed or rejected response.
    Fallback,
    /// Conservative stand-in after transient failures exhausted retries.
    Unresolved,
}

impl Resolution {
    pub fn needs_review(&self) -> bool {
        matches!(self, Self::Fallback | Self::Unresolved)
    }
}

/// Risk attached to a gap, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Informational,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Informational => "informational",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    /// Unknown values become `medium`.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "informational" | "info" => Self::Informational,
            "low" => Self::Low,
            "high" => Self::High,
            "critical" => Self::Critical,
            _ => Self::Medium,
        }
    }

    pub fn is_elevated(&self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImplementationStatus {
    Implemented,
    PartiallyImplemented,
    Planned,
    NotImplemented,
}

impl ImplementationStatus {
    /// Unknown values become `not_implemented`.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "implemented" => Self::Implemented,
            "partially_implemented" | "partial" => Self::PartiallyImplemented,
            "planned" => Self::Planned,
            _ => Self::NotImplemented,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Implemented => "implemented",
            Self::PartiallyImplemented => "partially_implemented",
            Self::Planned => "planned",
            Self::NotImplemented => "not_implemented",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Effort {
    Low,
    Medium,
    High,
}

impl Effort {
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" | "small" => Self::Low,
            "high" | "large" => Self::High,
            _ => Self::Medium,
        }
    }
}

// =============================================================================
// EVIDENCE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Pdf,
    Docx,
    Screenshot,
    Diagram,
    Config,
    Policy,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceArtifact {
    pub id: String,
    pub filename: String,
    pub file_type: EvidenceKind,
    pub content_summary: String,
    pub extracted_text: String,
    pub metadata: BTreeMap<String, String>,
    pub controls_mentioned: Vec<ControlId>,
    pub confidence_score: f64,
    pub resolution: Resolution,
}

// =============================================================================
// MAPPINGS AND GAPS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMapping {
    pub control_id: ControlId,
    pub control_name: String,
    pub control_family: ControlFamily,
    pub evidence_ids: Vec<String>,
    pub implementation_status: ImplementationStatus,
    pub implementation_description: String,
    pub confidence_score: f64,
    pub gaps_identified: Vec<String>,
    pub resolution: Resolution,
}

impl ControlMapping {
    /// Minimal `not_implemented` record flagged for review.
    pub fn fallback(control_id: ControlId, reason: &str) -> Self {
        Self {
            control_id,
            control_name: format!("{} Control", control_id.family().name()),
            control_family: control_id.family(),
            evidence_ids: Vec::new(),
            implementation_status: ImplementationStatus::NotImplemented,
            implementation_description: format!("Needs review: {reason}"),
            confidence_score: 0.0,
            gaps_identified: Vec::new(),
            resolution: Resolution::Fallback,
        }
    }

    pub fn with_status(mut self, status: ImplementationStatus) -> Self {
        self.implementation_status = status;
        self
    }

    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlGap {
    pub control_id: ControlId,
    pub control_name: String,
    pub gap_description: String,
    pub risk_level: RiskLevel,
    /// 0–100.
    pub risk_score: u8,
    pub affected_requirements: Vec<String>,
    pub recommended_actions: Vec<String>,
    pub resolution: Resolution,
}

impl ControlGap {
    pub fn new(control_id: ControlId, description: impl Into<String>, risk_level: RiskLevel) -> Self {
        Self {
            control_id,
            control_name: String::new(),
            gap_description: description.into(),
            risk_level,
            risk_score: default_risk_score(risk_level),
            affected_requirements: Vec::new(),
            recommended_actions: Vec::new(),
            resolution: Resolution::Reasoned,
        }
    }

    /// Medium-risk gap that keeps an unanalysed control out of the passing tier.
    pub fn fallback(control_id: ControlId, reason: &str, resolution: Resolution) -> Self {
        Self {
            control_name: format!("{} Control", control_id.family().name()),
            recommended_actions: vec![
                format!("Manually review evidence for {control_id}"),
                "Re-run the assessment once the reasoning service is available".to_string(),
            ],
            affected_requirements: vec![control_id.to_string()],
            resolution,
            ..Self::new(
                control_id,
                format!("Automated analysis unavailable ({reason}); manual review required"),
                RiskLevel::Medium,
            )
        }
    }
}

pub fn default_risk_score(risk: RiskLevel) -> u8 {
    match risk {
        RiskLevel::Informational => 10,
        RiskLevel::Low => 25,
        RiskLevel::Medium => 50,
        RiskLevel::High => 75,
        RiskLevel::Critical => 90,
    }
}

// =============================================================================
// OSCAL ARTIFACTS
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentImplementation {
    pub control_id: ControlId,
    pub status: ImplementationStatus,
    pub evidence: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OscalComponent {
    pub uuid: Uuid,
    pub component_id: String,
    pub title: String,
    pub description: String,
    pub component_type: String,
    pub control_implementations: Vec<ComponentImplementation>,
    pub props: BTreeMap<String, String>,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Milestone {
    pub milestone: String,
    pub target_date: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoamEntry {
    pub uuid: Uuid,
    pub poam_id: String,
    pub title: String,
    pub description: String,
    pub related_controls: Vec<ControlId>,
    pub risk_level: RiskLevel,
    pub milestones: Vec<Milestone>,
    pub remediation_plan: String,
    pub status: String,
    pub resolution: Resolution,
}

// =============================================================================
// VALIDATION AND REMEDIATION
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlValidation {
    pub control_id: ControlId,
    pub control_title: String,
    pub is_valid: bool,
    pub coverage_score: f64,
    pub requirements_met: Vec<String>,
    pub requirements_not_met: Vec<String>,
    pub recommendations: Vec<String>,
    pub depth: Depth,
    pub resolution: Resolution,
}

impl ControlValidation {
    /// Status carried over from the mapping without a new call.
    pub fn reused(mapping: &ControlMapping) -> Self {
        Self {
            control_id: mapping.control_id,
            control_title: mapping.control_name.clone(),
            is_valid: mapping.implementation_status == ImplementationStatus::Implemented,
            coverage_score: mapping.confidence_score,
            requirements_met: Vec::new(),
            requirements_not_met: Vec::new(),
            recommendations: Vec::new(),
            depth: Depth::Skip,
            resolution: Resolution::Reused,
        }
    }

    pub fn fallback(control_id: ControlId, depth: Depth, reason: &str, resolution: Resolution) -> Self {
        Self {
            control_id,
            control_title: "Unknown".to_string(),
            is_valid: false,
            coverage_score: 0.0,
            requirements_met: Vec::new(),
            requirements_not_met: vec![format!("Validation error: {reason}")],
            recommendations: Vec::new(),
            depth,
            resolution,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeSnippet {
    pub language: String,
    pub description: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationTask {
    pub task_id: String,
    pub title: String,
    pub description: String,
    pub priority: RiskLevel,
    pub effort_estimate: Effort,
    pub related_gaps: Vec<ControlId>,
    pub implementation_guide: String,
    pub code_snippets: Vec<CodeSnippet>,
    pub verification_steps: Vec<String>,
    pub depth: Depth,
    pub resolution: Resolution,
}

// =============================================================================
// SESSION RESULTS
// =============================================================================

/// The five reasoning passes, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassKind {
    EvidenceExtraction,
    ControlMapping,
    ArtifactGeneration,
    Validation,
    RemediationPlanning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeSummary {
    pub baseline: Baseline,
    pub baseline_label: String,
    pub control_families: Vec<ControlFamily>,
    pub mode: AssessmentMode,
    pub controls_in_scope: usize,
    pub controls_processed: usize,
    pub predefined_scope: Option<String>,
    pub fingerprint: String,
}

impl From<&ResolvedScope> for ScopeSummary {
    fn from(scope: &ResolvedScope) -> Self {
        Self {
            baseline: scope.baseline,
            baseline_label: scope.baseline_label.to_string(),
            control_families: scope.families.clone(),
            mode: scope.mode,
            controls_in_scope: scope.len(),
            controls_processed: 0,
            predefined_scope: scope.template.clone(),
            fingerprint: scope.fingerprint.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingMetrics {
    pub controls_in_scope: usize,
    pub controls_validated: usize,
    pub controls_skipped: usize,
    pub critical_controls: usize,
    pub standard_controls: usize,
    pub passing_controls: usize,
    pub api_calls_batch: usize,
    pub api_calls_individual: usize,
    pub retries: usize,
    pub batches_fallback: usize,
    pub batches_unresolved: usize,
    pub tokens_used: u64,
    pub tokens_estimated: u64,
    pub cost_nanodollars: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ProcessingMetrics {
    pub fn new(controls_in_scope: usize, tokens_estimated: u64) -> Self {
        Self {
            controls_in_scope,
            controls_validated: 0,
            controls_skipped: 0,
            critical_controls: 0,
            standard_controls: 0,
            passing_controls: 0,
            api_calls_batch: 0,
            api_calls_individual: 0,
            retries: 0,
            batches_fallback: 0,
            batches_unresolved: 0,
            tokens_used: 0,
            tokens_estimated,
            cost_nanodollars: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn api_calls_made(&self) -> usize {
        self.api_calls_batch + self.api_calls_individual
    }

    /// Percent of the estimate left unspent; negative when over.
    pub fn token_efficiency_percent(&self) -> f64 {
        if self.tokens_estimated == 0 {
            return 0.0;
        }
        round_to(
            (1.0 - self.tokens_used as f64 / self.tokens_estimated as f64) * 100.0,
            2,
        )
    }

    pub fn duration_seconds(&self) -> f64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssessmentSummary {
    pub total_controls_analyzed: usize,
    pub implemented_controls: usize,
    pub gaps_identified: usize,
    pub critical_gaps: usize,
    pub needs_review: usize,
    pub overall_compliance_score: f64,
}

/// Everything a session has produced so far. Passes append to it as their
/// batches complete, so a reader may see a partially filled value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssessmentResults {
    pub session_id: Uuid,
    pub scope: ScopeSummary,
    pub estimate: ProcessingEstimate,
    pub evidence: Vec<EvidenceArtifact>,
    pub control_mappings: Vec<ControlMapping>,
    pub control_gaps: Vec<ControlGap>,
    pub oscal_components: Vec<OscalComponent>,
    pub poam_entries: Vec<PoamEntry>,
    pub nist_validation_results: Vec<ControlValidation>,
    pub oscal_validation: Vec<OscalValidation>,
    pub remediation_tasks: Vec<RemediationTask>,
    pub unresolved_controls: BTreeSet<ControlId>,
    pub passes_completed: Vec<PassKind>,
    pub metrics: ProcessingMetrics,
    pub summary: AssessmentSummary,
}

impl AssessmentResults {
    pub fn new(session_id: Uuid, scope: &ResolvedScope, estimate: ProcessingEstimate) -> Self {
        let metrics = ProcessingMetrics::new(scope.len(), estimate.estimated_tokens);
        Self {
            session_id,
            scope: ScopeSummary::from(scope),
            estimate,
            evidence: Vec::new(),
            control_mappings: Vec::new(),
            control_gaps: Vec::new(),
            oscal_components: Vec::new(),
            poam_entries: Vec::new(),
            nist_validation_results: Vec::new(),
            oscal_validation: Vec::new(),
            remediation_tasks: Vec::new(),
            unresolved_controls: BTreeSet::new(),
            passes_completed: Vec::new(),
            metrics,
            summary: AssessmentSummary::default(),
        }
    }

    pub fn refresh_summary(&mut self) {
        let implemented = self
            .control_mappings
            .iter()
            .filter(|m| m.implementation_status == ImplementationStatus::Implemented)
            .count();
        let needs_review = self
            .control_mappings
            .iter()
            .filter(|m| m.resolution.needs_review())
            .count();
        self.scope.controls_processed = self.control_mappings.len();
        self.summary = AssessmentSummary {
            total_controls_analyzed: self.control_mappings.len(),
            implemented_controls: implemented,
            gaps_identified: self.control_gaps.len(),
            critical_gaps: self
                .control_gaps
                .iter()
                .filter(|g| g.risk_level == RiskLevel::Critical)
                .count(),
            needs_review,
            overall_compliance_score: compliance_score(&self.control_mappings, &self.control_gaps),
        };
    }
}

/// `implemented / (mappings + gaps) × 100`, rounded to 2 decimals.
pub fn compliance_score(mappings: &[ControlMapping], gaps: &[ControlGap]) -> f64 {
    if mappings.is_empty() {
        return 0.0;
    }
    let implemented = mappings
        .iter()
        .filter(|m| m.implementation_status == ImplementationStatus::Implemented)
        .count();
    let total = mappings.len() + gaps.len();
    round_to(implemented as f64 / total as f64 * 100.0, 2)
}

pub(crate) fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
