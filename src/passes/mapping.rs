//! Pass 2: control mapping and gap analysis, batched over the resolved scope.

use std::collections::BTreeSet;

use serde::Deserialize;

use super::{clamp_unit, control_list, parse_reply, wire_control, PassContext, PassError};
use crate::catalog::ControlId;
use crate::evidence::truncate_to_tokens;
use crate::gateway::{ChatRequest, ChatResponse};
use crate::records::{
    default_risk_score, ControlGap, ControlMapping, EvidenceArtifact, ImplementationStatus,
    Resolution, RiskLevel,
};
use crate::scheduler::{Batch, BatchCall};

const SYSTEM: &str = "You are a NIST SP 800-53 Rev 5 assessor. Map the evidence inventory to each listed control \
and identify gaps. Respond with one JSON object with exactly two keys: \"control_mappings\" (one entry per listed \
control: control_id, control_name, control_family, implementation_status [implemented | partially_implemented | \
planned | not_implemented], implementation_description, confidence_score 0-1, evidence_artifacts [evidence ids], \
gaps_identified [strings]) and \"control_gaps\" (control_id, control_name, gap_description, risk_level \
[informational | low | medium | high | critical], risk_score 0-100, affected_requirements, recommended_actions).";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireMappingResponse {
    control_mappings: Vec<WireMapping>,
    #[serde(default)]
    control_gaps: Vec<WireGap>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireMapping {
    control_id: String,
    #[serde(default)]
    control_name: String,
    #[serde(default)]
    #[allow(dead_code)]
    control_family: Option<String>,
    implementation_status: String,
    #[serde(default)]
    implementation_description: String,
    #[serde(default)]
    confidence_score: f64,
    #[serde(default)]
    evidence_artifacts: Vec<String>,
    #[serde(default)]
    gaps_identified: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireGap {
    control_id: String,
    #[serde(default)]
    control_name: String,
    gap_description: String,
    risk_level: String,
    #[serde(default)]
    risk_score: Option<f64>,
    #[serde(default)]
    affected_requirements: Vec<String>,
    #[serde(default)]
    recommended_actions: Vec<String>,
}

/// Mappings and gaps for one batch.
#[derive(Debug, Default)]
pub struct MappingOutput {
    pub mappings: Vec<ControlMapping>,
    pub gaps: Vec<ControlGap>,
}

pub struct MappingPass<'a> {
    ctx: &'a PassContext,
    inventory: String,
    evidence_ids: BTreeSet<String>,
}

impl<'a> MappingPass<'a> {
    pub fn new(ctx: &'a PassContext, evidence: &[EvidenceArtifact]) -> Self {
        Self {
            ctx,
            inventory: inventory(evidence, ctx.reasoning.inventory_token_budget),
            evidence_ids: evidence.iter().map(|e| e.id.clone()).collect(),
        }
    }

    /// A `not_implemented` mapping plus a `medium` gap per control, so an
    /// unanalysed control is never tiered passing.
    pub fn fallback(batch: &Batch<ControlId>, reason: &str, resolution: Resolution) -> MappingOutput {
        let mut out = MappingOutput::default();
        for id in &batch.items {
            out.mappings
                .push(ControlMapping::fallback(*id, reason).with_resolution(resolution));
            out.gaps.push(ControlGap::fallback(*id, reason, resolution));
        }
        out
    }
}

/// Evidence inventory shared by every mapping batch, cut to `budget` tokens.
pub fn inventory(evidence: &[EvidenceArtifact], budget: usize) -> String {
    let mut out = String::new();
    for artifact in evidence {
        out.push_str(&format!(
            "[{}] {} ({:?}, confidence {:.2})\nSummary: {}\n",
            artifact.id, artifact.filename, artifact.file_type, artifact.confidence_score, artifact.content_summary
        ));
        if !artifact.controls_mentioned.is_empty() {
            out.push_str("Controls mentioned: ");
            out.push_str(&control_list(&artifact.controls_mentioned));
            out.push('\n');
        }
        if !artifact.extracted_text.is_empty() {
            out.push_str("Excerpt: ");
            out.push_str(&artifact.extracted_text);
            out.push('\n');
        }
        out.push('\n');
    }
    if out.is_empty() {
        out.push_str("No evidence was provided.\n");
    }
    truncate_to_tokens(&out, budget)
}

impl BatchCall<ControlId> for MappingPass<'_> {
    type Output = MappingOutput;
    type Error = PassError;

    fn request(&self, batch: &Batch<ControlId>) -> ChatRequest {
        let user = format!(
            "Controls to assess: {}\n\nEvidence inventory:\n{}",
            control_list(&batch.items),
            self.inventory
        );
        self.ctx
            .request("passes::mapping", &batch.id, batch.depth, batch.len(), SYSTEM, user)
    }

    fn parse(&self, batch: &Batch<ControlId>, response: &ChatResponse) -> Result<MappingOutput, PassError> {
        let wire: WireMappingResponse = parse_reply(response)?;
        let wanted: BTreeSet<ControlId> = batch.items.iter().copied().collect();

        let mut out = MappingOutput::default();
        let mut seen = BTreeSet::new();
        for m in wire.control_mappings {
            let Some(id) = wire_control(&m.control_id).filter(|id| wanted.contains(id)) else {
                continue;
            };
            if !seen.insert(id) {
                continue;
            }
            out.mappings.push(ControlMapping {
                control_id: id,
                control_name: non_empty(m.control_name, || format!("{} Control", id.family().name())),
                control_family: id.family(),
                evidence_ids: m
                    .evidence_artifacts
                    .into_iter()
                    .filter(|e| self.evidence_ids.contains(e))
                    .collect(),
                implementation_status: ImplementationStatus::parse_lenient(&m.implementation_status),
                implementation_description: m.implementation_description,
                confidence_score: clamp_unit(m.confidence_score),
                gaps_identified: m.gaps_identified,
                resolution: Resolution::Reasoned,
            });
        }

        let missing: Vec<ControlId> = batch.items.iter().filter(|id| !seen.contains(id)).copied().collect();
        if !missing.is_empty() {
            return Err(PassError::MissingControls(missing));
        }

        for g in wire.control_gaps {
            let Some(id) = wire_control(&g.control_id).filter(|id| wanted.contains(id)) else {
                continue;
            };
            let risk_level = RiskLevel::parse_lenient(&g.risk_level);
            let risk_score = g
                .risk_score
                .filter(|s| s.is_finite())
                .map(|s| s.clamp(0.0, 100.0).round() as u8)
                .unwrap_or_else(|| default_risk_score(risk_level));
            let control_name = out
                .mappings
                .iter()
                .find(|m| m.control_id == id)
                .map(|m| m.control_name.clone())
                .unwrap_or_default();
            out.gaps.push(ControlGap {
                control_id: id,
                control_name: non_empty(g.control_name, || control_name),
                gap_description: g.gap_description,
                risk_level,
                risk_score,
                affected_requirements: g.affected_requirements,
                recommended_actions: g.recommended_actions,
                resolution: Resolution::Reasoned,
            });
        }
        Ok(out)
    }
}

fn non_empty(value: String, default: impl FnOnce() -> String) -> String {
    if value.trim().is_empty() {
        default()
    } else {
        value
    }
}
