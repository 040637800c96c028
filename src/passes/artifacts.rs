//! Pass 3: OSCAL component and POA&M generation, batched within each tier.
//!
//! The service only writes narrative. Identifiers, props and milestones are
//! generated here so they stay well-formed whatever the answer looks like.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{Duration, NaiveDate};
use serde::Deserialize;
use uuid::Uuid;

use super::{control_list, parse_reply, wire_control, PassContext, PassError};
use crate::catalog::ControlId;
use crate::gateway::{ChatRequest, ChatResponse};
use crate::prioritize::{ControlTier, Depth};
use crate::records::{
    ComponentImplementation, ControlGap, ControlMapping, Milestone, OscalComponent, PoamEntry,
    Resolution,
};
use crate::scheduler::{build_batches, Batch, BatchCall, BatchShape};

const SYSTEM: &str = "You write OSCAL narrative for a System Security Plan and a Plan of Action and Milestones. \
Respond with one JSON object: {\"components\": [{control_id, title, description}], \
\"poam_entries\": [{control_id, title, description, remediation_plan}]}. Only use the listed control IDs.";

const DEFAULT_PLAN: &str = "Review control requirements and implement missing components.";

/// Milestone names and their offsets from the generation date.
const MILESTONES: [(&str, i64); 3] = [("Assessment", 30), ("Implementation", 60), ("Validation", 90)];

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireArtifacts {
    #[serde(default)]
    components: Vec<WireComponent>,
    #[serde(default)]
    poam_entries: Vec<WirePoam>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireComponent {
    control_id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WirePoam {
    control_id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    remediation_plan: String,
}

#[derive(Debug, Default)]
pub struct ArtifactOutput {
    pub components: Vec<OscalComponent>,
    pub poam_entries: Vec<PoamEntry>,
}

/// Tier groups cut to `shape.max_size`; a tier never shares a batch with
/// another tier.
pub fn batches(groups: [(ControlTier, Vec<ControlId>); 3], shape: BatchShape) -> Vec<Batch<ControlId>> {
    groups
        .into_iter()
        .flat_map(|(tier, ids)| {
            build_batches(
                &format!("artifacts-{}", tier.as_str()),
                Some(tier),
                Depth::Batched,
                ids,
                |id| *id,
                shape,
            )
        })
        .collect()
}

pub struct ArtifactPass<'a> {
    ctx: &'a PassContext,
    mappings: HashMap<ControlId, ControlMapping>,
    gaps: BTreeMap<ControlId, Vec<ControlGap>>,
    today: NaiveDate,
}

impl<'a> ArtifactPass<'a> {
    pub fn new(ctx: &'a PassContext, mappings: &[ControlMapping], gaps: &[ControlGap], today: NaiveDate) -> Self {
        let mut by_control: BTreeMap<ControlId, Vec<ControlGap>> = BTreeMap::new();
        for gap in gaps {
            by_control.entry(gap.control_id).or_default().push(gap.clone());
        }
        Self {
            ctx,
            mappings: mappings.iter().map(|m| (m.control_id, m.clone())).collect(),
            gaps: by_control,
            today,
        }
    }

    /// Locally generated records without narrative.
    pub fn fallback(&self, batch: &Batch<ControlId>, resolution: Resolution) -> ArtifactOutput {
        self.assemble(batch, &WireArtifacts::default(), resolution)
    }

    fn assemble(&self, batch: &Batch<ControlId>, wire: &WireArtifacts, resolution: Resolution) -> ArtifactOutput {
        let wanted: BTreeSet<ControlId> = batch.items.iter().copied().collect();
        let components: HashMap<ControlId, &WireComponent> = wire
            .components
            .iter()
            .filter_map(|c| wire_control(&c.control_id).filter(|id| wanted.contains(id)).map(|id| (id, c)))
            .collect();
        let poams: HashMap<ControlId, &WirePoam> = wire
            .poam_entries
            .iter()
            .filter_map(|p| wire_control(&p.control_id).filter(|id| wanted.contains(id)).map(|id| (id, p)))
            .collect();

        let mut out = ArtifactOutput::default();
        for id in &batch.items {
            if let Some(mapping) = self.mappings.get(id) {
                out.components
                    .push(self.component(mapping, batch.tier, components.get(id).copied(), resolution));
            }
            if let Some(gaps) = self.gaps.get(id) {
                for (n, gap) in gaps.iter().enumerate() {
                    out.poam_entries
                        .push(self.poam_entry(gap, n, poams.get(id).copied(), resolution));
                }
            }
        }
        out
    }

    fn component(
        &self,
        mapping: &ControlMapping,
        tier: Option<ControlTier>,
        narrative: Option<&WireComponent>,
        resolution: Resolution,
    ) -> OscalComponent {
        let id = mapping.control_id;
        let mut props = BTreeMap::new();
        props.insert(
            "compliance_status".to_string(),
            mapping.implementation_status.as_str().to_string(),
        );
        props.insert("confidence".to_string(), format!("{:.2}", mapping.confidence_score));
        if let Some(tier) = tier {
            props.insert("tier".to_string(), tier.as_str().to_string());
        }

        let title = narrative
            .map(|n| n.title.trim())
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{} Implementation", mapping.control_name));
        let description = narrative
            .map(|n| n.description.trim())
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                if mapping.implementation_description.is_empty() {
                    format!("Implementation of {id}")
                } else {
                    mapping.implementation_description.clone()
                }
            });

        OscalComponent {
            uuid: Uuid::new_v4(),
            component_id: format!("component-{}", id.to_string().to_ascii_lowercase()),
            title,
            description,
            component_type: "software".to_string(),
            control_implementations: vec![ComponentImplementation {
                control_id: id,
                status: mapping.implementation_status,
                evidence: mapping.evidence_ids.clone(),
            }],
            props,
            resolution,
        }
    }

    fn poam_entry(&self, gap: &ControlGap, n: usize, narrative: Option<&WirePoam>, resolution: Resolution) -> PoamEntry {
        let id = gap.control_id;
        let mut poam_id = format!("poam-{}", id.to_string().to_ascii_lowercase());
        if n > 0 {
            poam_id.push_str(&format!("-{}", n + 1));
        }
        let control_name = if gap.control_name.is_empty() {
            id.to_string()
        } else {
            gap.control_name.clone()
        };
        let pick = |value: Option<&String>| value.map(|v| v.trim()).filter(|v| !v.is_empty()).map(str::to_string);

        let local_plan = if gap.recommended_actions.is_empty() {
            DEFAULT_PLAN.to_string()
        } else {
            gap.recommended_actions.join("\n")
        };

        PoamEntry {
            uuid: Uuid::new_v4(),
            poam_id,
            title: pick(narrative.map(|p| &p.title)).unwrap_or_else(|| format!("Remediate {control_name}")),
            description: pick(narrative.map(|p| &p.description)).unwrap_or_else(|| gap.gap_description.clone()),
            related_controls: vec![id],
            risk_level: gap.risk_level,
            milestones: MILESTONES
                .iter()
                .map(|(name, days)| Milestone {
                    milestone: (*name).to_string(),
                    target_date: self.today + Duration::days(*days),
                })
                .collect(),
            remediation_plan: pick(narrative.map(|p| &p.remediation_plan)).unwrap_or(local_plan),
            status: "open".to_string(),
            resolution,
        }
    }
}

impl BatchCall<ControlId> for ArtifactPass<'_> {
    type Output = ArtifactOutput;
    type Error = PassError;

    fn request(&self, batch: &Batch<ControlId>) -> ChatRequest {
        let mut user = format!(
            "Tier: {}\nControls: {}\n\n",
            batch.tier.map(|t| t.as_str()).unwrap_or("all"),
            control_list(&batch.items)
        );
        for id in &batch.items {
            if let Some(m) = self.mappings.get(id) {
                user.push_str(&format!(
                    "{id} {} [{}]: {}\n",
                    m.control_name,
                    m.implementation_status.as_str(),
                    m.implementation_description
                ));
            }
            for gap in self.gaps.get(id).into_iter().flatten() {
                user.push_str(&format!(
                    "  gap ({}): {}\n",
                    gap.risk_level, gap.gap_description
                ));
            }
        }
        self.ctx
            .request("passes::artifacts", &batch.id, batch.depth, batch.len(), SYSTEM, user)
    }

    fn parse(&self, batch: &Batch<ControlId>, response: &ChatResponse) -> Result<ArtifactOutput, PassError> {
        let wire: WireArtifacts = parse_reply(response)?;
        Ok(self.assemble(batch, &wire, Resolution::Reasoned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimate::EstimatorConfig;
    use crate::gateway::FinishReason;
    use crate::passes::ReasoningConfig;
    use crate::records::{ImplementationStatus, RiskLevel};
    use crate::catalog::Baseline;
    use crate::scope::{resolve, AssessmentMode, AssessmentScope};
    use std::time::Duration as StdDuration;

    fn id(s: &str) -> ControlId {
        s.parse().unwrap()
    }

    fn ctx() -> PassContext {
        PassContext {
            session_id: Uuid::nil(),
            mode: AssessmentMode::Smart,
            reasoning: ReasoningConfig::default(),
            estimator: EstimatorConfig::default(),
        }
    }

    fn fixtures() -> (Vec<ControlMapping>, Vec<ControlGap>) {
        let mut mapping = ControlMapping::fallback(id("IA-5"), "x").with_status(ImplementationStatus::PartiallyImplemented);
        mapping.control_name = "Authenticator Management".to_string();
        mapping.resolution = Resolution::Reasoned;
        let mut gap = ControlGap::new(id("IA-5"), "Passwords never rotate", RiskLevel::High);
        gap.control_name = "Authenticator Management".to_string();
        gap.recommended_actions = vec!["Enforce rotation".into(), "Audit service accounts".into()];
        (vec![mapping], vec![gap])
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()
    }

    fn shape(max_size: usize) -> BatchShape {
        BatchShape {
            max_size,
            group_by_family: true,
        }
    }

    #[test]
    fn batches_skip_empty_tiers() {
        let out = batches(
            [
                (ControlTier::Critical, vec![id("IA-5")]),
                (ControlTier::Standard, vec![]),
                (ControlTier::Passing, vec![id("AC-2"), id("AC-3")]),
            ],
            shape(15),
        );
        let ids: Vec<&str> = out.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, ["artifacts-critical-001", "artifacts-passing-001"]);
    }

    #[test]
    fn moderate_baseline_in_one_tier_respects_batch_size() {
        let scope = resolve(&AssessmentScope::baseline(Baseline::Moderate, AssessmentMode::Smart)).unwrap();
        assert_eq!(scope.len(), 251);
        let out = batches(
            [
                (ControlTier::Critical, vec![]),
                (ControlTier::Standard, scope.controls.clone()),
                (ControlTier::Passing, vec![]),
            ],
            shape(15),
        );
        assert!(out.len() >= 251 / 15 + 1);
        assert!(out.iter().all(|b| b.len() <= 15 && b.tier == Some(ControlTier::Standard)));
        assert_eq!(out.iter().map(Batch::len).sum::<usize>(), 251);
    }

    #[test]
    fn fallback_generates_ids_and_milestones_locally() {
        let ctx = ctx();
        let (mappings, gaps) = fixtures();
        let pass = ArtifactPass::new(&ctx, &mappings, &gaps, today());
        let groups = batches(
            [
                (ControlTier::Critical, vec![id("IA-5")]),
                (ControlTier::Standard, vec![]),
                (ControlTier::Passing, vec![]),
            ],
            shape(15),
        );
        let out = pass.fallback(&groups[0], Resolution::Fallback);

        let component = &out.components[0];
        assert_eq!(component.component_id, "component-ia-5");
        assert_eq!(component.title, "Authenticator Management Implementation");
        assert_eq!(component.props["compliance_status"], "partially_implemented");
        assert_eq!(component.props["tier"], "critical");

        let poam = &out.poam_entries[0];
        assert_eq!(poam.poam_id, "poam-ia-5");
        assert_eq!(poam.title, "Remediate Authenticator Management");
        assert_eq!(poam.remediation_plan, "Enforce rotation\nAudit service accounts");
        assert_eq!(poam.status, "open");
        let dates: Vec<String> = poam.milestones.iter().map(|m| m.target_date.to_string()).collect();
        assert_eq!(dates, ["2025-01-31", "2025-03-02", "2025-04-01"]);
    }

    #[test]
    fn narrative_overrides_local_text() {
        let ctx = ctx();
        let (mappings, gaps) = fixtures();
        let pass = ArtifactPass::new(&ctx, &mappings, &gaps, today());
        let batch = Batch {
            id: "artifacts-critical-001".to_string(),
            tier: Some(ControlTier::Critical),
            depth: Depth::Batched,
            items: vec![id("IA-5")],
        };
        let response = ChatResponse {
            content: r#"{"components": [{"control_id": "IA-5", "title": "Credential vault", "description": "Vault-managed secrets"}],
                         "poam_entries": [{"control_id": "IA-5", "title": "", "remediation_plan": "Rotate every 90 days"}]}"#
                .to_string(),
            input_tokens: 0,
            output_tokens: 0,
            cost_nanodollars: 0,
            upstream_cost_nanodollars: None,
            latency: StdDuration::ZERO,
            finish_reason: FinishReason::Stop,
        };
        let out = pass.parse(&batch, &response).unwrap();
        assert_eq!(out.components[0].title, "Credential vault");
        assert_eq!(out.poam_entries[0].title, "Remediate Authenticator Management");
        assert_eq!(out.poam_entries[0].remediation_plan, "Rotate every 90 days");
        assert_eq!(out.poam_entries[0].resolution, Resolution::Reasoned);
    }
}
