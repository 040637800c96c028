//! Pass 4: NIST validation, following the per-mode depth plan.
//!
//! Each control goes out with its catalog title and requirement statement,
//! the mapping from pass 2 and the component narrative from pass 3.

use std::collections::{BTreeSet, HashMap};

use serde::Deserialize;

use super::{clamp_unit, control_list, parse_reply, wire_control, PassContext, PassError};
use crate::catalog::{Catalog, ControlId};
use crate::gateway::{ChatRequest, ChatResponse};
use crate::prioritize::{validation_depth, ControlTier, Depth, Prioritized};
use crate::records::{ControlGap, ControlMapping, ControlValidation, OscalComponent, Resolution};
use crate::scheduler::{build_batches, Batch, BatchCall, BatchShape};
use crate::scope::AssessmentMode;

const SYSTEM: &str = "You validate control implementations against NIST SP 800-53 Rev 5 requirements. \
Judge each control against the requirement statement given with it. \
Respond with one JSON object: {\"validations\": [{control_id, control_title, is_valid, coverage_score 0-1, \
requirements_met, requirements_not_met, recommendations}]}, one entry per listed control.";

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireValidations {
    validations: Vec<WireValidation>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireValidation {
    control_id: String,
    #[serde(default)]
    control_title: String,
    is_valid: bool,
    #[serde(default)]
    coverage_score: f64,
    #[serde(default)]
    requirements_met: Vec<String>,
    #[serde(default)]
    requirements_not_met: Vec<String>,
    #[serde(default)]
    recommendations: Vec<String>,
}

/// Calls to make plus the statuses carried over without one.
#[derive(Debug, Default)]
pub struct ValidationPlan {
    pub batches: Vec<Batch<ControlId>>,
    pub reused: Vec<ControlValidation>,
}

/// Apply the depth plan for `mode` to every tier.
pub fn plan(
    prioritized: &Prioritized,
    mode: AssessmentMode,
    skip_passing: bool,
    mappings: &[ControlMapping],
    shape: BatchShape,
) -> ValidationPlan {
    let by_id: HashMap<ControlId, &ControlMapping> = mappings.iter().map(|m| (m.control_id, m)).collect();
    let mut out = ValidationPlan::default();
    for (tier, ids) in [
        (ControlTier::Critical, &prioritized.critical),
        (ControlTier::Standard, &prioritized.standard),
        (ControlTier::Passing, &prioritized.passing),
    ] {
        let depth = validation_depth(mode, tier, skip_passing);
        if depth == Depth::Skip {
            out.reused.extend(ids.iter().map(|id| match by_id.get(id) {
                Some(mapping) => ControlValidation::reused(mapping),
                None => ControlValidation::fallback(*id, Depth::Skip, "no mapping to reuse", Resolution::Fallback),
            }));
            continue;
        }
        out.batches.extend(build_batches(
            &format!("validate-{}", tier.as_str()),
            Some(tier),
            depth,
            ids.clone(),
            |id| *id,
            shape,
        ));
    }
    out
}

pub struct ValidationPass<'a> {
    ctx: &'a PassContext,
    catalog: &'a Catalog,
    mappings: HashMap<ControlId, ControlMapping>,
    gaps: HashMap<ControlId, Vec<String>>,
    narratives: HashMap<ControlId, String>,
}

impl<'a> ValidationPass<'a> {
    pub fn new(
        ctx: &'a PassContext,
        catalog: &'a Catalog,
        mappings: &[ControlMapping],
        gaps: &[ControlGap],
        components: &[OscalComponent],
    ) -> Self {
        let mut by_control: HashMap<ControlId, Vec<String>> = HashMap::new();
        for gap in gaps {
            by_control
                .entry(gap.control_id)
                .or_default()
                .push(gap.gap_description.clone());
        }
        let mut narratives = HashMap::new();
        for component in components {
            for implementation in &component.control_implementations {
                narratives
                    .entry(implementation.control_id)
                    .or_insert_with(|| component.description.clone());
            }
        }
        Self {
            ctx,
            catalog,
            mappings: mappings.iter().map(|m| (m.control_id, m.clone())).collect(),
            gaps: by_control,
            narratives,
        }
    }

    pub fn fallback(batch: &Batch<ControlId>, reason: &str, resolution: Resolution) -> Vec<ControlValidation> {
        batch
            .items
            .iter()
            .map(|id| ControlValidation::fallback(*id, batch.depth, reason, resolution))
            .collect()
    }
}

impl BatchCall<ControlId> for ValidationPass<'_> {
    type Output = Vec<ControlValidation>;
    type Error = PassError;

    fn request(&self, batch: &Batch<ControlId>) -> ChatRequest {
        let mut user = format!("Controls to validate: {}\n\n", control_list(&batch.items));
        for id in &batch.items {
            match self.catalog.reference(id) {
                Some(reference) => {
                    user.push_str(&format!("{id} {}\n", reference.title));
                    user.push_str(&format!("  requirement: {}\n", reference.statement));
                }
                None => user.push_str(&format!("{id}\n")),
            }
            match self.mappings.get(id) {
                Some(m) => user.push_str(&format!(
                    "  mapping [{} @ {:.2}]: {}\n",
                    m.implementation_status.as_str(),
                    m.confidence_score,
                    m.implementation_description
                )),
                None => user.push_str("  mapping: none available\n"),
            }
            if let Some(narrative) = self.narratives.get(id) {
                user.push_str(&format!("  component: {narrative}\n"));
            }
            for gap in self.gaps.get(id).into_iter().flatten() {
                user.push_str(&format!("  known gap: {gap}\n"));
            }
        }
        self.ctx
            .request("passes::validation", &batch.id, batch.depth, batch.len(), SYSTEM, user)
    }

    fn parse(&self, batch: &Batch<ControlId>, response: &ChatResponse) -> Result<Self::Output, PassError> {
        let wire: WireValidations = parse_reply(response)?;
        let wanted: BTreeSet<ControlId> = batch.items.iter().copied().collect();
        let mut seen = BTreeSet::new();
        let mut out = Vec::with_capacity(batch.len());
        for v in wire.validations {
            let Some(id) = wire_control(&v.control_id).filter(|id| wanted.contains(id)) else {
                continue;
            };
            if !seen.insert(id) {
                continue;
            }
            let control_title = if v.control_title.trim().is_empty() {
                self.catalog
                    .title(&id)
                    .map(str::to_string)
                    .or_else(|| self.mappings.get(&id).map(|m| m.control_name.clone()))
                    .unwrap_or_else(|| id.to_string())
            } else {
                v.control_title
            };
            out.push(ControlValidation {
                control_id: id,
                control_title,
                is_valid: v.is_valid,
                coverage_score: clamp_unit(v.coverage_score),
                requirements_met: v.requirements_met,
                requirements_not_met: v.requirements_not_met,
                recommendations: v.recommendations,
                depth: batch.depth,
                resolution: Resolution::Reasoned,
            });
        }
        let missing: Vec<ControlId> = batch.items.iter().filter(|id| !seen.contains(id)).copied().collect();
        if !missing.is_empty() {
            return Err(PassError::MissingControls(missing));
        }
        Ok(out)
    }
}
