//! Control prioritization: assigns every control an analysis-depth tier
//! from prior mapping and gap signals, and turns tiers into a per-mode
//! depth plan.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::catalog::ControlId;
use crate::records::{ControlGap, ControlMapping, RiskLevel};
use crate::scope::AssessmentMode;

/// Analysis-depth tier for one control within one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlTier {
    Critical,
    Standard,
    Passing,
}

impl ControlTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Standard => "standard",
            Self::Passing => "passing",
        }
    }
}

/// How much reasoning a control (or gap) receives in a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Depth {
    /// No call; reuse the last known status.
    Skip,
    /// Shares a lightweight call with other controls.
    Batched,
    /// Gets its own full-depth call.
    Individual,
}

/// Tier assignment for a set of controls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Prioritized {
    pub critical: Vec<ControlId>,
    pub standard: Vec<ControlId>,
    pub passing: Vec<ControlId>,
}

impl Prioritized {
    pub fn tier_of(&self, id: &ControlId) -> Option<ControlTier> {
        if self.critical.contains(id) {
            Some(ControlTier::Critical)
        } else if self.standard.contains(id) {
            Some(ControlTier::Standard)
        } else if self.passing.contains(id) {
            Some(ControlTier::Passing)
        } else {
            None
        }
    }

    pub fn tiers(&self) -> BTreeMap<ControlId, ControlTier> {
        let mut out = BTreeMap::new();
        for (tier, ids) in [
            (ControlTier::Critical, &self.critical),
            (ControlTier::Standard, &self.standard),
            (ControlTier::Passing, &self.passing),
        ] {
            out.extend(ids.iter().map(|id| (*id, tier)));
        }
        out
    }

    pub fn len(&self) -> usize {
        self.critical.len() + self.standard.len() + self.passing.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Classify each control into exactly one tier.
///
/// - a gap with `high` or `critical` risk → critical
/// - any other gap → standard
/// - a mapping with no gap → passing
/// - no signal at all for the control → standard
///
/// When a control has several gaps the highest risk wins. Input order is
/// preserved within each tier.
pub fn prioritize(
    controls: &[ControlId],
    mappings: &[ControlMapping],
    gaps: &[ControlGap],
) -> Prioritized {
    let mut worst_gap: HashMap<ControlId, RiskLevel> = HashMap::new();
    for gap in gaps {
        worst_gap
            .entry(gap.control_id)
            .and_modify(|r| {
                if gap.risk_level > *r {
                    *r = gap.risk_level;
                }
            })
            .or_insert(gap.risk_level);
    }
    let mapped: std::collections::HashSet<ControlId> =
        mappings.iter().map(|m| m.control_id).collect();

    let mut out = Prioritized::default();
    for id in controls {
        let tier = match worst_gap.get(id) {
            Some(risk) if risk.is_elevated() => ControlTier::Critical,
            Some(_) => ControlTier::Standard,
            None if mapped.contains(id) => ControlTier::Passing,
            None => ControlTier::Standard,
        };
        match tier {
            ControlTier::Critical => out.critical.push(*id),
            ControlTier::Standard => out.standard.push(*id),
            ControlTier::Passing => out.passing.push(*id),
        }
    }
    out
}

/// Validation depth for a tier under a mode.
pub fn validation_depth(mode: AssessmentMode, tier: ControlTier, skip_passing: bool) -> Depth {
    match (mode, tier) {
        (AssessmentMode::Deep, _) => Depth::Individual,
        (AssessmentMode::Quick, ControlTier::Passing) => Depth::Skip,
        (AssessmentMode::Quick, _) => Depth::Batched,
        (AssessmentMode::Smart, ControlTier::Critical) => Depth::Individual,
        (AssessmentMode::Smart, ControlTier::Standard) => Depth::Batched,
        (AssessmentMode::Smart, ControlTier::Passing) if skip_passing => Depth::Skip,
        (AssessmentMode::Smart, ControlTier::Passing) => Depth::Batched,
    }
}

/// Remediation depth for a gap of the given risk under a mode.
pub fn remediation_depth(mode: AssessmentMode, risk: RiskLevel, deep_levels: &[RiskLevel]) -> Depth {
    match mode {
        AssessmentMode::Quick => Depth::Batched,
        AssessmentMode::Deep => Depth::Individual,
        AssessmentMode::Smart if deep_levels.contains(&risk) => Depth::Individual,
        AssessmentMode::Smart => Depth::Batched,
    }
}
