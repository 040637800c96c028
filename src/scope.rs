//! Scope resolution: turns a scope request into a concrete control set.
//!
//! Resolution is pure and deterministic. Family and explicit-control
//! selections are unioned; a request that matches nothing is rejected
//! rather than resolved to an empty set.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::{Baseline, Catalog, ControlFamily, ControlId, ControlIdError};

/// Analysis depth requested for an assessment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssessmentMode {
    /// Batch everything, skip controls already passing.
    Quick,
    /// Deep passes only for high-risk controls.
    #[default]
    Smart,
    /// Individual deep pass for every control.
    Deep,
}

impl AssessmentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quick => "quick",
            Self::Smart => "smart",
            Self::Deep => "deep",
        }
    }
}

impl fmt::Display for AssessmentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client-supplied scope. Codes are kept as strings so that every bad
/// entry can be reported at once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssessmentScope {
    #[serde(default)]
    pub baseline: Baseline,
    #[serde(default)]
    pub control_families: Vec<String>,
    #[serde(default)]
    pub specific_controls: Vec<String>,
    #[serde(default)]
    pub mode: AssessmentMode,
    #[serde(default)]
    pub predefined_scope: Option<String>,
}

impl AssessmentScope {
    pub fn baseline(baseline: Baseline, mode: AssessmentMode) -> Self {
        Self {
            baseline,
            mode,
            ..Default::default()
        }
    }

    pub fn families<I, S>(mut self, families: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.control_families = families.into_iter().map(Into::into).collect();
        self
    }

    pub fn controls<I, S>(mut self, controls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.specific_controls = controls.into_iter().map(Into::into).collect();
        self
    }

    pub fn template(mut self, name: impl Into<String>) -> Self {
        self.predefined_scope = Some(name.into());
        self
    }
}

/// Scope rejected before any session is created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeError {
    #[error("invalid control families: {}", .0.join(", "))]
    UnknownFamilies(Vec<String>),
    #[error("malformed control ids: {}", .0.join(", "))]
    MalformedControls(Vec<String>),
    #[error("controls not found in catalog: {}", .0.join(", "))]
    UnknownControls(Vec<String>),
    #[error("unknown predefined scope '{0}'")]
    UnknownTemplate(String),
    #[error("the specified scope resolved to zero controls; adjust the baseline, families, or controls")]
    Empty,
}

/// A concrete, deduplicated control selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedScope {
    /// Sorted in catalog order.
    pub controls: Vec<ControlId>,
    pub baseline: Baseline,
    pub baseline_label: &'static str,
    pub families: Vec<ControlFamily>,
    pub template: Option<String>,
    pub mode: AssessmentMode,
    /// blake3 over baseline, mode and the control list.
    pub fingerprint: String,
}

impl ResolvedScope {
    pub fn len(&self) -> usize {
        self.controls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.controls.is_empty()
    }
}

/// Fold a named template into the request: its families are unioned in, and
/// its baseline replaces `custom`. The template name is kept, so applying
/// this twice is a no-op.
pub fn resolve_template(scope: &AssessmentScope) -> Result<AssessmentScope, ScopeError> {
    resolve_template_in(Catalog::global(), scope)
}

pub fn resolve_template_in(
    catalog: &Catalog,
    scope: &AssessmentScope,
) -> Result<AssessmentScope, ScopeError> {
    let mut expanded = scope.clone();
    let Some(name) = scope.predefined_scope.as_deref() else {
        return Ok(expanded);
    };
    let template = catalog
        .template(name)
        .ok_or_else(|| ScopeError::UnknownTemplate(name.to_string()))?;

    if expanded.baseline == Baseline::Custom {
        expanded.baseline = template.baseline;
    }
    for family in &template.families {
        let code = family.code();
        if !expanded
            .control_families
            .iter()
            .any(|f| f.trim().eq_ignore_ascii_case(code))
        {
            expanded.control_families.push(code.to_string());
        }
    }
    Ok(expanded)
}

/// Resolve a scope against the embedded catalog.
pub fn resolve(scope: &AssessmentScope) -> Result<ResolvedScope, ScopeError> {
    resolve_in(Catalog::global(), scope)
}

pub fn resolve_in(catalog: &Catalog, scope: &AssessmentScope) -> Result<ResolvedScope, ScopeError> {
    let scope = resolve_template_in(catalog, scope)?;

    let families = parse_families(&scope.control_families)?;
    let explicit = parse_controls(catalog, &scope.specific_controls)?;
    let baseline_set = catalog.baseline(scope.baseline);

    let mut selected: BTreeSet<ControlId> = BTreeSet::new();
    if !families.is_empty() {
        let source = baseline_set.unwrap_or_else(|| catalog.all_controls());
        selected.extend(source.iter().filter(|c| families.contains(&c.family())));
    } else if explicit.is_empty() {
        if let Some(base) = baseline_set {
            selected.extend(base.iter().copied());
        }
    }
    selected.extend(explicit);

    if selected.is_empty() {
        return Err(ScopeError::Empty);
    }

    let controls: Vec<ControlId> = selected.into_iter().collect();
    let fingerprint = fingerprint(scope.baseline, scope.mode, &controls);

    Ok(ResolvedScope {
        controls,
        baseline: scope.baseline,
        baseline_label: scope.baseline.display_name(),
        families: families.into_iter().collect(),
        template: scope.predefined_scope.clone(),
        mode: scope.mode,
        fingerprint,
    })
}

fn parse_families(raw: &[String]) -> Result<BTreeSet<ControlFamily>, ScopeError> {
    let mut families = BTreeSet::new();
    let mut unknown = Vec::new();
    for code in raw.iter().filter(|c| !c.trim().is_empty()) {
        match code.parse::<ControlFamily>() {
            Ok(f) => {
                families.insert(f);
            }
            Err(_) => unknown.push(code.trim().to_string()),
        }
    }
    if unknown.is_empty() {
        Ok(families)
    } else {
        Err(ScopeError::UnknownFamilies(unknown))
    }
}

fn parse_controls(catalog: &Catalog, raw: &[String]) -> Result<BTreeSet<ControlId>, ScopeError> {
    let mut controls = BTreeSet::new();
    let mut malformed = Vec::new();
    let mut unknown = Vec::new();
    for entry in raw.iter().filter(|c| !c.trim().is_empty()) {
        match entry.parse::<ControlId>() {
            Ok(id) if catalog.contains(&id) => {
                controls.insert(id);
            }
            Ok(id) => unknown.push(id.to_string()),
            Err(ControlIdError::UnknownFamily(_)) => unknown.push(entry.trim().to_string()),
            Err(ControlIdError::Malformed(_)) => malformed.push(entry.trim().to_string()),
        }
    }
    if !malformed.is_empty() {
        return Err(ScopeError::MalformedControls(malformed));
    }
    if !unknown.is_empty() {
        return Err(ScopeError::UnknownControls(unknown));
    }
    Ok(controls)
}

fn fingerprint(baseline: Baseline, mode: AssessmentMode, controls: &[ControlId]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(baseline.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(mode.as_str().as_bytes());
    for id in controls {
        hasher.update(b"|");
        hasher.update(id.to_string().as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}
