//! OSCAL 1.2.0 export (SSP and POA&M) and structural document validation.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::records::{AssessmentResults, OscalComponent, PoamEntry};

pub const OSCAL_VERSION: &str = "1.2.0";
const DOCUMENT_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OscalDocumentKind {
    Ssp,
    Poam,
}

impl OscalDocumentKind {
    pub fn root_key(&self) -> &'static str {
        match self {
            Self::Ssp => "system-security-plan",
            Self::Poam => "plan-of-action-and-milestones",
        }
    }
}

impl fmt::Display for OscalDocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ssp => "ssp",
            Self::Poam => "poam",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationMessage {
    pub severity: Severity,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OscalValidation {
    pub is_valid: bool,
    pub document_type: OscalDocumentKind,
    pub oscal_version: String,
    pub error_count: usize,
    pub warning_count: usize,
    pub messages: Vec<ValidationMessage>,
}

/// Both exported documents, serialized side by side under their root keys.
#[derive(Debug, Clone, Serialize)]
pub struct OscalExport {
    #[serde(rename = "system-security-plan")]
    pub ssp: Value,
    #[serde(rename = "plan-of-action-and-milestones")]
    pub poam: Value,
}

impl OscalExport {
    /// Each document wrapped in its own root object, as a validator sees it.
    pub fn documents(&self) -> [(OscalDocumentKind, Value); 2] {
        [
            (OscalDocumentKind::Ssp, json!({ (OscalDocumentKind::Ssp.root_key()): self.ssp })),
            (OscalDocumentKind::Poam, json!({ (OscalDocumentKind::Poam.root_key()): self.poam })),
        ]
    }

    pub fn validate(&self) -> Vec<OscalValidation> {
        self.documents()
            .iter()
            .map(|(kind, doc)| validate_document(doc, *kind))
            .collect()
    }
}

fn metadata(title: &str, now: DateTime<Utc>) -> Value {
    json!({
        "title": title,
        "last-modified": now.to_rfc3339_opts(SecondsFormat::Secs, true),
        "version": DOCUMENT_VERSION,
        "oscal-version": OSCAL_VERSION,
    })
}

fn props(pairs: impl IntoIterator<Item = (String, String)>) -> Value {
    Value::Array(
        pairs
            .into_iter()
            .map(|(name, value)| json!({ "name": name, "value": value }))
            .collect(),
    )
}

fn ssp_component(c: &OscalComponent) -> Value {
    json!({
        "uuid": c.uuid,
        "type": c.component_type,
        "title": c.title,
        "description": c.description,
        "status": { "state": "operational" },
        "props": props(c.props.iter().map(|(k, v)| (k.clone(), v.clone()))),
    })
}

fn implemented_requirements(components: &[OscalComponent]) -> Vec<Value> {
    components
        .iter()
        .flat_map(|c| {
            c.control_implementations.iter().map(move |ci| {
                json!({
                    "uuid": Uuid::new_v4(),
                    "control-id": ci.control_id.to_string().to_ascii_lowercase(),
                    "by-components": [{
                        "component-uuid": c.uuid,
                        "description": c.description,
                        "implementation-status": { "state": ci.status.as_str() },
                        "links": ci.evidence.iter().map(|e| json!({ "href": format!("#{e}"), "rel": "evidence" })).collect::<Vec<_>>(),
                    }],
                })
            })
        })
        .collect()
}

fn poam_item(p: &PoamEntry) -> Value {
    json!({
        "uuid": p.uuid,
        "title": p.title,
        "description": p.description,
        "props": props([
            ("poam-id".to_string(), p.poam_id.clone()),
            ("risk-level".to_string(), p.risk_level.as_str().to_string()),
            ("status".to_string(), p.status.clone()),
        ]),
        "related-controls": p.related_controls.iter().map(|c| c.to_string().to_ascii_lowercase()).collect::<Vec<_>>(),
        "remediation": {
            "description": p.remediation_plan,
            "milestones": p.milestones.iter().map(|m| json!({
                "title": m.milestone,
                "target-date": m.target_date.to_string(),
            })).collect::<Vec<_>>(),
        },
    })
}

/// Build the SSP and POA&M documents for a session's current results.
pub fn export(results: &AssessmentResults, now: DateTime<Utc>) -> OscalExport {
    let ssp = json!({
        "uuid": Uuid::new_v4(),
        "metadata": metadata("Assessment Orchestrator System Security Plan", now),
        "import-profile": {
            "href": format!("#nist-800-53-rev5-{}", results.scope.baseline.as_str()),
        },
        "system-characteristics": {
            "system-ids": [{ "id": results.session_id }],
            "description": format!(
                "{} assessment of {} controls ({} mode)",
                results.scope.baseline_label,
                results.scope.controls_in_scope,
                results.scope.mode,
            ),
        },
        "system-implementation": {
            "components": results.oscal_components.iter().map(ssp_component).collect::<Vec<_>>(),
        },
        "control-implementation": {
            "description": "Control implementations derived from submitted evidence.",
            "implemented-requirements": implemented_requirements(&results.oscal_components),
        },
    });
    let poam = json!({
        "uuid": Uuid::new_v4(),
        "metadata": metadata("Assessment Orchestrator Plan of Action and Milestones", now),
        "poam-items": results.poam_entries.iter().map(poam_item).collect::<Vec<_>>(),
    });
    OscalExport { ssp, poam }
}

/// Structural checks: root element, metadata fields, OSCAL version, UUID.
pub fn validate_document(document: &Value, kind: OscalDocumentKind) -> OscalValidation {
    let mut messages = Vec::new();
    let mut push = |severity, message: String| messages.push(ValidationMessage { severity, message });

    let root_key = kind.root_key();
    match document.get(root_key).and_then(Value::as_object) {
        None => push(
            Severity::Error,
            format!("Missing root element '{root_key}' for {kind} document"),
        ),
        Some(root) => check_root(root, &mut push),
    }

    let error_count = messages.iter().filter(|m| m.severity == Severity::Error).count();
    let warning_count = messages.len() - error_count;
    OscalValidation {
        is_valid: error_count == 0,
        document_type: kind,
        oscal_version: OSCAL_VERSION.to_string(),
        error_count,
        warning_count,
        messages,
    }
}

fn check_root(root: &Map<String, Value>, push: &mut impl FnMut(Severity, String)) {
    match root.get("metadata").and_then(Value::as_object) {
        None => push(Severity::Error, "Missing required 'metadata' element".to_string()),
        Some(metadata) => {
            for (field, label) in [
                ("title", "title"),
                ("last-modified", "last-modified timestamp"),
                ("version", "version"),
            ] {
                if !metadata.contains_key(field) {
                    push(Severity::Warning, format!("Missing metadata {label}"));
                }
            }
            match metadata.get("oscal-version") {
                None => push(Severity::Warning, "Missing metadata oscal-version".to_string()),
                Some(v) if v.as_str() != Some(OSCAL_VERSION) => push(
                    Severity::Warning,
                    format!("OSCAL version {v} does not match expected {OSCAL_VERSION}"),
                ),
                Some(_) => {}
            }
        }
    }
    if !root.contains_key("uuid") {
        push(Severity::Error, "Missing required 'uuid' field".to_string());
    }
}
