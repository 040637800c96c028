//! Evidence submission: upload limits, evidence-kind detection, plain-text
//! extraction and control-ID mentions.
//!
//! Binary formats are not parsed here. They are inventoried with an empty
//! text body and a metadata note, and the reasoning service sees only the
//! filename and kind.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tiktoken_rs::{cl100k_base, CoreBPE};

use crate::catalog::ControlId;
use crate::records::{EvidenceArtifact, EvidenceKind};

/// At most this many mentions are kept per document.
pub const MAX_CONTROL_MENTIONS: usize = 50;

/// Characters of extracted text kept on the inventory record.
pub const EXCERPT_CHARS: usize = 500;

static CONTROL_MENTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b([A-Z]{2}-\d+(?:\(\d+\))?)\b").expect("Invalid control mention regex")
});

static BPE: OnceLock<Option<CoreBPE>> = OnceLock::new();

// =============================================================================
// LIMITS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceLimits {
    pub max_files: usize,
    pub max_file_bytes: usize,
    pub allowed_content_types: Vec<String>,
}

impl Default for EvidenceLimits {
    fn default() -> Self {
        Self {
            max_files: 20,
            max_file_bytes: 50 * 1024 * 1024,
            allowed_content_types: [
                "application/pdf",
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
                "image/png",
                "image/jpeg",
                "application/json",
                "text/yaml",
                "text/x-yaml",
                "application/x-yaml",
                "text/plain",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl EvidenceLimits {
    pub fn allows(&self, content_type: &str) -> bool {
        let essence = media_essence(content_type);
        self.allowed_content_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&essence))
    }
}

/// Evidence rejected before a session is created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvidenceError {
    #[error("at least one evidence file is required")]
    NoFiles,
    #[error("maximum {max} files allowed per upload (got {count})")]
    TooManyFiles { count: usize, max: usize },
    #[error("file {filename} exceeds maximum size of {max_mb}MB")]
    TooLarge {
        filename: String,
        size: usize,
        max_mb: usize,
    },
    #[error("file type {content_type} not allowed for {filename}")]
    DisallowedType {
        filename: String,
        content_type: String,
    },
}

/// One uploaded file as received from the client.
#[derive(Debug, Clone)]
pub struct EvidenceFile {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl EvidenceFile {
    pub fn new(filename: impl Into<String>, content_type: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }
}

/// Check count, size and type for a whole submission. The first violation wins.
pub fn validate_submission(files: &[EvidenceFile], limits: &EvidenceLimits) -> Result<(), EvidenceError> {
    if files.is_empty() {
        return Err(EvidenceError::NoFiles);
    }
    if files.len() > limits.max_files {
        return Err(EvidenceError::TooManyFiles {
            count: files.len(),
            max: limits.max_files,
        });
    }
    for file in files {
        if file.bytes.len() > limits.max_file_bytes {
            return Err(EvidenceError::TooLarge {
                filename: file.filename.clone(),
                size: file.bytes.len(),
                max_mb: limits.max_file_bytes / (1024 * 1024),
            });
        }
        if !limits.allows(&file.content_type) {
            return Err(EvidenceError::DisallowedType {
                filename: file.filename.clone(),
                content_type: file.content_type.clone(),
            });
        }
    }
    Ok(())
}

fn media_essence(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

// =============================================================================
// KIND DETECTION AND EXTRACTION
// =============================================================================

pub fn detect_kind(filename: &str, content_type: &str) -> EvidenceKind {
    let name = filename.to_ascii_lowercase();
    let ct = media_essence(content_type);

    if ct == "application/pdf" || name.ends_with(".pdf") {
        EvidenceKind::Pdf
    } else if name.ends_with(".docx") || ct.ends_with("wordprocessingml.document") {
        EvidenceKind::Docx
    } else if ct.starts_with("image/") {
        if ["diagram", "architecture", "network", "topology"]
            .iter()
            .any(|k| name.contains(k))
        {
            EvidenceKind::Diagram
        } else {
            EvidenceKind::Screenshot
        }
    } else if [".json", ".yaml", ".yml", ".tf", ".hcl"]
        .iter()
        .any(|ext| name.ends_with(ext))
    {
        EvidenceKind::Config
    } else if ["policy", "procedure", "standard"]
        .iter()
        .any(|k| name.contains(k))
    {
        EvidenceKind::Policy
    } else {
        EvidenceKind::Unknown
    }
}

/// A file ready for the evidence-extraction pass.
#[derive(Debug, Clone)]
pub struct PreparedEvidence {
    pub id: String,
    pub filename: String,
    pub kind: EvidenceKind,
    pub text: String,
    pub metadata: BTreeMap<String, String>,
    pub mentions: Vec<ControlId>,
}

impl PreparedEvidence {
    /// Inventory record used when the extraction call fails.
    pub fn fallback_artifact(&self, reason: &str) -> EvidenceArtifact {
        EvidenceArtifact {
            id: self.id.clone(),
            filename: self.filename.clone(),
            file_type: self.kind,
            content_summary: format!("Error processing file: {reason}"),
            extracted_text: excerpt(&self.text),
            metadata: self.metadata.clone(),
            controls_mentioned: self.mentions.clone(),
            confidence_score: 0.0,
            resolution: crate::records::Resolution::Fallback,
        }
    }
}

pub fn prepare(index: usize, file: &EvidenceFile) -> PreparedEvidence {
    let kind = detect_kind(&file.filename, &file.content_type);
    let mut metadata = BTreeMap::new();
    metadata.insert("content_type".to_string(), media_essence(&file.content_type));
    metadata.insert("size_bytes".to_string(), file.bytes.len().to_string());
    metadata.insert(
        "blake3".to_string(),
        blake3::hash(&file.bytes).to_hex().to_string(),
    );

    let text = match kind {
        EvidenceKind::Config | EvidenceKind::Policy | EvidenceKind::Unknown => {
            let text = String::from_utf8_lossy(&file.bytes).into_owned();
            metadata.insert("line_count".to_string(), text.lines().count().to_string());
            text
        }
        EvidenceKind::Pdf | EvidenceKind::Docx | EvidenceKind::Screenshot | EvidenceKind::Diagram => {
            metadata.insert(
                "note".to_string(),
                "binary format; text not extracted locally".to_string(),
            );
            String::new()
        }
    };

    let mentions = extract_control_mentions(&text);
    PreparedEvidence {
        id: format!("evidence-{:03}", index + 1),
        filename: file.filename.clone(),
        kind,
        text,
        metadata,
        mentions,
    }
}

/// Control IDs in order of first appearance, deduplicated and capped.
/// Codes with an unknown family are ignored.
pub fn extract_control_mentions(text: &str) -> Vec<ControlId> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    for cap in CONTROL_MENTION.captures_iter(text) {
        let Ok(id) = cap[1].parse::<ControlId>() else {
            continue;
        };
        if seen.insert(id) {
            out.push(id);
            if out.len() == MAX_CONTROL_MENTIONS {
                break;
            }
        }
    }
    out
}

pub fn excerpt(text: &str) -> String {
    text.chars().take(EXCERPT_CHARS).collect()
}

// =============================================================================
// TOKEN BUDGETS
// =============================================================================

fn bpe() -> Option<&'static CoreBPE> {
    BPE.get_or_init(|| cl100k_base().ok()).as_ref()
}

/// Token count under cl100k_base, or a four-chars-per-token guess when the
/// tokenizer cannot be loaded.
pub fn count_tokens(text: &str) -> usize {
    match bpe() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => text.chars().count().div_ceil(4),
    }
}

/// Cut `text` to at most `max_tokens` tokens.
pub fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    if let Some(bpe) = bpe() {
        let tokens = bpe.encode_with_special_tokens(text);
        if tokens.len() <= max_tokens {
            return text.to_string();
        }
        if let Ok(cut) = bpe.decode(tokens[..max_tokens].to_vec()) {
            return cut;
        }
    }
    text.chars().take(max_tokens.saturating_mul(4)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submission_limits() {
        let limits = EvidenceLimits::default();
        assert_eq!(validate_submission(&[], &limits), Err(EvidenceError::NoFiles));

        let many: Vec<_> = (0..21)
            .map(|i| EvidenceFile::new(format!("f{i}.txt"), "text/plain", b"x".to_vec()))
            .collect();
        assert!(matches!(
            validate_submission(&many, &limits),
            Err(EvidenceError::TooManyFiles { count: 21, max: 20 })
        ));

        let small = EvidenceLimits {
            max_file_bytes: 4,
            ..EvidenceLimits::default()
        };
        let big = [EvidenceFile::new("big.txt", "text/plain", b"12345".to_vec())];
        assert!(matches!(
            validate_submission(&big, &small),
            Err(EvidenceError::TooLarge { .. })
        ));

        let exe = [EvidenceFile::new("run.exe", "application/x-msdownload", b"MZ".to_vec())];
        assert!(matches!(
            validate_submission(&exe, &limits),
            Err(EvidenceError::DisallowedType { .. })
        ));

        let ok = [EvidenceFile::new("p.txt", "text/plain; charset=utf-8", b"AC-2".to_vec())];
        assert_eq!(validate_submission(&ok, &limits), Ok(()));
    }

    #[test]
    fn kinds_from_name_and_type() {
        assert_eq!(detect_kind("ssp.PDF", "application/octet-stream"), EvidenceKind::Pdf);
        assert_eq!(detect_kind("network-diagram.png", "image/png"), EvidenceKind::Diagram);
        assert_eq!(detect_kind("console.png", "image/png"), EvidenceKind::Screenshot);
        assert_eq!(detect_kind("main.tf", "text/plain"), EvidenceKind::Config);
        assert_eq!(detect_kind("access-policy.txt", "text/plain"), EvidenceKind::Policy);
        assert_eq!(detect_kind("notes.txt", "text/plain"), EvidenceKind::Unknown);
    }

    #[test]
    fn mentions_are_ordered_deduped_and_capped() {
        let text = "Implements AC-2 and AU-6(1). See AC-2 again; also XX-1 and ac-3 and SC-7.";
        let ids: Vec<String> = extract_control_mentions(text)
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(ids, vec!["AC-2", "AU-6(1)", "SC-7"]);

        let long: String = (1..=80).map(|n| format!("CM-{n} ")).collect();
        assert_eq!(extract_control_mentions(&long).len(), MAX_CONTROL_MENTIONS);
    }

    #[test]
    fn binary_kinds_carry_no_text() {
        let pdf = prepare(0, &EvidenceFile::new("ssp.pdf", "application/pdf", b"%PDF AC-2".to_vec()));
        assert_eq!(pdf.id, "evidence-001");
        assert!(pdf.text.is_empty());
        assert!(pdf.mentions.is_empty());
        assert!(pdf.metadata.contains_key("note"));

        let cfg = prepare(1, &EvidenceFile::new("iam.json", "application/json", br#"{"control":"IA-2"}"#.to_vec()));
        assert_eq!(cfg.kind, EvidenceKind::Config);
        assert_eq!(cfg.mentions.len(), 1);
    }

    #[test]
    fn truncation_respects_budget() {
        let text = "access control ".repeat(500);
        let cut = truncate_to_tokens(&text, 50);
        assert!(count_tokens(&cut) <= 50);
        assert_eq!(truncate_to_tokens("short", 50), "short");
    }
}
