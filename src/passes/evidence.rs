//! Pass 1: evidence extraction. One call per file.

use serde::Deserialize;

use super::{clamp_unit, parse_reply, wire_control, PassContext, PassError};
use crate::evidence::{excerpt, truncate_to_tokens, PreparedEvidence, MAX_CONTROL_MENTIONS};
use crate::gateway::{ChatRequest, ChatResponse};
use crate::prioritize::Depth;
use crate::records::{EvidenceArtifact, Resolution};
use crate::scheduler::{Batch, BatchCall};

const SYSTEM: &str = "You are a compliance analyst reviewing security evidence against NIST SP 800-53 Rev 5. \
Respond with a single JSON object: {\"summary\": string, \"controls_mentioned\": [control IDs such as \"AC-2\"], \"confidence\": number between 0 and 1}.";

/// Token budget for the file text sent with one extraction call.
const FILE_TOKEN_BUDGET: usize = 6_000;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireExtraction {
    summary: String,
    #[serde(default)]
    controls_mentioned: Vec<String>,
    confidence: f64,
}

/// Batches for this pass: one per file, each an individual call.
pub fn batches(files: Vec<PreparedEvidence>) -> Vec<Batch<PreparedEvidence>> {
    files
        .into_iter()
        .map(|file| Batch {
            id: format!("extract-{}", file.id),
            tier: None,
            depth: Depth::Individual,
            items: vec![file],
        })
        .collect()
}

pub struct EvidencePass<'a> {
    ctx: &'a PassContext,
}

impl<'a> EvidencePass<'a> {
    pub fn new(ctx: &'a PassContext) -> Self {
        Self { ctx }
    }

    /// Artifacts for a batch that did not resolve.
    pub fn fallback(batch: &Batch<PreparedEvidence>, reason: &str, resolution: Resolution) -> Vec<EvidenceArtifact> {
        batch
            .items
            .iter()
            .map(|file| {
                let mut artifact = file.fallback_artifact(reason);
                artifact.resolution = resolution;
                artifact
            })
            .collect()
    }
}

impl BatchCall<PreparedEvidence> for EvidencePass<'_> {
    type Output = Vec<EvidenceArtifact>;
    type Error = PassError;

    fn request(&self, batch: &Batch<PreparedEvidence>) -> ChatRequest {
        let mut user = String::new();
        for file in &batch.items {
            user.push_str(&format!(
                "Evidence file: {} ({:?})\n",
                file.filename, file.kind
            ));
            if file.text.is_empty() {
                user.push_str("No text could be extracted locally; infer from the file name and type.\n");
            } else {
                user.push_str("Content:\n");
                user.push_str(&truncate_to_tokens(&file.text, FILE_TOKEN_BUDGET));
                user.push('\n');
            }
        }
        // Extraction is a single full-depth call, but only ever needs a
        // summary back, so it runs on the batched model with one control's
        // worth of budget.
        self.ctx
            .request("passes::evidence", &batch.id, Depth::Batched, 1, SYSTEM, user)
    }

    fn parse(&self, batch: &Batch<PreparedEvidence>, response: &ChatResponse) -> Result<Self::Output, PassError> {
        let wire: WireExtraction = parse_reply(response)?;
        Ok(batch
            .items
            .iter()
            .map(|file| {
                let mut mentions = file.mentions.clone();
                for id in wire.controls_mentioned.iter().filter_map(|c| wire_control(c)) {
                    if mentions.len() == MAX_CONTROL_MENTIONS {
                        break;
                    }
                    if !mentions.contains(&id) {
                        mentions.push(id);
                    }
                }
                EvidenceArtifact {
                    id: file.id.clone(),
                    filename: file.filename.clone(),
                    file_type: file.kind,
                    content_summary: wire.summary.clone(),
                    extracted_text: excerpt(&file.text),
                    metadata: file.metadata.clone(),
                    controls_mentioned: mentions,
                    confidence_score: clamp_unit(wire.confidence),
                    resolution: Resolution::Reasoned,
                }
            })
            .collect())
    }
}
