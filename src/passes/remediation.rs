//! Pass 5: remediation planning over the gaps, depth chosen per gap risk.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::Deserialize;

use super::{parse_reply, wire_control, PassContext, PassError};
use crate::catalog::ControlId;
use crate::gateway::{ChatRequest, ChatResponse};
use crate::prioritize::{remediation_depth, Depth};
use crate::records::{CodeSnippet, ControlGap, Effort, RemediationTask, Resolution, RiskLevel};
use crate::scheduler::{build_batches, Batch, BatchCall, BatchShape};
use crate::scope::AssessmentMode;

const SYSTEM: &str = "You plan remediation for NIST SP 800-53 control gaps. Respond with one JSON object: \
{\"tasks\": [{control_id, title, description, priority [low | medium | high | critical], effort_estimate \
[low | medium | high], implementation_guide, code_snippets [{language, description, code}], verification_steps}]}, \
one task per listed control.";

const DEFAULT_GUIDE: &str = "Review control requirements and implement missing components.";

const DEFAULT_VERIFICATION: [&str; 4] = [
    "Review implementation against NIST requirements",
    "Test the implementation in a non-production environment",
    "Document the implementation details",
    "Obtain approval from security team",
];

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireTasks {
    tasks: Vec<WireTask>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireTask {
    control_id: String,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    priority: String,
    #[serde(default)]
    effort_estimate: String,
    #[serde(default)]
    implementation_guide: String,
    #[serde(default)]
    code_snippets: Vec<WireSnippet>,
    #[serde(default)]
    verification_steps: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireSnippet {
    #[serde(default)]
    language: String,
    #[serde(default)]
    description: String,
    code: String,
}

/// Split gaps into individual and batched calls for `mode`.
pub fn plan(
    gaps: &[ControlGap],
    mode: AssessmentMode,
    deep_levels: &[RiskLevel],
    shape: BatchShape,
) -> Vec<Batch<ControlGap>> {
    let (individual, batched): (Vec<ControlGap>, Vec<ControlGap>) = gaps
        .iter()
        .cloned()
        .partition(|g| remediation_depth(mode, g.risk_level, deep_levels) == Depth::Individual);

    let mut out = build_batches("remediate-deep", None, Depth::Individual, individual, |g| g.control_id, shape);
    out.extend(build_batches("remediate", None, Depth::Batched, batched, |g| g.control_id, shape));
    out
}

pub struct RemediationPass<'a> {
    ctx: &'a PassContext,
}

impl<'a> RemediationPass<'a> {
    pub fn new(ctx: &'a PassContext) -> Self {
        Self { ctx }
    }

    /// Generic tasks built from the gaps' own recommended actions.
    pub fn fallback(batch: &Batch<ControlGap>, resolution: Resolution) -> Vec<RemediationTask> {
        batch
            .items
            .iter()
            .map(|gap| {
                let priority = match batch.depth {
                    Depth::Individual => gap.risk_level,
                    Depth::Batched | Depth::Skip => RiskLevel::Medium,
                };
                let guide = if gap.recommended_actions.is_empty() {
                    DEFAULT_GUIDE.to_string()
                } else {
                    gap.recommended_actions
                        .iter()
                        .enumerate()
                        .map(|(i, action)| format!("{}. {action}", i + 1))
                        .collect::<Vec<_>>()
                        .join("\n")
                };
                RemediationTask {
                    task_id: task_id(gap.control_id),
                    title: format!("Remediate {}", gap.control_id),
                    description: gap.gap_description.clone(),
                    priority,
                    effort_estimate: Effort::Medium,
                    related_gaps: vec![gap.control_id],
                    implementation_guide: guide,
                    code_snippets: Vec::new(),
                    verification_steps: DEFAULT_VERIFICATION.iter().map(|s| (*s).to_string()).collect(),
                    depth: batch.depth,
                    resolution,
                }
            })
            .collect()
    }
}

fn task_id(control: ControlId) -> String {
    format!("task-{}", control.to_string().to_ascii_lowercase())
}

/// Order tasks by priority, most severe first, and make task IDs unique.
pub fn finalize(tasks: &mut [RemediationTask]) {
    tasks.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.related_gaps.first().cmp(&b.related_gaps.first()))
    });
    let mut used = HashSet::new();
    for task in tasks.iter_mut() {
        let base = task.task_id.clone();
        let mut n = 1;
        while !used.insert(task.task_id.clone()) {
            n += 1;
            task.task_id = format!("{base}-{n}");
        }
    }
}

impl BatchCall<ControlGap> for RemediationPass<'_> {
    type Output = Vec<RemediationTask>;
    type Error = PassError;

    fn request(&self, batch: &Batch<ControlGap>) -> ChatRequest {
        let mut user = String::from("Gaps to remediate:\n");
        for gap in &batch.items {
            user.push_str(&format!(
                "- {} {} (risk {}, score {}): {}\n",
                gap.control_id, gap.control_name, gap.risk_level, gap.risk_score, gap.gap_description
            ));
            for action in &gap.recommended_actions {
                user.push_str(&format!("    recommended: {action}\n"));
            }
        }
        self.ctx
            .request("passes::remediation", &batch.id, batch.depth, batch.len(), SYSTEM, user)
    }

    fn parse(&self, batch: &Batch<ControlGap>, response: &ChatResponse) -> Result<Self::Output, PassError> {
        let wire: WireTasks = parse_reply(response)?;
        let wanted: BTreeSet<ControlId> = batch.items.iter().map(|g| g.control_id).collect();
        let mut by_control: HashMap<ControlId, WireTask> = HashMap::new();
        for task in wire.tasks {
            if let Some(id) = wire_control(&task.control_id).filter(|id| wanted.contains(id)) {
                by_control.entry(id).or_insert(task);
            }
        }
        let missing: Vec<ControlId> = wanted.iter().filter(|id| !by_control.contains_key(id)).copied().collect();
        if !missing.is_empty() {
            return Err(PassError::MissingControls(missing));
        }

        let mut emitted = HashSet::new();
        let mut out = Vec::new();
        for gap in &batch.items {
            // One task per control, even when the batch carries several of its gaps.
            if !emitted.insert(gap.control_id) {
                continue;
            }
            let Some(task) = by_control.remove(&gap.control_id) else {
                continue;
            };
            let priority = if task.priority.trim().is_empty() {
                gap.risk_level
            } else {
                RiskLevel::parse_lenient(&task.priority)
            };
            out.push(RemediationTask {
                task_id: task_id(gap.control_id),
                title: task.title,
                description: if task.description.is_empty() {
                    gap.gap_description.clone()
                } else {
                    task.description
                },
                priority,
                effort_estimate: Effort::parse_lenient(&task.effort_estimate),
                related_gaps: vec![gap.control_id],
                implementation_guide: if task.implementation_guide.is_empty() {
                    DEFAULT_GUIDE.to_string()
                } else {
                    task.implementation_guide
                },
                code_snippets: task
                    .code_snippets
                    .into_iter()
                    .map(|s| CodeSnippet {
                        language: s.language,
                        description: s.description,
                        code: s.code,
                    })
                    .collect(),
                verification_steps: task.verification_steps,
                depth: batch.depth,
                resolution: Resolution::Reasoned,
            });
        }
        Ok(out)
    }
}
