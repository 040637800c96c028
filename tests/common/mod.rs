//! Deterministic stand-in for the reasoning service, shared by the
//! integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use assessment_orchestrator::config::AssessConfig;
use assessment_orchestrator::gateway::{
    ChatGateway, ChatRequest, ChatResponse, FinishReason, ProviderError,
};
use assessment_orchestrator::scheduler::RetryPolicy;
use serde_json::{json, Value};

/// Which pass a request belongs to, judged from its system instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pass {
    Evidence,
    Mapping,
    Artifacts,
    Validation,
    Remediation,
}

pub fn pass_of(system: &str) -> Pass {
    if system.contains("compliance analyst") {
        Pass::Evidence
    } else if system.contains("assessor") {
        Pass::Mapping
    } else if system.contains("OSCAL narrative") {
        Pass::Artifacts
    } else if system.contains("You validate") {
        Pass::Validation
    } else {
        Pass::Remediation
    }
}

fn listed_after<'a>(user: &'a str, prefix: &str) -> Vec<&'a str> {
    user.lines()
        .find_map(|l| l.strip_prefix(prefix))
        .map(|rest| rest.split(", ").map(str::trim).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

/// Control IDs a request asks about.
pub fn controls_in(pass: Pass, user: &str) -> Vec<String> {
    let ids: Vec<&str> = match pass {
        Pass::Evidence => Vec::new(),
        Pass::Mapping => listed_after(user, "Controls to assess: "),
        Pass::Artifacts => listed_after(user, "Controls: "),
        Pass::Validation => listed_after(user, "Controls to validate: "),
        Pass::Remediation => user
            .lines()
            .filter_map(|l| l.strip_prefix("- "))
            .filter_map(|l| l.split_whitespace().next())
            .collect(),
    };
    ids.into_iter().map(String::from).collect()
}

fn control_number(id: &str) -> u32 {
    id.split('-')
        .nth(1)
        .and_then(|n| n.split('(').next())
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

/// Mapping verdict by control number: multiples of three are missing
/// (high-risk gap), `3k + 1` implemented, the rest partial (medium gap).
pub fn expected_status(id: &str) -> &'static str {
    match control_number(id) % 3 {
        0 => "not_implemented",
        1 => "implemented",
        _ => "partially_implemented",
    }
}

/// A well-formed answer for any pass.
pub fn answer(system: &str, user: &str) -> String {
    let pass = pass_of(system);
    let controls = controls_in(pass, user);
    let body = match pass {
        Pass::Evidence => json!({
            "summary": "Access control policy describing account management.",
            "controls_mentioned": ["AC-2"],
            "confidence": 0.8
        }),
        Pass::Mapping => {
            let mut mappings = Vec::new();
            let mut gaps = Vec::new();
            for id in &controls {
                let status = expected_status(id);
                mappings.push(json!({
                    "control_id": id,
                    "control_name": format!("{id} name"),
                    "implementation_status": status,
                    "implementation_description": format!("{id} per evidence"),
                    "confidence_score": 0.9,
                    "evidence_artifacts": [],
                    "gaps_identified": []
                }));
                let risk = match status {
                    "not_implemented" => "high",
                    "partially_implemented" => "medium",
                    _ => continue,
                };
                gaps.push(json!({
                    "control_id": id,
                    "control_name": format!("{id} name"),
                    "gap_description": format!("{id} incomplete"),
                    "risk_level": risk,
                    "recommended_actions": [format!("Fix {id}")]
                }));
            }
            json!({ "control_mappings": mappings, "control_gaps": gaps })
        }
        Pass::Artifacts => json!({
            "components": controls.iter().map(|id| json!({
                "control_id": id,
                "title": format!("{id} component"),
                "description": format!("{id} as implemented")
            })).collect::<Vec<_>>(),
            "poam_entries": []
        }),
        Pass::Validation => json!({
            "validations": controls.iter().map(|id| json!({
                "control_id": id,
                "control_title": format!("{id} name"),
                "is_valid": expected_status(id) == "implemented",
                "coverage_score": 0.7,
                "requirements_met": ["documented"],
                "requirements_not_met": [],
                "recommendations": []
            })).collect::<Vec<_>>()
        }),
        Pass::Remediation => json!({
            "tasks": controls.iter().map(|id| json!({
                "control_id": id,
                "title": format!("Close {id}"),
                "description": "Implement the missing pieces",
                "priority": "high",
                "effort_estimate": "low",
                "implementation_guide": "1. Do it",
                "code_snippets": [],
                "verification_steps": ["Check it"]
            })).collect::<Vec<_>>()
        }),
    };
    body.to_string()
}

pub fn completion_body(content: &str) -> Value {
    json!({
        "choices": [{ "message": { "content": content }, "finish_reason": "stop" }],
        "usage": { "prompt_tokens": 100, "completion_tokens": 40 }
    })
}

/// In-process gateway answering from [`answer`], with per-control faults.
#[derive(Default)]
pub struct ScriptedReasoner {
    /// Mapping batches mentioning one of these fail transiently every time.
    pub transient: Vec<&'static str>,
    /// Mapping batches mentioning one of these get a schema-violating answer.
    pub malformed: Vec<&'static str>,
    /// Mapping batches mentioning one of these never answer in test time.
    pub hang: Vec<&'static str>,
    pub calls: AtomicUsize,
    pub per_pass: Mutex<HashMap<Pass, usize>>,
    pub per_model: Mutex<HashMap<String, usize>>,
}

impl ScriptedReasoner {
    pub fn calls_for(&self, pass: Pass) -> usize {
        self.per_pass.lock().unwrap().get(&pass).copied().unwrap_or(0)
    }

    pub fn calls_on_model(&self, model: &str) -> usize {
        self.per_model.lock().unwrap().get(model).copied().unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl ChatGateway for ScriptedReasoner {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let system = &req.messages[0].content;
        let user = &req.messages[1].content;
        let pass = pass_of(system);
        *self.per_pass.lock().unwrap().entry(pass).or_default() += 1;
        *self
            .per_model
            .lock()
            .unwrap()
            .entry(req.model.model_id().to_string())
            .or_default() += 1;

        tokio::time::sleep(Duration::from_millis(2)).await;

        if pass == Pass::Mapping {
            let controls = controls_in(pass, user);
            let hit = |list: &[&str]| controls.iter().any(|c| list.contains(&c.as_str()));
            if hit(&self.hang) {
                tokio::time::sleep(Duration::from_secs(300)).await;
            }
            if hit(&self.transient) {
                return Err(ProviderError::provider("reasoning", "upstream overloaded", true));
            }
            if hit(&self.malformed) {
                let bad = json!({
                    "control_mappings": [],
                    "control_gaps": [{
                        "control_id": controls[0],
                        "gap_description": "renamed field",
                        "severity": "high"
                    }]
                });
                return Ok(response(bad.to_string()));
            }
        }
        Ok(response(answer(system, user)))
    }
}

fn response(content: String) -> ChatResponse {
    ChatResponse {
        content,
        input_tokens: 100,
        output_tokens: 40,
        cost_nanodollars: 700_000,
        upstream_cost_nanodollars: None,
        latency: Duration::from_millis(2),
        finish_reason: FinishReason::Stop,
    }
}

/// Defaults with no retry waits and a rate limit that never binds.
pub fn fast_config() -> AssessConfig {
    let mut config = AssessConfig::default();
    config.retry = RetryPolicy::immediate(2);
    config.batching.requests_per_minute = 600_000;
    config.batching.mapping_batch_size = 2;
    config.batching.artifact_batch_size = 2;
    config.batching.validation_batch_size = 2;
    config.batching.remediation_batch_size = 2;
    config
}
