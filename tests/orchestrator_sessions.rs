mod common;

use std::sync::Arc;
use std::time::Duration;

use assessment_orchestrator::evidence::EvidenceFile;
use assessment_orchestrator::prioritize::Depth;
use assessment_orchestrator::records::{ImplementationStatus, PassKind, Resolution, RiskLevel};
use assessment_orchestrator::{
    AssessmentMode, AssessmentResults, AssessmentScope, ControlId, Orchestrator, SessionError, Stage, StatusSnapshot,
};
use common::{fast_config, Pass, ScriptedReasoner};
use futures::StreamExt;
use uuid::Uuid;

const CONTROLS: [&str; 6] = ["AC-2", "AC-3", "AC-4", "AU-6", "IA-5", "SC-7"];

fn evidence() -> Vec<EvidenceFile> {
    vec![
        EvidenceFile::new(
            "access_policy.txt",
            "text/plain",
            "Accounts are reviewed quarterly per AC-2. MFA is enforced (IA-2).",
        ),
        EvidenceFile::new("network_diagram.png", "image/png", vec![0x89, b'P', b'N', b'G']),
    ]
}

fn scope(mode: AssessmentMode) -> AssessmentScope {
    let mut scope = AssessmentScope::default().controls(CONTROLS);
    scope.mode = mode;
    scope
}

fn cid(s: &str) -> ControlId {
    s.parse().unwrap()
}

async fn run_to_end(orch: &Orchestrator, scope: &AssessmentScope) -> (Uuid, Stage, AssessmentResults) {
    let submission = orch.submit(scope, evidence()).unwrap();
    let id = submission.session_id;
    let entry = orch.store().get(&id).unwrap();
    let last = tokio::time::timeout(Duration::from_secs(20), entry.status.wait_terminal())
        .await
        .expect("session did not finish");
    (id, last.stage, orch.results(&id).unwrap())
}

#[tokio::test]
async fn smart_session_yields_one_record_per_control() {
    let reasoner = Arc::new(ScriptedReasoner::default());
    let orch = Orchestrator::new(reasoner.clone(), fast_config());

    let (id, stage, results) = run_to_end(&orch, &scope(AssessmentMode::Smart)).await;
    assert_eq!(stage, Stage::Complete);
    assert_eq!(orch.status(&id).unwrap().progress, 100);

    assert_eq!(results.evidence.len(), 2);
    assert!(results.evidence[0].controls_mentioned.contains(&cid("AC-2")));
    let mapped: Vec<_> = results.control_mappings.iter().map(|m| m.control_id).collect();
    assert_eq!(mapped, CONTROLS.map(cid).to_vec());
    assert!(results.control_mappings.iter().all(|m| m.resolution == Resolution::Reasoned));

    // AC-3 and AU-6 missing (high gap), AC-4 and SC-7 implemented, AC-2 and IA-5 partial.
    assert_eq!(results.metrics.critical_controls, 2);
    assert_eq!(results.metrics.standard_controls, 2);
    assert_eq!(results.metrics.passing_controls, 2);

    assert_eq!(results.nist_validation_results.len(), CONTROLS.len());
    let reused: Vec<_> = results
        .nist_validation_results
        .iter()
        .filter(|v| v.resolution == Resolution::Reused)
        .map(|v| v.control_id)
        .collect();
    assert_eq!(reused, vec![cid("AC-4"), cid("SC-7")]);
    let critical_depths: Vec<_> = results
        .nist_validation_results
        .iter()
        .filter(|v| v.control_id == cid("AC-3") || v.control_id == cid("AU-6"))
        .map(|v| v.depth)
        .collect();
    assert_eq!(critical_depths, vec![Depth::Individual, Depth::Individual]);
    assert_eq!(results.metrics.controls_skipped, 2);
    assert_eq!(results.metrics.controls_validated, 4);

    assert_eq!(results.oscal_components.len(), CONTROLS.len());
    assert_eq!(results.poam_entries.len(), results.control_gaps.len());
    assert!(results.oscal_validation.iter().all(|v| v.is_valid));

    assert_eq!(results.remediation_tasks.len(), 4);
    assert!(results
        .remediation_tasks
        .windows(2)
        .all(|w| w[0].priority >= w[1].priority));

    assert_eq!(
        results.passes_completed,
        vec![
            PassKind::EvidenceExtraction,
            PassKind::ControlMapping,
            PassKind::ArtifactGeneration,
            PassKind::Validation,
            PassKind::RemediationPlanning,
        ]
    );
    assert_eq!(results.summary.total_controls_analyzed, 6);
    assert_eq!(results.summary.implemented_controls, 2);
    assert!(results.metrics.finished_at.is_some());
    assert_eq!(
        results.metrics.api_calls_made(),
        reasoner.calls.load(std::sync::atomic::Ordering::SeqCst)
    );
    assert!(orch.export_oscal(&id).is_ok());
}

#[tokio::test]
async fn status_stream_only_moves_forward_and_ends_at_complete() {
    let orch = Orchestrator::new(Arc::new(ScriptedReasoner::default()), fast_config());
    let id = orch.submit(&scope(AssessmentMode::Smart), evidence()).unwrap().session_id;

    let seen: Vec<StatusSnapshot> = tokio::time::timeout(Duration::from_secs(20), orch.subscribe(&id).unwrap().collect())
        .await
        .expect("status stream did not end");

    assert!(!seen.is_empty());
    assert!(seen.iter().all(|s| s.session_id == id));
    for pair in seen.windows(2) {
        assert!(pair[0].stage <= pair[1].stage, "{:?} after {:?}", pair[1].stage, pair[0].stage);
        assert!(pair[0].progress <= pair[1].progress);
    }
    let last = seen.last().unwrap();
    assert_eq!((last.stage, last.progress), (Stage::Complete, 100));
    assert_eq!(seen.iter().filter(|s| s.stage == Stage::Complete).count(), 1);

    // A late subscriber gets the terminal snapshot once, then the stream closes.
    let late: Vec<StatusSnapshot> = orch.subscribe(&id).unwrap().collect().await;
    assert_eq!(late.len(), 1);
    assert_eq!(late[0].stage, Stage::Complete);
}

#[tokio::test]
async fn deep_mode_sends_every_control_individually_to_the_deep_model() {
    let reasoner = Arc::new(ScriptedReasoner::default());
    let config = fast_config();
    let deep_model = config.reasoning.deep_model.clone();
    let orch = Orchestrator::new(reasoner.clone(), config);

    let (_, stage, results) = run_to_end(&orch, &scope(AssessmentMode::Deep)).await;
    assert_eq!(stage, Stage::Complete);
    assert!(results
        .nist_validation_results
        .iter()
        .all(|v| v.depth == Depth::Individual && v.resolution == Resolution::Reasoned));
    assert_eq!(reasoner.calls_for(Pass::Validation), CONTROLS.len());
    assert_eq!(reasoner.calls_for(Pass::Remediation), results.control_gaps.len());
    assert_eq!(
        reasoner.calls_on_model(&deep_model),
        CONTROLS.len() + results.control_gaps.len()
    );
}

#[tokio::test]
async fn quick_mode_reuses_passing_and_batches_the_rest() {
    let reasoner = Arc::new(ScriptedReasoner::default());
    let orch = Orchestrator::new(reasoner.clone(), fast_config());

    let (_, stage, results) = run_to_end(&orch, &scope(AssessmentMode::Quick)).await;
    assert_eq!(stage, Stage::Complete);
    assert!(results
        .nist_validation_results
        .iter()
        .all(|v| v.depth != Depth::Individual));
    assert_eq!(results.metrics.api_calls_individual, 2, "one extraction call per file");
    // Four non-passing controls in batches of two.
    assert_eq!(reasoner.calls_for(Pass::Validation), 2);
}

#[tokio::test]
async fn transient_failures_leave_controls_unresolved_and_the_session_completes() {
    let reasoner = Arc::new(ScriptedReasoner {
        transient: vec!["AU-6"],
        ..Default::default()
    });
    let orch = Orchestrator::new(reasoner.clone(), fast_config());

    let (_, stage, results) = run_to_end(&orch, &scope(AssessmentMode::Smart)).await;
    assert_eq!(stage, Stage::Complete);
    assert!(results.unresolved_controls.contains(&cid("AU-6")));
    assert!(!results.unresolved_controls.contains(&cid("AC-2")));
    assert_eq!(results.metrics.batches_unresolved, 1);
    assert!(results.metrics.retries >= 1);

    let au6 = results
        .control_mappings
        .iter()
        .find(|m| m.control_id == cid("AU-6"))
        .unwrap();
    assert_eq!(au6.resolution, Resolution::Unresolved);
    assert_eq!(au6.implementation_status, ImplementationStatus::NotImplemented);
    assert!(results
        .control_gaps
        .iter()
        .any(|g| g.control_id == cid("AU-6") && g.risk_level == RiskLevel::Medium));

    let ac2 = results
        .control_mappings
        .iter()
        .find(|m| m.control_id == cid("AC-2"))
        .unwrap();
    assert_eq!(ac2.resolution, Resolution::Reasoned);
    assert!(results.summary.needs_review >= 1);
}

#[tokio::test]
async fn malformed_batch_falls_back_without_touching_its_neighbours() {
    let reasoner = Arc::new(ScriptedReasoner {
        malformed: vec!["SC-7"],
        ..Default::default()
    });
    let orch = Orchestrator::new(reasoner.clone(), fast_config());

    let (_, stage, results) = run_to_end(&orch, &scope(AssessmentMode::Smart)).await;
    assert_eq!(stage, Stage::Complete);
    assert_eq!(results.metrics.batches_fallback, 1);
    assert!(results.unresolved_controls.is_empty());

    let sc7 = results
        .control_mappings
        .iter()
        .find(|m| m.control_id == cid("SC-7"))
        .unwrap();
    assert_eq!(sc7.resolution, Resolution::Fallback);
    assert_eq!(sc7.confidence_score, 0.0);
    // A fallback control is never tiered passing, so it is validated.
    let sc7_validation = results
        .nist_validation_results
        .iter()
        .find(|v| v.control_id == cid("SC-7"))
        .unwrap();
    assert_ne!(sc7_validation.resolution, Resolution::Reused);

    let reasoned = results
        .control_mappings
        .iter()
        .filter(|m| m.resolution == Resolution::Reasoned)
        .count();
    assert!(reasoned >= 4, "only the SC-7 batch falls back");
}

#[tokio::test]
async fn abort_mid_mapping_keeps_committed_batches() {
    let reasoner = Arc::new(ScriptedReasoner {
        hang: vec!["SC-7"],
        ..Default::default()
    });
    let orch = Orchestrator::new(reasoner.clone(), fast_config());
    let submission = orch.submit(&scope(AssessmentMode::Smart), evidence()).unwrap();
    let session = submission.session_id;
    let entry = orch.store().get(&session).unwrap();

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let mapped = entry.results_snapshot().unwrap().control_mappings.len();
            if mapped >= 4 && entry.status.snapshot().stage == Stage::Mapping {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("mapping batches never landed");

    let snapshot = tokio::time::timeout(Duration::from_secs(5), orch.abort(&session))
        .await
        .expect("abort did not settle")
        .unwrap();
    assert_eq!(snapshot.stage, Stage::Error);
    assert!(snapshot.error.as_deref().unwrap_or_default().contains("aborted"));

    let results = orch.results(&session).unwrap();
    assert_eq!(results.control_mappings.len(), 4);
    assert!(results
        .control_mappings
        .iter()
        .all(|m| m.control_id != cid("SC-7")));
    assert_eq!(results.passes_completed, vec![PassKind::EvidenceExtraction]);

    assert!(matches!(orch.abort(&session).await, Err(SessionError::Terminal(Stage::Error))));
}

#[tokio::test]
async fn concurrent_sessions_keep_their_results_apart() {
    let reasoner = Arc::new(ScriptedReasoner::default());
    let orch = Orchestrator::new(reasoner.clone(), fast_config());

    let mut access = AssessmentScope::default().controls(["AC-2", "AC-3", "AC-4"]);
    access.mode = AssessmentMode::Quick;
    let audit = AssessmentScope::default().controls(["AU-2", "AU-3", "AU-6", "AU-12"]);

    let (a, b) = tokio::join!(run_to_end(&orch, &access), run_to_end(&orch, &audit));
    assert_ne!(a.0, b.0);
    assert_eq!((a.1, b.1), (Stage::Complete, Stage::Complete));

    let families = |r: &AssessmentResults| {
        r.control_mappings
            .iter()
            .map(|m| m.control_id.family().code())
            .collect::<std::collections::BTreeSet<_>>()
    };
    assert_eq!(families(&a.2).into_iter().collect::<Vec<_>>(), vec!["AC"]);
    assert_eq!(families(&b.2).into_iter().collect::<Vec<_>>(), vec!["AU"]);
    assert_eq!(a.2.control_mappings.len(), 3);
    assert_eq!(b.2.control_mappings.len(), 4);
    assert_eq!(a.2.session_id, a.0);
    assert_eq!(b.2.session_id, b.0);
}

#[tokio::test]
async fn session_lookup_errors_and_deletion() {
    let orch = Orchestrator::new(Arc::new(ScriptedReasoner::default()), fast_config());
    let unknown = Uuid::new_v4();
    assert!(matches!(orch.status(&unknown), Err(SessionError::NotFound(_))));
    assert!(matches!(orch.results(&unknown), Err(SessionError::NotFound(_))));

    let (id, _, _) = run_to_end(&orch, &scope(AssessmentMode::Quick)).await;
    assert!(matches!(orch.abort(&id).await, Err(SessionError::Terminal(Stage::Complete))));
    orch.delete(&id).unwrap();
    assert!(matches!(orch.status(&id), Err(SessionError::NotFound(_))));
    assert!(matches!(orch.delete(&id), Err(SessionError::NotFound(_))));
}

#[tokio::test]
async fn submission_is_rejected_before_a_session_exists() {
    let orch = Orchestrator::new(Arc::new(ScriptedReasoner::default()), fast_config());

    assert!(orch.submit(&scope(AssessmentMode::Smart), Vec::new()).is_err());
    let bad_scope = AssessmentScope::default().controls(["ZZ-1"]);
    assert!(orch.submit(&bad_scope, evidence()).is_err());
    let exe = vec![EvidenceFile::new("tool.exe", "application/x-msdownload", vec![0u8; 4])];
    assert!(orch.submit(&scope(AssessmentMode::Smart), exe).is_err());

    assert!(orch.store().is_empty());
}
