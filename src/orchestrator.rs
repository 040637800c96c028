//! Agent orchestrator and the public session API.
//!
//! `submit` validates and resolves synchronously, registers the session and
//! spawns one task that drives the five passes in order. That task owns the
//! session's `StatusWriter` and is the only writer of its results; readers
//! go through the store and only ever see committed batches.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use futures::Stream;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::artifacts::{self, OscalExport};
use crate::catalog::{Catalog, ControlId};
use crate::config::AssessConfig;
use crate::estimate::{self, ProcessingEstimate};
use crate::evidence::{self, EvidenceError, EvidenceFile};
use crate::gateway::ChatGateway;
use crate::passes::{
    self, ArtifactPass, EvidencePass, MappingPass, PassContext, RemediationPass, ValidationPass,
};
use crate::prioritize::{prioritize, ControlTier, Depth};
use crate::records::{AssessmentResults, PassKind, ProcessingMetrics, Resolution, ScopeSummary};
use crate::scheduler::{
    build_batches, Batch, BatchCall, BatchOutcome, BatchReport, DispatchSummary, Dispatcher,
    RateLimiter,
};
use crate::scope::{self, AssessmentScope, ResolvedScope, ScopeError};
use crate::session::{
    self, SessionEntry, SessionError, SessionStore, SharedResults, Stage, StateError,
    StatusSnapshot, StatusWriter,
};

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Scope(#[from] ScopeError),
    #[error(transparent)]
    Evidence(#[from] EvidenceError),
}

/// Returned as soon as a session is registered; the pipeline runs on.
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub session_id: Uuid,
    pub scope: ScopeSummary,
    pub estimate: ProcessingEstimate,
    pub status: StatusSnapshot,
}

#[derive(Debug, Error)]
enum RunError {
    #[error("aborted")]
    Aborted,
    #[error(transparent)]
    State(#[from] StateError),
}

#[derive(Clone)]
pub struct Orchestrator {
    gateway: Arc<dyn ChatGateway>,
    limiter: Arc<RateLimiter>,
    store: Arc<SessionStore>,
    config: Arc<AssessConfig>,
}

impl Orchestrator {
    pub fn new(gateway: Arc<dyn ChatGateway>, config: AssessConfig) -> Self {
        let limiter = RateLimiter::per_minute(config.batching.requests_per_minute);
        let store = SessionStore::new(Duration::from_secs(config.sessions.retention_secs));
        Self {
            gateway,
            limiter: Arc::new(limiter),
            store: Arc::new(store),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &AssessConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Scope preview: the resolved control set plus its estimate.
    pub fn estimate_scope(
        &self,
        request: &AssessmentScope,
    ) -> Result<(ResolvedScope, ProcessingEstimate), ScopeError> {
        estimate::estimate_scope(request, &self.config.estimator)
    }

    /// Validate the submission, register a session and start it in the
    /// background. Must be called inside a Tokio runtime.
    pub fn submit(
        &self,
        request: &AssessmentScope,
        files: Vec<EvidenceFile>,
    ) -> Result<Submission, SubmitError> {
        evidence::validate_submission(&files, &self.config.evidence)?;
        let resolved = scope::resolve(request)?;
        let estimate = estimate::estimate_resolved(&resolved, &self.config.estimator);

        let id = Uuid::new_v4();
        let (writer, status) = session::channel(id);
        let results: SharedResults = Arc::new(RwLock::new(AssessmentResults::new(
            id,
            &resolved,
            estimate.clone(),
        )));
        let cancel = CancellationToken::new();
        let scope = Arc::new(resolved);

        self.store.insert(SessionEntry {
            id,
            created_at: Utc::now(),
            scope: scope.clone(),
            status: status.clone(),
            results: results.clone(),
            cancel: cancel.clone(),
        });
        info!(
            session_id = %id,
            controls = scope.len(),
            mode = %scope.mode,
            files = files.len(),
            fingerprint = %scope.fingerprint,
            "assessment submitted"
        );

        let run = SessionRun {
            id,
            ctx: PassContext {
                session_id: id,
                mode: scope.mode,
                reasoning: self.config.reasoning.clone(),
                estimator: self.config.estimator.clone(),
            },
            dispatcher: Dispatcher::new(
                self.gateway.clone(),
                self.limiter.clone(),
                self.config.retry.clone(),
                self.config.batching.max_concurrent_batches,
                self.config.batching.call_timeout(),
            ),
            scope: scope.clone(),
            files,
            writer,
            results,
            cancel,
            config: self.config.clone(),
        };
        tokio::spawn(run.run());

        Ok(Submission {
            session_id: id,
            scope: ScopeSummary::from(scope.as_ref()),
            estimate,
            status: status.snapshot(),
        })
    }

    pub fn status(&self, id: &Uuid) -> Result<StatusSnapshot, SessionError> {
        self.store.status(id)
    }

    /// Status snapshots until the session is terminal.
    pub fn subscribe(
        &self,
        id: &Uuid,
    ) -> Result<impl Stream<Item = StatusSnapshot> + Send + 'static, SessionError> {
        Ok(self.store.get(id)?.status.updates())
    }

    /// Results committed so far. Available once the first pass has landed,
    /// or as soon as the session is terminal.
    pub fn results(&self, id: &Uuid) -> Result<AssessmentResults, SessionError> {
        let entry = self.store.get(id)?;
        let results = entry.results_snapshot()?;
        if results.passes_completed.is_empty() && !entry.status.snapshot().is_terminal() {
            return Err(SessionError::NotReady(*id));
        }
        Ok(results)
    }

    pub async fn abort(&self, id: &Uuid) -> Result<StatusSnapshot, SessionError> {
        self.store.abort(id).await
    }

    pub fn delete(&self, id: &Uuid) -> Result<(), SessionError> {
        self.store.delete(id)
    }

    /// SSP and POA&M documents, once artifacts have been generated.
    pub fn export_oscal(&self, id: &Uuid) -> Result<OscalExport, SessionError> {
        let results = self.store.get(id)?.results_snapshot()?;
        if !results.passes_completed.contains(&PassKind::ArtifactGeneration) {
            return Err(SessionError::NotReady(*id));
        }
        Ok(artifacts::export(&results, Utc::now()))
    }

    pub fn spawn_reaper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        session::spawn_reaper(
            self.store.clone(),
            Duration::from_secs(self.config.sessions.reap_interval_secs),
            shutdown,
        )
    }
}

// =============================================================================
// SESSION TASK
// =============================================================================

struct SessionRun {
    id: Uuid,
    ctx: PassContext,
    dispatcher: Dispatcher,
    scope: Arc<ResolvedScope>,
    files: Vec<EvidenceFile>,
    writer: StatusWriter,
    results: SharedResults,
    cancel: CancellationToken,
    config: Arc<AssessConfig>,
}

/// Resolved output, or the pass's fallback records for a failed batch.
fn settle<T, R>(
    report: BatchReport<T, R>,
    fallback: impl FnOnce(&Batch<T>, &str, Resolution) -> R,
) -> Option<R> {
    let BatchReport { batch, outcome, .. } = report;
    match outcome {
        BatchOutcome::Resolved(out) => Some(out),
        BatchOutcome::Fallback { reason } => Some(fallback(&batch, &reason, Resolution::Fallback)),
        BatchOutcome::Unresolved { reason } => Some(fallback(&batch, &reason, Resolution::Unresolved)),
        BatchOutcome::Cancelled => None,
    }
}

fn record_usage<T, R>(metrics: &mut ProcessingMetrics, report: &BatchReport<T, R>) {
    match report.batch.depth {
        Depth::Individual => metrics.api_calls_individual += report.usage.calls,
        Depth::Batched | Depth::Skip => metrics.api_calls_batch += report.usage.calls,
    }
    metrics.retries += report.usage.retries;
    metrics.tokens_used += report.usage.tokens();
    metrics.cost_nanodollars += report.usage.cost_nanodollars;
    match report.outcome {
        BatchOutcome::Fallback { .. } => metrics.batches_fallback += 1,
        BatchOutcome::Unresolved { .. } => metrics.batches_unresolved += 1,
        BatchOutcome::Resolved(_) | BatchOutcome::Cancelled => {}
    }
}

impl SessionRun {
    async fn run(self) {
        let cancel = self.cancel.clone();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(RunError::Aborted),
            result = self.pipeline() => result,
        };
        match outcome {
            Ok(()) => {}
            Err(RunError::Aborted) => {
                warn!(session_id = %self.id, stage = %self.writer.stage(), "assessment aborted");
                self.writer.fail("Assessment aborted by client");
            }
            Err(err) => {
                error!(session_id = %self.id, stage = %self.writer.stage(), error = %err, "assessment failed");
                self.writer.fail(format!("Assessment failed: {err}"));
            }
        }
    }

    fn read<R>(&self, f: impl FnOnce(&AssessmentResults) -> R) -> R {
        let guard = self.results.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn commit(&self, f: impl FnOnce(&mut AssessmentResults)) {
        let mut guard = self.results.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
    }

    fn finish_pass(&self, pass: PassKind, sort: impl FnOnce(&mut AssessmentResults)) {
        self.commit(|r| {
            sort(r);
            r.passes_completed.push(pass);
            r.refresh_summary();
        });
    }

    /// Dispatch one pass, merging each batch into the results as it lands.
    async fn dispatch<T, C>(
        &self,
        label: &str,
        batches: Vec<Batch<T>>,
        call: &C,
        controls: impl Fn(&T) -> Option<ControlId>,
        mut merge: impl FnMut(&mut AssessmentResults, BatchReport<T, C::Output>),
    ) -> Result<DispatchSummary, RunError>
    where
        T: Send + Sync,
        C: BatchCall<T>,
    {
        let total = batches.len();
        let mut done = 0usize;
        let summary = self
            .dispatcher
            .run(batches, call, &self.cancel, |report| {
                done += 1;
                if matches!(report.outcome, BatchOutcome::Cancelled) {
                    return;
                }
                self.commit(|r| {
                    record_usage(&mut r.metrics, &report);
                    if matches!(report.outcome, BatchOutcome::Unresolved { .. }) {
                        r.unresolved_controls
                            .extend(report.batch.items.iter().filter_map(&controls));
                    }
                    merge(r, report);
                    r.refresh_summary();
                });
                self.writer
                    .progress(done, total, format!("{label}: {done}/{total} batches complete"));
            })
            .await;

        if summary.cancelled > 0 || self.cancel.is_cancelled() {
            return Err(RunError::Aborted);
        }
        info!(
            session_id = %self.id,
            stage = %self.writer.stage(),
            batches = summary.batches,
            resolved = summary.resolved,
            fallback = summary.fallback,
            unresolved = summary.unresolved,
            "pass finished"
        );
        Ok(summary)
    }

    async fn pipeline(&self) -> Result<(), RunError> {
        let w = &self.writer;
        let batching = &self.config.batching;

        w.advance(
            Stage::Initializing,
            format!("Initializing {} assessment", self.scope.mode),
        )?;
        w.advance(
            Stage::Scoping,
            format!(
                "{} controls in scope ({})",
                self.scope.len(),
                self.scope.baseline_label
            ),
        )?;

        // Local evidence preparation.
        w.advance(
            Stage::Processing,
            format!("Processing {} evidence files", self.files.len()),
        )?;
        let mut prepared = Vec::with_capacity(self.files.len());
        for (i, file) in self.files.iter().enumerate() {
            prepared.push(evidence::prepare(i, file));
            w.progress(i + 1, self.files.len(), format!("Processed {}", file.filename));
        }

        // Pass 1: evidence extraction.
        w.advance(Stage::Analyzing, "Extracting evidence inventory")?;
        let pass = EvidencePass::new(&self.ctx);
        self.dispatch(
            "Evidence extraction",
            passes::evidence::batches(prepared),
            &pass,
            |_| None,
            |r, report| {
                if let Some(artifacts) = settle(report, EvidencePass::fallback) {
                    r.evidence.extend(artifacts);
                }
            },
        )
        .await?;
        self.finish_pass(PassKind::EvidenceExtraction, |r| {
            r.evidence.sort_by(|a, b| a.id.cmp(&b.id));
        });

        // Pass 2: control mapping and gap analysis.
        w.advance(
            Stage::Mapping,
            format!("Mapping {} controls against evidence", self.scope.len()),
        )?;
        let evidence = self.read(|r| r.evidence.clone());
        let pass = MappingPass::new(&self.ctx, &evidence);
        let batches = build_batches(
            "map",
            None,
            Depth::Batched,
            self.scope.controls.clone(),
            |id| *id,
            batching.shape(batching.mapping_batch_size),
        );
        self.dispatch("Control mapping", batches, &pass, |id| Some(*id), |r, report| {
            if let Some(out) = settle(report, MappingPass::fallback) {
                r.control_mappings.extend(out.mappings);
                r.control_gaps.extend(out.gaps);
            }
        })
        .await?;
        self.finish_pass(PassKind::ControlMapping, |r| {
            r.control_mappings.sort_by_key(|m| m.control_id);
            r.control_gaps.sort_by_key(|g| g.control_id);
        });

        let (mappings, gaps) = self.read(|r| (r.control_mappings.clone(), r.control_gaps.clone()));
        let prioritized = prioritize(&self.scope.controls, &mappings, &gaps);
        self.commit(|r| {
            r.metrics.critical_controls = prioritized.critical.len();
            r.metrics.standard_controls = prioritized.standard.len();
            r.metrics.passing_controls = prioritized.passing.len();
        });
        info!(
            session_id = %self.id,
            critical = prioritized.critical.len(),
            standard = prioritized.standard.len(),
            passing = prioritized.passing.len(),
            "controls prioritized"
        );

        // Pass 3: OSCAL components and POA&M entries.
        w.advance(Stage::Generating, "Generating OSCAL components and POA&M entries")?;
        let pass = ArtifactPass::new(&self.ctx, &mappings, &gaps, Utc::now().date_naive());
        let batches = passes::artifacts::batches(
            [
                (ControlTier::Critical, prioritized.critical.clone()),
                (ControlTier::Standard, prioritized.standard.clone()),
                (ControlTier::Passing, prioritized.passing.clone()),
            ],
            batching.shape(batching.artifact_batch_size),
        );
        self.dispatch("Artifact generation", batches, &pass, |id| Some(*id), |r, report| {
            if let Some(out) = settle(report, |batch, _, resolution| pass.fallback(batch, resolution)) {
                r.oscal_components.extend(out.components);
                r.poam_entries.extend(out.poam_entries);
            }
        })
        .await?;
        self.finish_pass(PassKind::ArtifactGeneration, |r| {
            r.oscal_components.sort_by(|a, b| a.component_id.cmp(&b.component_id));
            r.poam_entries.sort_by(|a, b| b.risk_level.cmp(&a.risk_level).then_with(|| a.poam_id.cmp(&b.poam_id)));
        });

        // Pass 4: NIST validation.
        w.advance(Stage::ValidatingNist, "Validating controls against NIST 800-53")?;
        let plan = passes::validation::plan(
            &prioritized,
            self.scope.mode,
            self.config.prioritization.skip_passing_controls,
            &mappings,
            batching.shape(batching.validation_batch_size),
        );
        let called: usize = plan.batches.iter().map(Batch::len).sum();
        let reused = plan.reused;
        self.commit(|r| {
            r.metrics.controls_validated = called;
            r.metrics.controls_skipped = reused.len();
            r.nist_validation_results.extend(reused);
        });
        let components = self.read(|r| r.oscal_components.clone());
        let pass = ValidationPass::new(&self.ctx, Catalog::global(), &mappings, &gaps, &components);
        self.dispatch("Validation", plan.batches, &pass, |id| Some(*id), |r, report| {
            if let Some(validations) = settle(report, ValidationPass::fallback) {
                r.nist_validation_results.extend(validations);
            }
        })
        .await?;
        self.finish_pass(PassKind::Validation, |r| {
            r.nist_validation_results.sort_by_key(|v| v.control_id);
        });

        // Structural OSCAL validation of both exported documents.
        w.advance(Stage::ValidatingOscal, "Validating OSCAL documents")?;
        let export = self.read(|r| artifacts::export(r, Utc::now()));
        let reports = export.validate();
        for report in reports.iter().filter(|r| !r.is_valid) {
            warn!(
                session_id = %self.id,
                document = %report.document_type,
                errors = report.error_count,
                "OSCAL document failed structural validation"
            );
        }
        self.commit(|r| r.oscal_validation = reports);
        w.progress(1, 1, "OSCAL validation complete");

        // Pass 5: remediation planning.
        w.advance(Stage::Planning, format!("Planning remediation for {} gaps", gaps.len()))?;
        let batches = passes::remediation::plan(
            &gaps,
            self.scope.mode,
            &self.config.prioritization.deep_reasoning_risk_levels,
            batching.shape(batching.remediation_batch_size),
        );
        let pass = RemediationPass::new(&self.ctx);
        self.dispatch(
            "Remediation planning",
            batches,
            &pass,
            |gap| Some(gap.control_id),
            |r, report| {
                if let Some(tasks) = settle(report, |batch, _, resolution| RemediationPass::fallback(batch, resolution)) {
                    r.remediation_tasks.extend(tasks);
                }
            },
        )
        .await?;
        self.finish_pass(PassKind::RemediationPlanning, |r| {
            passes::remediation::finalize(&mut r.remediation_tasks);
        });

        w.advance(Stage::Finalizing, "Compiling results")?;
        let results = {
            let mut guard = self.results.write().unwrap_or_else(PoisonError::into_inner);
            guard.metrics.finished_at = Some(Utc::now());
            guard.refresh_summary();
            guard.clone()
        };
        let m = &results.metrics;
        info!(
            session_id = %self.id,
            controls = m.controls_in_scope,
            api_calls = m.api_calls_made(),
            retries = m.retries,
            tokens_used = m.tokens_used,
            tokens_estimated = m.tokens_estimated,
            token_efficiency = m.token_efficiency_percent(),
            fallback_batches = m.batches_fallback,
            unresolved_batches = m.batches_unresolved,
            duration_s = m.duration_seconds(),
            "assessment metrics"
        );

        let review = results.summary.needs_review;
        let message = if review > 0 {
            format!(
                "Assessment complete: {} controls analyzed, {} need review",
                results.summary.total_controls_analyzed, review
            )
        } else {
            format!(
                "Assessment complete: {} controls analyzed",
                results.summary.total_controls_analyzed
            )
        };
        w.complete(message)?;
        Ok(())
    }
}
