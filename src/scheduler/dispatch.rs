//! Sliding-window dispatch of batches against the reasoning gateway.
//!
//! Up to `max_concurrent` batches are in flight; as one finishes the next
//! is admitted. Every attempt first takes a token from the shared rate
//! limiter and runs under the per-call timeout. Failures stay inside the
//! batch: the caller always receives one report per batch.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::batch::Batch;
use super::rate_limit::RateLimiter;
use super::retry::RetryPolicy;
use crate::gateway::{ChatGateway, ChatRequest, ChatResponse, ProviderError};

/// How one pass turns a batch into a request and a response into records.
pub trait BatchCall<T>: Send + Sync {
    type Output: Send;
    type Error: fmt::Display + Send;

    fn request(&self, batch: &Batch<T>) -> ChatRequest;

    /// Strict parse. An error marks the response malformed and resolves the
    /// batch to fallback records without a retry.
    fn parse(&self, batch: &Batch<T>, response: &ChatResponse) -> Result<Self::Output, Self::Error>;
}

#[derive(Debug)]
pub enum BatchOutcome<R> {
    Resolved(R),
    /// Malformed response or a permanent service error.
    Fallback { reason: String },
    /// Transient failures exhausted every attempt.
    Unresolved { reason: String },
    Cancelled,
}

impl<R> BatchOutcome<R> {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Resolved(_) => "resolved",
            Self::Fallback { .. } => "fallback",
            Self::Unresolved { .. } => "unresolved",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Calls and spend for one batch across all of its attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallUsage {
    pub calls: usize,
    pub retries: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_nanodollars: i64,
}

impl CallUsage {
    fn absorb(&mut self, resp: &ChatResponse) {
        self.input_tokens += u64::from(resp.input_tokens);
        self.output_tokens += u64::from(resp.output_tokens);
        self.cost_nanodollars += resp.cost_nanodollars;
    }

    pub fn tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug)]
pub struct BatchReport<T, R> {
    pub batch: Batch<T>,
    pub outcome: BatchOutcome<R>,
    pub attempts: u32,
    pub usage: CallUsage,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub batches: usize,
    pub resolved: usize,
    pub fallback: usize,
    pub unresolved: usize,
    pub cancelled: usize,
}

impl DispatchSummary {
    fn count<R>(&mut self, outcome: &BatchOutcome<R>) {
        self.batches += 1;
        match outcome {
            BatchOutcome::Resolved(_) => self.resolved += 1,
            BatchOutcome::Fallback { .. } => self.fallback += 1,
            BatchOutcome::Unresolved { .. } => self.unresolved += 1,
            BatchOutcome::Cancelled => self.cancelled += 1,
        }
    }
}

/// Dispatch limits for one session. The rate limiter is shared.
#[derive(Clone)]
pub struct Dispatcher {
    gateway: Arc<dyn ChatGateway>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    max_concurrent: usize,
    call_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        max_concurrent: usize,
        call_timeout: Duration,
    ) -> Self {
        Self {
            gateway,
            limiter,
            retry,
            max_concurrent: max_concurrent.max(1),
            call_timeout,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Run every batch and hand each report to `on_report` as it completes,
    /// in completion order. `on_report` runs on the caller's task, so it
    /// can merge results without locking against other batches.
    pub async fn run<T, C, F>(
        &self,
        batches: Vec<Batch<T>>,
        call: &C,
        cancel: &CancellationToken,
        mut on_report: F,
    ) -> DispatchSummary
    where
        T: Send + Sync,
        C: BatchCall<T>,
        F: FnMut(BatchReport<T, C::Output>),
    {
        let mut summary = DispatchSummary::default();
        let mut reports = stream::iter(
            batches
                .into_iter()
                .map(|batch| self.run_batch(batch, call, cancel)),
        )
        .buffer_unordered(self.max_concurrent);

        while let Some(report) = reports.next().await {
            summary.count(&report.outcome);
            on_report(report);
        }
        summary
    }

    async fn run_batch<T, C>(
        &self,
        batch: Batch<T>,
        call: &C,
        cancel: &CancellationToken,
    ) -> BatchReport<T, C::Output>
    where
        T: Send + Sync,
        C: BatchCall<T>,
    {
        let mut usage = CallUsage::default();
        let mut attempt = 0u32;

        let outcome = loop {
            if cancel.is_cancelled() {
                break BatchOutcome::Cancelled;
            }
            attempt += 1;

            let request = call.request(&batch);
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => break BatchOutcome::Cancelled,
                result = self.attempt(request) => result,
            };

            let err = match result {
                Ok(resp) => {
                    usage.calls += 1;
                    usage.absorb(&resp);
                    match call.parse(&batch, &resp) {
                        Ok(value) => break BatchOutcome::Resolved(value),
                        Err(e) => {
                            warn!(batch = %batch.id, error = %e, "malformed batch response; using fallback records");
                            break BatchOutcome::Fallback {
                                reason: format!("malformed response: {e}"),
                            };
                        }
                    }
                }
                Err(err) => err,
            };

            if !matches!(
                err,
                ProviderError::RateLimited {
                    limit_source: crate::gateway::RateLimitSource::Local,
                    ..
                }
            ) {
                usage.calls += 1;
            }

            if self.retry.should_retry(attempt, &err) {
                let delay = self.retry.delay_for(attempt, &err);
                usage.retries += 1;
                warn!(
                    batch = %batch.id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient batch failure; retrying"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break BatchOutcome::Cancelled,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }

            if err.is_retryable() {
                warn!(batch = %batch.id, attempts = attempt, error = %err, "batch unresolved after retries");
                break BatchOutcome::Unresolved {
                    reason: format!("{} after {attempt} attempts", err.code()),
                };
            }
            warn!(batch = %batch.id, error = %err, "permanent batch failure; using fallback records");
            break BatchOutcome::Fallback {
                reason: err.to_string(),
            };
        };

        debug!(batch = %batch.id, outcome = outcome.label(), attempts = attempt, "batch finished");
        BatchReport {
            batch,
            outcome,
            attempts: attempt,
            usage,
        }
    }

    async fn attempt(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.limiter.acquire_within(self.call_timeout).await?;
        match tokio::time::timeout(self.call_timeout, self.gateway.chat(request)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(self.call_timeout, None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::catalog::ControlId;
    use crate::gateway::{Attribution, ChatModel, FinishReason, Message};
    use crate::prioritize::Depth;

    /// Fails batches whose first message mentions a poisoned control.
    struct Scripted {
        transient: Vec<&'static str>,
        malformed: Vec<&'static str>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl ChatGateway for Scripted {
        async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let body = &req.messages[0].content;
            if self.transient.iter().any(|c| body.contains(c)) {
                return Err(ProviderError::Timeout(Duration::from_millis(1), None));
            }
            let content = if self.malformed.iter().any(|c| body.contains(c)) {
                "not json".to_string()
            } else {
                body.clone()
            };
            Ok(ChatResponse {
                content,
                input_tokens: 10,
                output_tokens: 5,
                cost_nanodollars: 100,
                upstream_cost_nanodollars: None,
                latency: Duration::from_millis(5),
                finish_reason: FinishReason::Stop,
            })
        }
    }

    struct Echo;

    impl BatchCall<ControlId> for Echo {
        type Output = Vec<ControlId>;
        type Error = String;

        fn request(&self, batch: &Batch<ControlId>) -> ChatRequest {
            let body = batch
                .items
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            ChatRequest::new(ChatModel::new("test/model"), vec![Message::user(body)], Attribution::new("test"))
        }

        fn parse(&self, _batch: &Batch<ControlId>, response: &ChatResponse) -> Result<Self::Output, String> {
            response
                .content
                .split(',')
                .map(|s| s.parse::<ControlId>().map_err(|e| e.to_string()))
                .collect()
        }
    }

    fn batches(groups: &[&[&str]]) -> Vec<Batch<ControlId>> {
        groups
            .iter()
            .enumerate()
            .map(|(i, g)| Batch {
                id: format!("b-{i}"),
                tier: None,
                depth: Depth::Batched,
                items: g.iter().map(|s| s.parse().unwrap()).collect(),
            })
            .collect()
    }

    fn dispatcher(gateway: Arc<Scripted>, max_concurrent: usize) -> Dispatcher {
        Dispatcher::new(
            gateway,
            Arc::new(RateLimiter::with_burst(60_000, 1_000)),
            RetryPolicy::immediate(3),
            max_concurrent,
            Duration::from_secs(5),
        )
    }

    fn scripted(transient: Vec<&'static str>, malformed: Vec<&'static str>) -> Arc<Scripted> {
        Arc::new(Scripted {
            transient,
            malformed,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn failures_stay_inside_their_batch() {
        let gateway = scripted(vec!["AU-6"], vec!["SC-7"]);
        let d = dispatcher(gateway.clone(), 2);
        let outcomes = Mutex::new(HashMap::new());

        let summary = d
            .run(
                batches(&[&["AC-2", "AC-3"], &["AU-6"], &["SC-7"], &["IA-5"]]),
                &Echo,
                &CancellationToken::new(),
                |report| {
                    outcomes
                        .lock()
                        .unwrap()
                        .insert(report.batch.id.clone(), (report.outcome.label(), report.attempts));
                },
            )
            .await;

        let outcomes = outcomes.into_inner().unwrap();
        assert_eq!(outcomes["b-0"], ("resolved", 1));
        assert_eq!(outcomes["b-1"], ("unresolved", 3));
        assert_eq!(outcomes["b-2"], ("fallback", 1));
        assert_eq!(outcomes["b-3"], ("resolved", 1));
        assert_eq!(summary.resolved, 2);
        assert_eq!(summary.unresolved, 1);
        assert_eq!(summary.fallback, 1);
        // 3 successes + 3 attempts on the transient batch
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_window() {
        let gateway = scripted(vec![], vec![]);
        let d = dispatcher(gateway.clone(), 2);
        let groups: Vec<Vec<String>> = (1..=8).map(|n| vec![format!("AC-{n}")]).collect();
        let refs: Vec<Vec<&str>> = groups.iter().map(|g| g.iter().map(String::as_str).collect()).collect();
        let slices: Vec<&[&str]> = refs.iter().map(Vec::as_slice).collect();

        let summary = d.run(batches(&slices), &Echo, &CancellationToken::new(), |_| {}).await;
        assert_eq!(summary.resolved, 8);
        assert!(gateway.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn cancelled_token_reports_cancelled_batches() {
        let gateway = scripted(vec![], vec![]);
        let d = dispatcher(gateway.clone(), 2);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = d.run(batches(&[&["AC-2"], &["AC-3"]]), &Echo, &cancel, |_| {}).await;
        assert_eq!(summary.cancelled, 2);
        assert_eq!(gateway.calls.load(Ordering::SeqCst), 0);
    }
}
