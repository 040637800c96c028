//! Per-session status: one writer, any number of readers.
//!
//! `StatusWriter` is owned by the orchestrator task that runs the session
//! and is deliberately not `Clone`. Readers hold a `StatusHandle`, which
//! only ever sees whole snapshots published through a watch channel, so a
//! status query never waits on pipeline work.

use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info};
use uuid::Uuid;

use super::stage::Stage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub session_id: Uuid,
    pub stage: Stage,
    /// 0–100, never decreases.
    pub progress: u8,
    pub current_step: String,
    pub message: String,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StatusSnapshot {
    fn initial(session_id: Uuid) -> Self {
        Self {
            session_id,
            stage: Stage::Uploading,
            progress: 0,
            current_step: Stage::Uploading.default_step().to_string(),
            message: "Evidence received".to_string(),
            error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("stage cannot move backwards from {from} to {to}")]
    OutOfOrder { from: Stage, to: Stage },
    #[error("use fail() to enter the error stage")]
    ErrorViaAdvance,
}

pub struct StatusWriter {
    tx: watch::Sender<StatusSnapshot>,
}

/// Create the writer and the first reader for a new session.
pub fn channel(session_id: Uuid) -> (StatusWriter, StatusHandle) {
    let (tx, rx) = watch::channel(StatusSnapshot::initial(session_id));
    (StatusWriter { tx }, StatusHandle { rx })
}

impl StatusWriter {
    pub fn snapshot(&self) -> StatusSnapshot {
        self.tx.borrow().clone()
    }

    pub fn stage(&self) -> Stage {
        self.tx.borrow().stage
    }

    /// Move to `stage` (or stay in it) with a new message. A no-op once the
    /// session is terminal.
    pub fn advance(&self, stage: Stage, message: impl Into<String>) -> Result<(), StateError> {
        if stage == Stage::Error {
            return Err(StateError::ErrorViaAdvance);
        }
        let message = message.into();
        let mut result = Ok(());
        self.tx.send_if_modified(|status| {
            if status.stage.is_terminal() {
                debug!(session_id = %status.session_id, requested = %stage, "advance ignored on terminal session");
                return false;
            }
            if stage < status.stage {
                result = Err(StateError::OutOfOrder {
                    from: status.stage,
                    to: stage,
                });
                return false;
            }
            if stage != status.stage {
                info!(session_id = %status.session_id, from = %status.stage, to = %stage, "stage transition");
                status.current_step = stage.default_step().to_string();
            }
            status.stage = stage;
            status.progress = status.progress.max(stage.band().0);
            if stage == Stage::Complete {
                status.progress = 100;
            }
            status.message = message;
            status.updated_at = Utc::now();
            true
        });
        result
    }

    /// Progress within the current stage after `done` of `total` units.
    pub fn progress(&self, done: usize, total: usize, message: impl Into<String>) {
        let message = message.into();
        self.tx.send_if_modified(|status| {
            if status.stage.is_terminal() {
                return false;
            }
            status.progress = status.progress.max(status.stage.progress_at(done, total));
            status.message = message;
            status.updated_at = Utc::now();
            true
        });
    }

    pub fn complete(&self, message: impl Into<String>) -> Result<(), StateError> {
        self.advance(Stage::Complete, message)
    }

    /// Enter the error stage. Final; later calls are no-ops.
    pub fn fail(&self, error: impl Into<String>) {
        let error = error.into();
        self.tx.send_if_modified(|status| {
            if status.stage.is_terminal() {
                return false;
            }
            info!(session_id = %status.session_id, from = %status.stage, "stage transition to error");
            status.stage = Stage::Error;
            status.current_step = Stage::Error.default_step().to_string();
            status.message = error.clone();
            status.error = Some(error);
            status.updated_at = Utc::now();
            true
        });
    }
}

impl Drop for StatusWriter {
    fn drop(&mut self) {
        // A writer dropped mid-run (panic, task abort) must not leave the
        // session looking alive to pollers.
        self.fail("assessment task ended unexpectedly");
    }
}

/// Read-only view of a session's status.
#[derive(Debug, Clone)]
pub struct StatusHandle {
    rx: watch::Receiver<StatusSnapshot>,
}

impl StatusHandle {
    pub fn snapshot(&self) -> StatusSnapshot {
        self.rx.borrow().clone()
    }

    /// The current snapshot, then every change, ending after the first
    /// terminal snapshot.
    pub fn updates(&self) -> impl Stream<Item = StatusSnapshot> + Send + 'static {
        let mut rx = self.rx.clone();
        rx.mark_changed();
        stream::unfold((rx, false), |(mut rx, done)| async move {
            if done || rx.changed().await.is_err() {
                return None;
            }
            let snapshot = rx.borrow_and_update().clone();
            let terminal = snapshot.is_terminal();
            Some((snapshot, (rx, terminal)))
        })
    }

    /// Resolves once the session reaches a terminal stage.
    pub async fn wait_terminal(&self) -> StatusSnapshot {
        let mut rx = self.rx.clone();
        let waited = rx.wait_for(|s| s.is_terminal()).await.map(|snapshot| snapshot.clone());
        match waited {
            Ok(snapshot) => snapshot,
            Err(_) => rx.borrow().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn forward_only_and_monotonic() {
        let (writer, handle) = channel(Uuid::new_v4());
        writer.advance(Stage::Initializing, "init").unwrap();
        writer.advance(Stage::Mapping, "mapping").unwrap();
        writer.progress(3, 4, "3/4");
        let before = handle.snapshot().progress;
        assert_eq!(before, 46);

        let err = writer.advance(Stage::Analyzing, "back").unwrap_err();
        assert_eq!(
            err,
            StateError::OutOfOrder {
                from: Stage::Mapping,
                to: Stage::Analyzing
            }
        );
        writer.progress(1, 4, "regress?");
        assert_eq!(handle.snapshot().progress, before);
    }

    #[test]
    fn error_is_final() {
        let (writer, handle) = channel(Uuid::new_v4());
        writer.advance(Stage::Mapping, "m").unwrap();
        writer.fail("aborted by client");
        writer.advance(Stage::Generating, "g").unwrap();
        writer.complete("done").unwrap();
        let s = handle.snapshot();
        assert_eq!(s.stage, Stage::Error);
        assert_eq!(s.error.as_deref(), Some("aborted by client"));
        assert_eq!(writer.advance(Stage::Error, "x"), Err(StateError::ErrorViaAdvance));
    }

    #[test]
    fn dropped_writer_marks_error() {
        let (writer, handle) = channel(Uuid::new_v4());
        writer.advance(Stage::Scoping, "s").unwrap();
        drop(writer);
        assert_eq!(handle.snapshot().stage, Stage::Error);
    }

    #[tokio::test]
    async fn updates_stream_closes_after_terminal() {
        let (writer, handle) = channel(Uuid::new_v4());
        let collector = tokio::spawn(handle.updates().collect::<Vec<_>>());
        for stage in Stage::ORDERED.iter().skip(1) {
            writer.advance(*stage, stage.as_str()).unwrap();
            tokio::task::yield_now().await;
        }
        let seen = collector.await.unwrap();
        assert_eq!(seen.last().map(|s| s.stage), Some(Stage::Complete));
        assert!(seen.windows(2).all(|w| w[0].progress <= w[1].progress && w[0].stage <= w[1].stage));
    }
}
