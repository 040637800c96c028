//! In-memory session registry with retention-based reaping.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::stage::Stage;
use super::state::{StatusHandle, StatusSnapshot};
use crate::records::AssessmentResults;
use crate::scope::ResolvedScope;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(Uuid),
    #[error("session already finished ({0})")]
    Terminal(Stage),
    #[error("results for session {0} are not available yet")]
    NotReady(Uuid),
    #[error("results lock poisoned")]
    Poisoned,
}

/// Results shared between the owning orchestrator task (the only writer)
/// and readers.
pub type SharedResults = Arc<RwLock<AssessmentResults>>;

#[derive(Clone)]
pub struct SessionEntry {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub scope: Arc<ResolvedScope>,
    pub status: StatusHandle,
    pub results: SharedResults,
    pub cancel: CancellationToken,
}

impl SessionEntry {
    pub fn results_snapshot(&self) -> Result<AssessmentResults, SessionError> {
        self.results
            .read()
            .map(|r| r.clone())
            .map_err(|_| SessionError::Poisoned)
    }
}

pub struct SessionStore {
    sessions: DashMap<Uuid, SessionEntry>,
    retention: Duration,
}

impl SessionStore {
    pub fn new(retention: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            retention,
        }
    }

    pub fn insert(&self, entry: SessionEntry) {
        self.sessions.insert(entry.id, entry);
    }

    pub fn get(&self, id: &Uuid) -> Result<SessionEntry, SessionError> {
        self.sessions
            .get(id)
            .map(|e| e.value().clone())
            .ok_or(SessionError::NotFound(*id))
    }

    pub fn status(&self, id: &Uuid) -> Result<StatusSnapshot, SessionError> {
        Ok(self.get(id)?.status.snapshot())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.sessions.iter().map(|e| *e.key()).collect()
    }

    /// Request cancellation. The owning task performs the transition to
    /// `error`; await the returned snapshot to observe it.
    pub async fn abort(&self, id: &Uuid) -> Result<StatusSnapshot, SessionError> {
        let entry = self.get(id)?;
        let current = entry.status.snapshot();
        if current.is_terminal() {
            return Err(SessionError::Terminal(current.stage));
        }
        entry.cancel.cancel();
        Ok(entry.status.wait_terminal().await)
    }

    /// Cancel if running, then forget the session.
    pub fn delete(&self, id: &Uuid) -> Result<(), SessionError> {
        let (_, entry) = self
            .sessions
            .remove(id)
            .ok_or(SessionError::NotFound(*id))?;
        entry.cancel.cancel();
        info!(session_id = %id, "session deleted");
        Ok(())
    }

    /// Drop terminal sessions whose last update is older than the
    /// retention window. Returns how many were removed.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.retention)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let before = self.sessions.len();
        self.sessions.retain(|_, entry| {
            let status = entry.status.snapshot();
            !(status.is_terminal() && now - status.updated_at > retention)
        });
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            debug!(removed, "purged expired sessions");
        }
        removed
    }
}

/// Periodically purge expired sessions until `shutdown` fires.
pub fn spawn_reaper(
    store: Arc<SessionStore>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(10)));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    store.purge_expired(Utc::now());
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimate::{estimate_resolved, EstimatorConfig};
    use crate::scope::{resolve, AssessmentScope};
    use crate::session::state::channel;

    fn entry() -> (SessionEntry, crate::session::StatusWriter) {
        let id = Uuid::new_v4();
        let scope = resolve(&AssessmentScope::default().controls(["AC-2"])).unwrap();
        let estimate = estimate_resolved(&scope, &EstimatorConfig::default());
        let results = AssessmentResults::new(id, &scope, estimate);
        let (writer, status) = channel(id);
        (
            SessionEntry {
                id,
                created_at: Utc::now(),
                scope: Arc::new(scope),
                status,
                results: Arc::new(RwLock::new(results)),
                cancel: CancellationToken::new(),
            },
            writer,
        )
    }

    #[test]
    fn purge_removes_only_old_terminal_sessions() {
        let store = SessionStore::new(Duration::from_secs(60));
        let (done, done_writer) = entry();
        let (running, _running_writer) = entry();
        done_writer.complete("ok").unwrap();
        store.insert(done.clone());
        store.insert(running.clone());

        assert_eq!(store.purge_expired(Utc::now()), 0);
        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(store.purge_expired(later), 1);
        assert!(store.get(&running.id).is_ok());
        assert!(matches!(store.get(&done.id), Err(SessionError::NotFound(_))));
    }

    #[test]
    fn delete_cancels() {
        let store = SessionStore::new(Duration::from_secs(60));
        let (e, _w) = entry();
        store.insert(e.clone());
        store.delete(&e.id).unwrap();
        assert!(e.cancel.is_cancelled());
        assert!(store.delete(&e.id).is_err());
    }

    #[tokio::test]
    async fn abort_of_finished_session_is_rejected() {
        let store = SessionStore::new(Duration::from_secs(60));
        let (e, w) = entry();
        w.complete("ok").unwrap();
        store.insert(e.clone());
        assert!(matches!(store.abort(&e.id).await, Err(SessionError::Terminal(Stage::Complete))));
    }
}
