use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{BuildSession, SessionStatus};
use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(BuildSession),
    AlreadyTerminal(SessionStatus),
    NotFound,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Persist a new `active` session. Returns `false` when the project already
    /// has one.
    async fn insert(&self, session: BuildSession) -> Result<bool, StoreError>;

    async fn get(&self, session_id: &str) -> Result<Option<BuildSession>, StoreError>;

    async fn active_for_project(&self, project_id: &str)
        -> Result<Option<BuildSession>, StoreError>;

    async fn has_completed(&self, project_id: &str) -> Result<bool, StoreError>;

    /// Store todos and tool activity. Ignored (returns `false`) once the session
    /// has left `active`.
    async fn save_progress(&self, session: &BuildSession) -> Result<bool, StoreError>;

    /// Compare-and-set out of `active`. The first terminal write wins; later
    /// attempts observe [`TransitionOutcome::AlreadyTerminal`].
    async fn transition_if_active(
        &self,
        session_id: &str,
        to: SessionStatus,
        summary: Option<String>,
    ) -> Result<TransitionOutcome, StoreError>;

    async fn active_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<BuildSession>, StoreError>;
}

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: Mutex<HashMap<String, BuildSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert(&self, session: BuildSession) -> Result<bool, StoreError> {
        let mut guard = self.sessions.lock().await;
        let busy = guard
            .values()
            .any(|s| s.project_id == session.project_id && s.is_active());
        if busy {
            return Ok(false);
        }
        guard.insert(session.id.clone(), session);
        Ok(true)
    }

    async fn get(&self, session_id: &str) -> Result<Option<BuildSession>, StoreError> {
        Ok(self.sessions.lock().await.get(session_id).cloned())
    }

    async fn active_for_project(
        &self,
        project_id: &str,
    ) -> Result<Option<BuildSession>, StoreError> {
        Ok(self
            .sessions
            .lock()
            .await
            .values()
            .find(|s| s.project_id == project_id && s.is_active())
            .cloned())
    }

    async fn has_completed(&self, project_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .sessions
            .lock()
            .await
            .values()
            .any(|s| s.project_id == project_id && s.status == SessionStatus::Completed))
    }

    async fn save_progress(&self, session: &BuildSession) -> Result<bool, StoreError> {
        let mut guard = self.sessions.lock().await;
        match guard.get_mut(&session.id) {
            Some(stored) if stored.is_active() => {
                stored.todos = session.todos.clone();
                stored.tools_by_todo = session.tools_by_todo.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn transition_if_active(
        &self,
        session_id: &str,
        to: SessionStatus,
        summary: Option<String>,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut guard = self.sessions.lock().await;
        let Some(stored) = guard.get_mut(session_id) else {
            return Ok(TransitionOutcome::NotFound);
        };
        if stored.status.is_terminal() {
            return Ok(TransitionOutcome::AlreadyTerminal(stored.status));
        }
        stored.status = to;
        stored.ended_at = Some(Utc::now());
        if summary.is_some() {
            stored.summary = summary;
        }
        Ok(TransitionOutcome::Applied(stored.clone()))
    }

    async fn active_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<BuildSession>, StoreError> {
        let mut stale: Vec<BuildSession> = self
            .sessions
            .lock()
            .await
            .values()
            .filter(|s| s.is_active() && s.started_at < cutoff)
            .cloned()
            .collect();
        stale.sort_by_key(|s| s.started_at);
        Ok(stale)
    }
}
