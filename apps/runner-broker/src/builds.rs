use runner_proto::{
    CancelBuildPayload, Command, CommandPayload, CommandType, StartBuildPayload, ValidationError,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::BrokerError;
use crate::sessions::{
    detect_operation_type, finish_session, BuildHistory, BuildSession, SessionStatus,
    TransitionOutcome,
};
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct StartBuildRequest {
    pub runner_id: String,
    pub prompt: String,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub selected_element: Option<Value>,
    /// Id of an earlier attempt this build retries.
    #[serde(default)]
    pub retry_of: Option<String>,
}

impl AppState {
    /// Create an `active` session and hand the build to the runner.
    pub async fn start_build(
        &self,
        project_id: &str,
        request: StartBuildRequest,
    ) -> Result<BuildSession, BrokerError> {
        if request.prompt.trim().is_empty() {
            return Err(ValidationError::EmptyField {
                kind: CommandType::StartBuild,
                field: "prompt",
            }
            .into());
        }
        self.registry().resolve_transport(&request.runner_id)?;

        if let Some(active) = self.sessions.active_for_project(project_id).await? {
            return Err(BrokerError::Conflict(format!(
                "project {project_id} already has active session {}",
                active.id
            )));
        }

        let retry_of_status = match request.retry_of.as_deref() {
            Some(previous) => self.sessions.get(previous).await?.map(|s| s.status),
            None => None,
        };
        let project = self.projects.get(project_id).await?;
        let history = BuildHistory {
            selected_element: request.selected_element.is_some(),
            retry_of_status,
            has_completed_session: self.sessions.has_completed(project_id).await?,
            run_command_known: project
                .as_ref()
                .is_some_and(|p| p.run_command.is_some()),
        };
        let operation_type = detect_operation_type(&history);

        let mut session = BuildSession::new(
            project_id,
            &request.runner_id,
            &request.prompt,
            operation_type,
        );
        session.retry_of = request.retry_of;
        let command = Command::for_project(
            project_id,
            CommandPayload::StartBuild(StartBuildPayload {
                prompt: request.prompt,
                session_id: Some(session.id.clone()),
                operation_type: Some(operation_type),
                project_slug: project.map(|p| p.slug),
                agent: request.agent,
                selected_element: request.selected_element,
            }),
        );
        session.command_id = Some(command.id.clone());

        if !self.sessions.insert(session.clone()).await? {
            return Err(BrokerError::Conflict(format!(
                "project {project_id} already has an active session"
            )));
        }

        if let Err(err) = self.bus.dispatch(&request.runner_id, command) {
            warn!(session_id = %session.id, error = %err, "start-build dispatch failed");
            finish_session(
                self.sessions.as_ref(),
                &session.id,
                SessionStatus::Failed,
                Some(format!("Build could not be delivered to the runner: {err}")),
            )
            .await?;
            return Err(err);
        }

        info!(
            session_id = %session.id,
            project_id = %project_id,
            runner_id = %request.runner_id,
            operation_type = operation_type.as_str(),
            "build started"
        );
        Ok(session)
    }

    /// Conditionally cancel. A session that already finished yields
    /// `AlreadyTerminal` carrying the status that won.
    pub async fn cancel_build(
        &self,
        session_id: &str,
        reason: Option<String>,
    ) -> Result<BuildSession, BrokerError> {
        let summary = reason.clone().unwrap_or_else(|| "Cancelled by user".to_string());
        match finish_session(
            self.sessions.as_ref(),
            session_id,
            SessionStatus::Cancelled,
            Some(summary),
        )
        .await?
        {
            TransitionOutcome::Applied(session) => {
                let command = Command::for_project(
                    session.project_id.clone(),
                    CommandPayload::CancelBuild(CancelBuildPayload {
                        session_id: Some(session.id.clone()),
                        reason,
                    }),
                );
                if let Err(err) = self.bus.dispatch(&session.runner_id, command) {
                    warn!(session_id = %session.id, error = %err, "cancel-build not delivered");
                }
                info!(session_id = %session.id, "build cancelled");
                Ok(session)
            }
            TransitionOutcome::AlreadyTerminal(status) => Err(BrokerError::AlreadyTerminal {
                session_id: session_id.to_string(),
                status,
            }),
            TransitionOutcome::NotFound => Err(BrokerError::NotFound(format!("session {session_id}"))),
        }
    }

    pub async fn get_build(&self, session_id: &str) -> Result<BuildSession, BrokerError> {
        self.sessions
            .get(session_id)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("session {session_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::projects::ProjectPatch;
    use runner_proto::{EventKind, OperationType, RunnerEvent};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn request(runner: &str) -> StartBuildRequest {
        StartBuildRequest {
            runner_id: runner.into(),
            prompt: "a landing page".into(),
            agent: None,
            selected_element: None,
            retry_of: None,
        }
    }

    fn state_with_runner() -> (AppState, mpsc::UnboundedReceiver<Command>) {
        let state = AppState::in_memory(AppConfig::default());
        let (tx, rx) = mpsc::unbounded_channel();
        state.registry().attach("r1", tx);
        (state, rx)
    }

    #[tokio::test]
    async fn disconnected_runner_creates_no_session() {
        let state = AppState::in_memory(AppConfig::default());
        let err = state.start_build("p1", request("r1")).await.unwrap_err();
        assert!(matches!(err, BrokerError::RunnerNotConnected(_)));
        assert!(state.sessions.active_for_project("p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn start_build_dispatches_with_session_id() {
        let (state, mut rx) = state_with_runner();
        let session = state.start_build("p1", request("r1")).await.unwrap();
        assert_eq!(session.operation_type, OperationType::InitialBuild);

        let command = rx.recv().await.unwrap();
        assert_eq!(Some(command.id.clone()), session.command_id);
        match command.payload {
            CommandPayload::StartBuild(payload) => {
                assert_eq!(payload.session_id.as_deref(), Some(session.id.as_str()));
                assert_eq!(payload.operation_type, Some(OperationType::InitialBuild));
            }
            other => panic!("unexpected {other:?}"),
        }

        let err = state.start_build("p1", request("r1")).await.unwrap_err();
        assert!(matches!(err, BrokerError::Conflict(_)));
    }

    #[tokio::test]
    async fn history_drives_operation_type() {
        let (state, _rx) = state_with_runner();
        let first = state.start_build("p1", request("r1")).await.unwrap();
        state
            .bus
            .publish(RunnerEvent::new(
                EventKind::BuildFailed,
                Some("p1".into()),
                json!({"sessionId": first.id, "error": "oops"}),
            ))
            .await;

        let mut retry = request("r1");
        retry.retry_of = Some(first.id.clone());
        let second = state.start_build("p1", retry).await.unwrap();
        assert_eq!(second.operation_type, OperationType::Continuation);
        state
            .bus
            .publish(RunnerEvent::new(
                EventKind::BuildCompleted,
                Some("p1".into()),
                json!({"sessionId": second.id, "runCommand": "npm run dev"}),
            ))
            .await;

        let third = state.start_build("p1", request("r1")).await.unwrap();
        assert_eq!(third.operation_type, OperationType::Enhancement);
        state.cancel_build(&third.id, None).await.unwrap();

        let mut focused = request("r1");
        focused.selected_element = Some(json!({"selector": "h1"}));
        let fourth = state.start_build("p1", focused).await.unwrap();
        assert_eq!(fourth.operation_type, OperationType::FocusedEdit);
    }

    #[tokio::test]
    async fn cancel_after_completion_reports_already_completed() {
        let (state, mut rx) = state_with_runner();
        let session = state.start_build("p1", request("r1")).await.unwrap();
        rx.recv().await.unwrap();

        state
            .bus
            .publish(RunnerEvent::new(
                EventKind::BuildCompleted,
                Some("p1".into()),
                json!({"sessionId": session.id, "summary": "shipped"}),
            ))
            .await;

        match state.cancel_build(&session.id, Some("changed my mind".into())).await {
            Err(BrokerError::AlreadyTerminal { status, .. }) => {
                assert_eq!(status, SessionStatus::Completed)
            }
            other => panic!("unexpected {other:?}"),
        }
        let stored = state.get_build(&session.id).await.unwrap();
        assert_eq!(stored.status, SessionStatus::Completed);
        assert_eq!(stored.summary.as_deref(), Some("shipped"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn concurrent_cancel_and_completion_settle_once() {
        let (state, _rx) = state_with_runner();
        let session = state.start_build("p1", request("r1")).await.unwrap();
        let completion = RunnerEvent::new(
            EventKind::BuildCompleted,
            Some("p1".into()),
            json!({"sessionId": session.id}),
        );

        let (cancel, ()) = tokio::join!(
            state.cancel_build(&session.id, None),
            state.bus.publish(completion),
        );
        let stored = state.get_build(&session.id).await.unwrap();
        match cancel {
            Ok(_) => assert_eq!(stored.status, SessionStatus::Cancelled),
            Err(BrokerError::AlreadyTerminal { status, .. }) => {
                assert_eq!(status, SessionStatus::Completed);
                assert_eq!(stored.status, SessionStatus::Completed);
            }
            Err(other) => panic!("unexpected {other}"),
        }
    }

    #[tokio::test]
    async fn cancel_dispatches_to_runner() {
        let (state, mut rx) = state_with_runner();
        let session = state.start_build("p1", request("r1")).await.unwrap();
        rx.recv().await.unwrap();
        let cancelled = state.cancel_build(&session.id, None).await.unwrap();
        assert_eq!(cancelled.status, SessionStatus::Cancelled);
        assert_eq!(rx.recv().await.unwrap().kind(), CommandType::CancelBuild);
        assert!(matches!(
            state.cancel_build("missing", None).await,
            Err(BrokerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn blank_prompt_is_malformed() {
        let (state, _rx) = state_with_runner();
        state
            .projects
            .update("p1", ProjectPatch::default())
            .await
            .unwrap();
        let mut bad = request("r1");
        bad.prompt = "  ".into();
        assert!(matches!(
            state.start_build("p1", bad).await,
            Err(BrokerError::MalformedCommand(_))
        ));
    }
}
