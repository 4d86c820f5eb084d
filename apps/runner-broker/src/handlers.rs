use std::sync::Arc;

use async_trait::async_trait;
use runner_proto::{
    BuildCompletedPayload, BuildFailedPayload, EventKind, LogChunkPayload, PortDetectedPayload,
    ProcessExitedPayload, RunnerEvent, TodoUpdatePayload, ToolStartPayload, ToolUpdatePayload,
    TunnelCreatedPayload,
};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::bus::EventHandler;
use crate::error::StoreError;
use crate::logs::LogBuffer;
use crate::ports::PortAllocator;
use crate::projects::{DevServerStatus, ProjectPatch, ProjectStore};
use crate::sessions::{
    finish_session, BuildSession, SessionStatus, SessionStore, TransitionOutcome,
};

fn decode<T: DeserializeOwned>(event: &RunnerEvent) -> Option<T> {
    match event.payload_as::<T>() {
        Ok(payload) => Some(payload),
        Err(err) => {
            warn!(
                event_type = %event.kind,
                project_id = ?event.project_id,
                error = %err,
                "dropping event with malformed payload"
            );
            None
        }
    }
}

/// Applies build progress and terminal events to sessions.
pub struct SessionEvents {
    sessions: Arc<dyn SessionStore>,
}

impl SessionEvents {
    pub fn new(sessions: Arc<dyn SessionStore>) -> Self {
        Self { sessions }
    }

    async fn locate(&self, event: &RunnerEvent) -> Result<Option<BuildSession>, StoreError> {
        if let Some(session_id) = event.session_id() {
            return self.sessions.get(session_id).await;
        }
        match event.project_id.as_deref() {
            Some(project_id) => self.sessions.active_for_project(project_id).await,
            None => Ok(None),
        }
    }

    async fn apply(&self, event: &RunnerEvent) -> Result<(), StoreError> {
        let Some(mut session) = self.locate(event).await? else {
            debug!(event_type = %event.kind, project_id = ?event.project_id, "no session for build event");
            return Ok(());
        };

        match event.kind {
            EventKind::BuildCompleted => {
                let payload: BuildCompletedPayload = decode(event).unwrap_or_default();
                self.finish(&session, SessionStatus::Completed, payload.summary)
                    .await
            }
            EventKind::BuildFailed => {
                let payload: BuildFailedPayload = decode(event).unwrap_or_default();
                let summary = payload.error.or_else(|| event.error_message());
                self.finish(&session, SessionStatus::Failed, summary).await
            }
            _ if !session.is_active() => {
                debug!(session_id = %session.id, event_type = %event.kind, "progress for finished session ignored");
                Ok(())
            }
            EventKind::TodoUpdate => {
                let Some(payload) = decode::<TodoUpdatePayload>(event) else {
                    return Ok(());
                };
                session.replace_todos(payload.todos);
                self.sessions.save_progress(&session).await.map(|_| ())
            }
            EventKind::ToolStart => {
                let Some(payload) = decode::<ToolStartPayload>(event) else {
                    return Ok(());
                };
                match session.start_tool(payload) {
                    Ok(()) => self.sessions.save_progress(&session).await.map(|_| ()),
                    Err(rejection) => {
                        warn!(session_id = %session.id, %rejection, "tool-start dropped");
                        Ok(())
                    }
                }
            }
            EventKind::ToolUpdate => {
                let Some(payload) = decode::<ToolUpdatePayload>(event) else {
                    return Ok(());
                };
                match session.update_tool(payload) {
                    Ok(()) => self.sessions.save_progress(&session).await.map(|_| ()),
                    Err(rejection) => {
                        warn!(session_id = %session.id, %rejection, "tool-update dropped");
                        Ok(())
                    }
                }
            }
            _ => Ok(()),
        }
    }

    async fn finish(
        &self,
        session: &BuildSession,
        to: SessionStatus,
        summary: Option<String>,
    ) -> Result<(), StoreError> {
        match finish_session(self.sessions.as_ref(), &session.id, to, summary).await? {
            TransitionOutcome::Applied(_) => {
                info!(session_id = %session.id, project_id = %session.project_id, status = %to, "build session finished");
            }
            TransitionOutcome::AlreadyTerminal(current) => {
                warn!(
                    session_id = %session.id,
                    status = %current,
                    reported = %to,
                    "stale terminal event ignored"
                );
            }
            TransitionOutcome::NotFound => {}
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for SessionEvents {
    fn name(&self) -> &'static str {
        "session-events"
    }

    async fn handle(&self, event: &RunnerEvent) {
        if !matches!(
            event.kind,
            EventKind::TodoUpdate
                | EventKind::ToolStart
                | EventKind::ToolUpdate
                | EventKind::BuildCompleted
                | EventKind::BuildFailed
        ) {
            return;
        }
        if let Err(err) = self.apply(event).await {
            warn!(event_type = %event.kind, error = %err, "session update failed");
        }
    }
}

/// Keeps project dev-server fields, port leases and log buffers in step with
/// what the runner reports.
pub struct ProjectLifecycle {
    projects: Arc<dyn ProjectStore>,
    ports: Arc<PortAllocator>,
    logs: LogBuffer,
}

impl ProjectLifecycle {
    pub fn new(projects: Arc<dyn ProjectStore>, ports: Arc<PortAllocator>, logs: LogBuffer) -> Self {
        Self {
            projects,
            ports,
            logs,
        }
    }

    async fn apply(&self, project_id: &str, event: &RunnerEvent) -> Result<(), StoreError> {
        match event.kind {
            EventKind::LogChunk => {
                if let Some(chunk) = decode::<LogChunkPayload>(event) {
                    self.logs.append(project_id, chunk.stream, chunk.data);
                }
            }
            EventKind::PortDetected => {
                let Some(payload) = decode::<PortDetectedPayload>(event) else {
                    return Ok(());
                };
                if !self.ports.confirm(project_id, payload.port) {
                    self.ports.release_project(project_id);
                    self.projects
                        .update(
                            project_id,
                            ProjectPatch::default()
                                .status(DevServerStatus::Failed)
                                .port(None),
                        )
                        .await?;
                    warn!(
                        project_id = %project_id,
                        port = payload.port,
                        "dev server bound a port leased to another project"
                    );
                    return Ok(());
                }
                self.projects
                    .update(
                        project_id,
                        ProjectPatch::default()
                            .status(DevServerStatus::Running)
                            .port(Some(payload.port)),
                    )
                    .await?;
                info!(project_id = %project_id, port = payload.port, "dev server running");
            }
            EventKind::TunnelCreated => {
                if let Some(payload) = decode::<TunnelCreatedPayload>(event) {
                    self.projects
                        .update(
                            project_id,
                            ProjectPatch::default().tunnel_url(Some(payload.tunnel_url)),
                        )
                        .await?;
                }
            }
            EventKind::TunnelClosed => {
                self.projects
                    .update(project_id, ProjectPatch::default().tunnel_url(None))
                    .await?;
            }
            EventKind::ProcessExited => {
                let payload: ProcessExitedPayload = decode(event).unwrap_or_default();
                let status = if payload.is_failure() {
                    DevServerStatus::Failed
                } else {
                    DevServerStatus::Stopped
                };
                self.ports.release_project(project_id);
                self.projects
                    .update(
                        project_id,
                        ProjectPatch::default()
                            .status(status)
                            .port(None)
                            .tunnel_url(None),
                    )
                    .await?;
                self.logs.mark_exit(project_id, &payload);
                info!(project_id = %project_id, exit_code = ?payload.exit_code, "dev server exited");
            }
            EventKind::BuildCompleted => {
                let payload: BuildCompletedPayload = decode(event).unwrap_or_default();
                if let Some(run_command) = payload.run_command {
                    self.projects
                        .update(
                            project_id,
                            ProjectPatch::default().run_command(Some(run_command)),
                        )
                        .await?;
                }
            }
            _ => {}
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for ProjectLifecycle {
    fn name(&self) -> &'static str {
        "project-lifecycle"
    }

    async fn handle(&self, event: &RunnerEvent) {
        let Some(project_id) = event.project_id.as_deref() else {
            return;
        };
        if let Err(err) = self.apply(project_id, event).await {
            warn!(project_id = %project_id, event_type = %event.kind, error = %err, "project update failed");
        }
    }
}
