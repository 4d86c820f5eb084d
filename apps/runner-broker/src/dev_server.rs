use std::collections::HashMap;

use runner_proto::{
    Command, CommandPayload, CommandType, StartDevServerPayload, StartTunnelPayload,
    StopTunnelPayload, ValidationError,
};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::BrokerError;
use crate::projects::{DevServerStatus, ProjectPatch, ProjectState};
use crate::state::AppState;

/// What the broker sent and the project fields it recorded alongside.
#[derive(Debug, Clone, Serialize)]
pub struct DevServerReceipt {
    pub command_id: String,
    pub project: ProjectState,
}

impl AppState {
    /// Lease a port, mark the project `starting`, and ask the runner to start the
    /// server. If the runner cannot be reached the lease and status are rolled back.
    pub async fn start_dev_server(
        &self,
        runner_id: &str,
        project_id: &str,
        run_command: Option<String>,
    ) -> Result<DevServerReceipt, BrokerError> {
        self.registry().resolve_transport(runner_id)?;
        let known = self
            .projects
            .get(project_id)
            .await?
            .and_then(|p| p.run_command);
        let run_command = run_command
            .or(known)
            .filter(|c| !c.trim().is_empty())
            .ok_or(ValidationError::EmptyField {
                kind: CommandType::StartDevServer,
                field: "runCommand",
            })?;

        let port = self.ports.allocate(project_id).await?;
        self.projects
            .update(
                project_id,
                ProjectPatch::default()
                    .status(DevServerStatus::Starting)
                    .port(Some(port)),
            )
            .await?;

        let mut env = HashMap::new();
        env.insert("PORT".to_string(), port.to_string());
        let command = Command::for_project(
            project_id,
            CommandPayload::StartDevServer(StartDevServerPayload {
                run_command,
                working_directory: None,
                port: Some(port),
                env,
            }),
        );
        let command_id = command.id.clone();
        if let Err(err) = self.bus.dispatch(runner_id, command) {
            warn!(project_id = %project_id, port, error = %err, "start-dev-server dispatch failed");
            self.ports.release(port);
            self.projects
                .update(
                    project_id,
                    ProjectPatch::default()
                        .status(DevServerStatus::Stopped)
                        .port(None),
                )
                .await?;
            return Err(err);
        }

        info!(project_id = %project_id, runner_id = %runner_id, port, "dev server starting");
        let project = self.project_or_default(project_id).await?;
        Ok(DevServerReceipt {
            command_id,
            project,
        })
    }

    pub async fn stop_dev_server(
        &self,
        runner_id: &str,
        project_id: &str,
    ) -> Result<DevServerReceipt, BrokerError> {
        let command = Command::for_project(project_id, CommandPayload::StopDevServer);
        let command_id = command.id.clone();
        self.bus.dispatch(runner_id, command)?;
        let project = self
            .projects
            .update(
                project_id,
                ProjectPatch::default().status(DevServerStatus::Stopping),
            )
            .await?;
        Ok(DevServerReceipt {
            command_id,
            project,
        })
    }

    pub async fn start_tunnel(
        &self,
        runner_id: &str,
        project_id: &str,
    ) -> Result<DevServerReceipt, BrokerError> {
        let project = self.project_or_default(project_id).await?;
        let Some(port) = project.port else {
            return Err(BrokerError::Conflict(format!(
                "project {project_id} has no dev server port to tunnel"
            )));
        };
        let command = Command::for_project(
            project_id,
            CommandPayload::StartTunnel(StartTunnelPayload { port }),
        );
        let command_id = command.id.clone();
        self.bus.dispatch(runner_id, command)?;
        Ok(DevServerReceipt {
            command_id,
            project,
        })
    }

    pub async fn stop_tunnel(
        &self,
        runner_id: &str,
        project_id: &str,
    ) -> Result<DevServerReceipt, BrokerError> {
        let project = self.project_or_default(project_id).await?;
        let command = Command::for_project(
            project_id,
            CommandPayload::StopTunnel(StopTunnelPayload { port: project.port }),
        );
        let command_id = command.id.clone();
        self.bus.dispatch(runner_id, command)?;
        Ok(DevServerReceipt {
            command_id,
            project,
        })
    }

    pub async fn get_project(&self, project_id: &str) -> Result<ProjectState, BrokerError> {
        self.projects
            .get(project_id)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("project {project_id}")))
    }

    async fn project_or_default(&self, project_id: &str) -> Result<ProjectState, BrokerError> {
        Ok(self
            .projects
            .get(project_id)
            .await?
            .unwrap_or_else(|| ProjectState::new(project_id, project_id)))
    }
}
