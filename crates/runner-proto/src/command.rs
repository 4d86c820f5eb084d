use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The closed set of instructions a runner understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandType {
    StartBuild,
    StartDevServer,
    StopDevServer,
    StartTunnel,
    StopTunnel,
    CancelBuild,
    ReadFile,
    WriteFile,
    ListFiles,
    GithubPush,
    RunnerHealthCheck,
    FetchLogs,
    DeleteProjectFiles,
}

impl CommandType {
    pub const ALL: [CommandType; 13] = [
        CommandType::StartBuild,
        CommandType::StartDevServer,
        CommandType::StopDevServer,
        CommandType::StartTunnel,
        CommandType::StopTunnel,
        CommandType::CancelBuild,
        CommandType::ReadFile,
        CommandType::WriteFile,
        CommandType::ListFiles,
        CommandType::GithubPush,
        CommandType::RunnerHealthCheck,
        CommandType::FetchLogs,
        CommandType::DeleteProjectFiles,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandType::StartBuild => "start-build",
            CommandType::StartDevServer => "start-dev-server",
            CommandType::StopDevServer => "stop-dev-server",
            CommandType::StartTunnel => "start-tunnel",
            CommandType::StopTunnel => "stop-tunnel",
            CommandType::CancelBuild => "cancel-build",
            CommandType::ReadFile => "read-file",
            CommandType::WriteFile => "write-file",
            CommandType::ListFiles => "list-files",
            CommandType::GithubPush => "github-push",
            CommandType::RunnerHealthCheck => "runner-health-check",
            CommandType::FetchLogs => "fetch-logs",
            CommandType::DeleteProjectFiles => "delete-project-files",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    /// Every command except the runner health check targets a project.
    pub fn is_project_scoped(self) -> bool {
        !matches!(self, CommandType::RunnerHealthCheck)
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a build attempt relates to the project's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationType {
    InitialBuild,
    Enhancement,
    FocusedEdit,
    Continuation,
}

impl OperationType {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationType::InitialBuild => "initial-build",
            OperationType::Enhancement => "enhancement",
            OperationType::FocusedEdit => "focused-edit",
            OperationType::Continuation => "continuation",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "initial-build" => Some(OperationType::InitialBuild),
            "enhancement" => Some(OperationType::Enhancement),
            "focused-edit" => Some(OperationType::FocusedEdit),
            "continuation" => Some(OperationType::Continuation),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartBuildPayload {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_type: Option<OperationType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Element-scoped edit target picked in the preview.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_element: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartDevServerPayload {
    pub run_command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartTunnelPayload {
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopTunnelPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelBuildPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadFilePayload {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteFilePayload {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListFilesPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubPushPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchLogsPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lines: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteProjectFilesPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
}

/// Typed payload, tagged on the wire as `{"type": "...", "payload": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum CommandPayload {
    StartBuild(StartBuildPayload),
    StartDevServer(StartDevServerPayload),
    StopDevServer,
    StartTunnel(StartTunnelPayload),
    StopTunnel(StopTunnelPayload),
    CancelBuild(CancelBuildPayload),
    ReadFile(ReadFilePayload),
    WriteFile(WriteFilePayload),
    ListFiles(ListFilesPayload),
    GithubPush(GithubPushPayload),
    RunnerHealthCheck,
    FetchLogs(FetchLogsPayload),
    DeleteProjectFiles(DeleteProjectFilesPayload),
}

impl CommandPayload {
    pub fn kind(&self) -> CommandType {
        match self {
            CommandPayload::StartBuild(_) => CommandType::StartBuild,
            CommandPayload::StartDevServer(_) => CommandType::StartDevServer,
            CommandPayload::StopDevServer => CommandType::StopDevServer,
            CommandPayload::StartTunnel(_) => CommandType::StartTunnel,
            CommandPayload::StopTunnel(_) => CommandType::StopTunnel,
            CommandPayload::CancelBuild(_) => CommandType::CancelBuild,
            CommandPayload::ReadFile(_) => CommandType::ReadFile,
            CommandPayload::WriteFile(_) => CommandType::WriteFile,
            CommandPayload::ListFiles(_) => CommandType::ListFiles,
            CommandPayload::GithubPush(_) => CommandType::GithubPush,
            CommandPayload::RunnerHealthCheck => CommandType::RunnerHealthCheck,
            CommandPayload::FetchLogs(_) => CommandType::FetchLogs,
            CommandPayload::DeleteProjectFiles(_) => CommandType::DeleteProjectFiles,
        }
    }
}

/// A uniquely identified instruction for one runner. Sent once; callers own retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: CommandPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("command id must not be empty")]
    MissingId,
    #[error("{0} requires a projectId")]
    MissingProject(CommandType),
    #[error("{kind} requires a non-empty {field}")]
    EmptyField {
        kind: CommandType,
        field: &'static str,
    },
    #[error("{0} requires a non-zero port")]
    InvalidPort(CommandType),
}

impl Command {
    /// Build a command with a fresh id and the current timestamp.
    pub fn new(project_id: Option<String>, payload: CommandPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            project_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn for_project(project_id: impl Into<String>, payload: CommandPayload) -> Self {
        Self::new(Some(project_id.into()), payload)
    }

    pub fn kind(&self) -> CommandType {
        self.payload.kind()
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.trim().is_empty() {
            return Err(ValidationError::MissingId);
        }
        let kind = self.kind();
        let has_project = self
            .project_id
            .as_deref()
            .is_some_and(|id| !id.trim().is_empty());
        if kind.is_project_scoped() && !has_project {
            return Err(ValidationError::MissingProject(kind));
        }
        match &self.payload {
            CommandPayload::StartBuild(p) if p.prompt.trim().is_empty() => {
                Err(ValidationError::EmptyField { kind, field: "prompt" })
            }
            CommandPayload::StartDevServer(p) if p.run_command.trim().is_empty() => {
                Err(ValidationError::EmptyField {
                    kind,
                    field: "runCommand",
                })
            }
            CommandPayload::StartDevServer(StartDevServerPayload { port: Some(0), .. }) => {
                Err(ValidationError::InvalidPort(kind))
            }
            CommandPayload::StartTunnel(p) if p.port == 0 => Err(ValidationError::InvalidPort(kind)),
            CommandPayload::ReadFile(p) if p.path.trim().is_empty() => {
                Err(ValidationError::EmptyField { kind, field: "path" })
            }
            CommandPayload::WriteFile(p) if p.path.trim().is_empty() => {
                Err(ValidationError::EmptyField { kind, field: "path" })
            }
            _ => Ok(()),
        }
    }
}
