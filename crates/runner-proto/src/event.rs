use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kinds of messages a runner emits. Unrecognized kinds are kept verbatim in
/// [`EventKind::Unknown`] so newer runners never break ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    RunnerStatus,
    Ack,
    LogChunk,
    PortDetected,
    TunnelCreated,
    TunnelClosed,
    ProcessExited,
    BuildProgress,
    BuildCompleted,
    BuildFailed,
    TodoUpdate,
    ToolStart,
    ToolUpdate,
    FileContent,
    FileWritten,
    FilesListed,
    FilesDeleted,
    LogsFetched,
    HealthCheckResult,
    GithubPushResult,
    Error,
    Unknown(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::RunnerStatus => "runner-status",
            EventKind::Ack => "ack",
            EventKind::LogChunk => "log-chunk",
            EventKind::PortDetected => "port-detected",
            EventKind::TunnelCreated => "tunnel-created",
            EventKind::TunnelClosed => "tunnel-closed",
            EventKind::ProcessExited => "process-exited",
            EventKind::BuildProgress => "build-progress",
            EventKind::BuildCompleted => "build-completed",
            EventKind::BuildFailed => "build-failed",
            EventKind::TodoUpdate => "todo-update",
            EventKind::ToolStart => "tool-start",
            EventKind::ToolUpdate => "tool-update",
            EventKind::FileContent => "file-content",
            EventKind::FileWritten => "file-written",
            EventKind::FilesListed => "files-listed",
            EventKind::FilesDeleted => "files-deleted",
            EventKind::LogsFetched => "logs-fetched",
            EventKind::HealthCheckResult => "health-check-result",
            EventKind::GithubPushResult => "github-push-result",
            EventKind::Error => "error",
            EventKind::Unknown(raw) => raw,
        }
    }

    /// Label used for metrics so arbitrary runner strings never become label values.
    pub fn metric_label(&self) -> &str {
        match self {
            EventKind::Unknown(_) => "unknown",
            other => other.as_str(),
        }
    }

    pub fn is_terminal_build(&self) -> bool {
        matches!(self, EventKind::BuildCompleted | EventKind::BuildFailed)
    }
}

impl From<String> for EventKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "runner-status" => EventKind::RunnerStatus,
            "ack" => EventKind::Ack,
            "log-chunk" => EventKind::LogChunk,
            "port-detected" => EventKind::PortDetected,
            "tunnel-created" => EventKind::TunnelCreated,
            "tunnel-closed" => EventKind::TunnelClosed,
            "process-exited" => EventKind::ProcessExited,
            "build-progress" => EventKind::BuildProgress,
            "build-completed" => EventKind::BuildCompleted,
            "build-failed" => EventKind::BuildFailed,
            "todo-update" => EventKind::TodoUpdate,
            "tool-start" => EventKind::ToolStart,
            "tool-update" => EventKind::ToolUpdate,
            "file-content" => EventKind::FileContent,
            "file-written" => EventKind::FileWritten,
            "files-listed" => EventKind::FilesListed,
            "files-deleted" => EventKind::FilesDeleted,
            "logs-fetched" => EventKind::LogsFetched,
            "health-check-result" => EventKind::HealthCheckResult,
            "github-push-result" => EventKind::GithubPushResult,
            "error" => EventKind::Error,
            _ => EventKind::Unknown(value),
        }
    }
}

impl From<&str> for EventKind {
    fn from(value: &str) -> Self {
        EventKind::from(value.to_string())
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Unknown(raw) => raw,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message emitted by a runner, optionally correlated to a command id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
}

impl RunnerEvent {
    pub fn new(kind: EventKind, project_id: Option<String>, payload: Value) -> Self {
        Self {
            kind,
            command_id: None,
            project_id,
            timestamp: Utc::now(),
            payload,
        }
    }

    pub fn reply_to(mut self, command_id: impl Into<String>) -> Self {
        self.command_id = Some(command_id.into());
        self
    }

    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }

    /// Error text carried by the event, if any. `error` events always count as
    /// failures; other kinds only when their payload has an `error` field.
    pub fn error_message(&self) -> Option<String> {
        let from_field = match self.payload.get("error") {
            Some(Value::String(message)) => Some(message.clone()),
            Some(Value::Object(map)) => Some(
                map.get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| Value::Object(map.clone()).to_string()),
            ),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };
        match (&self.kind, from_field) {
            (_, Some(message)) => Some(message),
            (EventKind::Error, None) => Some(
                self.payload
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("runner reported an error")
                    .to_string(),
            ),
            _ => None,
        }
    }

    /// Session id carried in the payload, used to route build events.
    pub fn session_id(&self) -> Option<&str> {
        self.payload.get("sessionId").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerStatusPayload {
    #[serde(default)]
    pub runner_id: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub active_builds: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogChunkPayload {
    #[serde(default = "default_stream")]
    pub stream: LogStream,
    pub data: String,
}

fn default_stream() -> LogStream {
    LogStream::Stdout
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortDetectedPayload {
    pub port: u16,
    #[serde(default)]
    pub framework: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelCreatedPayload {
    #[serde(default)]
    pub port: Option<u16>,
    pub tunnel_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessExitedPayload {
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub signal: Option<String>,
}

impl ProcessExitedPayload {
    pub fn is_failure(&self) -> bool {
        matches!(self.exit_code, Some(code) if code != 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoItem {
    pub content: String,
    #[serde(default)]
    pub active_form: String,
    pub status: TodoStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoUpdatePayload {
    pub todos: Vec<TodoItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolState {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStartPayload {
    pub todo_index: usize,
    pub tool_id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUpdatePayload {
    pub todo_index: usize,
    pub tool_id: String,
    pub state: ToolState,
    #[serde(default)]
    pub output: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildCompletedPayload {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub run_command: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildFailedPayload {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}
