//! Build sessions: one tracked build attempt per project and the race-safe
//! terminal transition that closes it.

mod postgres;
mod store;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use runner_proto::{OperationType, TodoItem, ToolStartPayload, ToolState, ToolUpdatePayload};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use postgres::PostgresSessionStore;
pub use store::{InMemorySessionStore, SessionStore, TransitionOutcome};

use crate::error::StoreError;
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Cancelled,
    Failed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(SessionStatus::Active),
            "completed" => Some(SessionStatus::Completed),
            "cancelled" => Some(SessionStatus::Cancelled),
            "failed" => Some(SessionStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != SessionStatus::Active
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
    pub state: ToolState,
    #[serde(default)]
    pub output: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildSession {
    pub id: String,
    pub project_id: String,
    pub runner_id: String,
    pub status: SessionStatus,
    pub operation_type: OperationType,
    pub prompt: String,
    pub command_id: Option<String>,
    pub retry_of: Option<String>,
    pub todos: Vec<TodoItem>,
    pub tools_by_todo: BTreeMap<usize, Vec<ToolCall>>,
    pub summary: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Why a tool event could not be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolRejection {
    TodoOutOfRange { index: usize, todos: usize },
    UnknownTool { index: usize, tool_id: String },
}

impl fmt::Display for ToolRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolRejection::TodoOutOfRange { index, todos } => {
                write!(f, "todo index {index} out of range ({todos} todos)")
            }
            ToolRejection::UnknownTool { index, tool_id } => {
                write!(f, "tool {tool_id} not started under todo {index}")
            }
        }
    }
}

impl BuildSession {
    pub fn new(
        project_id: impl Into<String>,
        runner_id: impl Into<String>,
        prompt: impl Into<String>,
        operation_type: OperationType,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            runner_id: runner_id.into(),
            status: SessionStatus::Active,
            operation_type,
            prompt: prompt.into(),
            command_id: None,
            retry_of: None,
            todos: Vec::new(),
            tools_by_todo: BTreeMap::new(),
            summary: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Last writer wins; tool records are keyed by index and left as they are.
    pub fn replace_todos(&mut self, todos: Vec<TodoItem>) {
        self.todos = todos;
    }

    pub fn start_tool(&mut self, payload: ToolStartPayload) -> Result<(), ToolRejection> {
        self.check_index(payload.todo_index)?;
        let now = Utc::now();
        self.tools_by_todo
            .entry(payload.todo_index)
            .or_default()
            .push(ToolCall {
                tool_id: payload.tool_id,
                name: payload.name,
                input: payload.input,
                state: ToolState::Running,
                output: None,
                started_at: now,
                updated_at: now,
            });
        Ok(())
    }

    pub fn update_tool(&mut self, payload: ToolUpdatePayload) -> Result<(), ToolRejection> {
        self.check_index(payload.todo_index)?;
        let call = self
            .tools_by_todo
            .get_mut(&payload.todo_index)
            .and_then(|calls| calls.iter_mut().rev().find(|c| c.tool_id == payload.tool_id))
            .ok_or_else(|| ToolRejection::UnknownTool {
                index: payload.todo_index,
                tool_id: payload.tool_id.clone(),
            })?;
        call.state = payload.state;
        if payload.output.is_some() {
            call.output = payload.output;
        }
        call.updated_at = Utc::now();
        Ok(())
    }

    fn check_index(&self, index: usize) -> Result<(), ToolRejection> {
        if index < self.todos.len() {
            Ok(())
        } else {
            Err(ToolRejection::TodoOutOfRange {
                index,
                todos: self.todos.len(),
            })
        }
    }
}

/// History consulted when a new build starts.
#[derive(Debug, Clone, Default)]
pub struct BuildHistory {
    pub selected_element: bool,
    pub retry_of_status: Option<SessionStatus>,
    pub has_completed_session: bool,
    pub run_command_known: bool,
}

pub fn detect_operation_type(history: &BuildHistory) -> OperationType {
    if history.selected_element {
        OperationType::FocusedEdit
    } else if history.retry_of_status == Some(SessionStatus::Failed) {
        OperationType::Continuation
    } else if history.has_completed_session && history.run_command_known {
        OperationType::Enhancement
    } else {
        OperationType::InitialBuild
    }
}

/// Conditional terminal transition, counted by target status and outcome.
pub async fn finish_session(
    store: &dyn SessionStore,
    session_id: &str,
    to: SessionStatus,
    summary: Option<String>,
) -> Result<TransitionOutcome, StoreError> {
    let outcome = store.transition_if_active(session_id, to, summary).await?;
    let label = match &outcome {
        TransitionOutcome::Applied(_) => "applied",
        TransitionOutcome::AlreadyTerminal(_) => "already_terminal",
        TransitionOutcome::NotFound => "not_found",
    };
    metrics::SESSION_TRANSITIONS
        .with_label_values(&[to.as_str(), label])
        .inc();
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_proto::TodoStatus;
    use serde_json::json;

    fn todo(content: &str) -> TodoItem {
        TodoItem {
            content: content.into(),
            active_form: format!("{content}ing"),
            status: TodoStatus::Pending,
        }
    }

    fn session_with_todos(n: usize) -> BuildSession {
        let mut session = BuildSession::new("p1", "r1", "make a blog", OperationType::InitialBuild);
        session.replace_todos((0..n).map(|i| todo(&format!("step {i}"))).collect());
        session
    }

    #[test]
    fn todo_update_replaces_list() {
        let mut session = session_with_todos(3);
        session.replace_todos(vec![todo("only")]);
        assert_eq!(session.todos.len(), 1);
        assert_eq!(session.todos[0].content, "only");
    }

    #[test]
    fn tools_attach_under_their_todo_and_update_in_place() {
        let mut session = session_with_todos(2);
        session
            .start_tool(ToolStartPayload {
                todo_index: 1,
                tool_id: "t1".into(),
                name: "Write".into(),
                input: json!({"path": "index.html"}),
            })
            .unwrap();
        session
            .update_tool(ToolUpdatePayload {
                todo_index: 1,
                tool_id: "t1".into(),
                state: ToolState::Completed,
                output: Some(json!("ok")),
            })
            .unwrap();

        let calls = &session.tools_by_todo[&1];
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].state, ToolState::Completed);
        assert_eq!(calls[0].output, Some(json!("ok")));
        assert!(!session.tools_by_todo.contains_key(&0));
    }

    #[test]
    fn out_of_range_tool_events_are_rejected_without_mutation() {
        let mut session = session_with_todos(1);
        let err = session
            .start_tool(ToolStartPayload {
                todo_index: 4,
                tool_id: "t1".into(),
                name: "Bash".into(),
                input: Value::Null,
            })
            .unwrap_err();
        assert_eq!(err, ToolRejection::TodoOutOfRange { index: 4, todos: 1 });
        assert!(session.tools_by_todo.is_empty());

        let err = session
            .update_tool(ToolUpdatePayload {
                todo_index: 0,
                tool_id: "nope".into(),
                state: ToolState::Failed,
                output: None,
            })
            .unwrap_err();
        assert!(matches!(err, ToolRejection::UnknownTool { .. }));
    }

    #[test]
    fn operation_type_detection_order() {
        let mut history = BuildHistory::default();
        assert_eq!(detect_operation_type(&history), OperationType::InitialBuild);

        history.has_completed_session = true;
        assert_eq!(detect_operation_type(&history), OperationType::InitialBuild);
        history.run_command_known = true;
        assert_eq!(detect_operation_type(&history), OperationType::Enhancement);

        history.retry_of_status = Some(SessionStatus::Completed);
        assert_eq!(detect_operation_type(&history), OperationType::Enhancement);
        history.retry_of_status = Some(SessionStatus::Failed);
        assert_eq!(detect_operation_type(&history), OperationType::Continuation);

        history.selected_element = true;
        assert_eq!(detect_operation_type(&history), OperationType::FocusedEdit);
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            SessionStatus::Active,
            SessionStatus::Completed,
            SessionStatus::Cancelled,
            SessionStatus::Failed,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        assert!(!SessionStatus::Active.is_terminal());
        assert!(SessionStatus::Cancelled.is_terminal());
    }
}
