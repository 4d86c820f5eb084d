use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use runner_proto::{OperationType, TodoItem};
use sqlx::{types::Json, FromRow, PgPool};

use super::store::{SessionStore, TransitionOutcome};
use super::{BuildSession, SessionStatus, ToolCall};
use crate::error::StoreError;

const SESSION_COLUMNS: &str = "id, project_id, runner_id, status, operation_type, prompt, \
    command_id, retry_of, todos, tools_by_todo, summary, started_at, ended_at";

#[derive(Debug, FromRow)]
struct SessionRow {
    id: String,
    project_id: String,
    runner_id: String,
    status: String,
    operation_type: String,
    prompt: String,
    command_id: Option<String>,
    retry_of: Option<String>,
    todos: Json<Vec<TodoItem>>,
    tools_by_todo: Json<BTreeMap<usize, Vec<ToolCall>>>,
    summary: Option<String>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
}

impl TryFrom<SessionRow> for BuildSession {
    type Error = StoreError;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        Ok(BuildSession {
            status: parse_status(&row.status)?,
            operation_type: OperationType::parse(&row.operation_type).ok_or_else(|| {
                StoreError::Corrupt(format!("operation_type {}", row.operation_type))
            })?,
            id: row.id,
            project_id: row.project_id,
            runner_id: row.runner_id,
            prompt: row.prompt,
            command_id: row.command_id,
            retry_of: row.retry_of,
            todos: row.todos.0,
            tools_by_todo: row.tools_by_todo.0,
            summary: row.summary,
            started_at: row.started_at,
            ended_at: row.ended_at,
        })
    }
}

fn parse_status(raw: &str) -> Result<SessionStatus, StoreError> {
    SessionStatus::parse(raw).ok_or_else(|| StoreError::Corrupt(format!("session status {raw}")))
}

/// Session rows in Postgres. The terminal transition is a single conditional UPDATE.
pub struct PostgresSessionStore {
    pool: PgPool,
}

impl PostgresSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_one_where(
        &self,
        clause: &str,
        value: &str,
    ) -> Result<Option<BuildSession>, StoreError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM build_sessions WHERE {clause}");
        let row: Option<SessionRow> = sqlx::query_as(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?;
        row.map(BuildSession::try_from).transpose()
    }
}

#[async_trait]
impl SessionStore for PostgresSessionStore {
    async fn insert(&self, session: BuildSession) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO build_sessions (
                id, project_id, runner_id, status, operation_type, prompt,
                command_id, retry_of, todos, tools_by_todo, summary, started_at, ended_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&session.id)
        .bind(&session.project_id)
        .bind(&session.runner_id)
        .bind(session.status.as_str())
        .bind(session.operation_type.as_str())
        .bind(&session.prompt)
        .bind(&session.command_id)
        .bind(&session.retry_of)
        .bind(Json(&session.todos))
        .bind(Json(&session.tools_by_todo))
        .bind(&session.summary)
        .bind(session.started_at)
        .bind(session.ended_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, session_id: &str) -> Result<Option<BuildSession>, StoreError> {
        self.fetch_one_where("id = $1", session_id).await
    }

    async fn active_for_project(
        &self,
        project_id: &str,
    ) -> Result<Option<BuildSession>, StoreError> {
        self.fetch_one_where("project_id = $1 AND status = 'active'", project_id)
            .await
    }

    async fn has_completed(&self, project_id: &str) -> Result<bool, StoreError> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM build_sessions WHERE project_id = $1 AND status = 'completed'
            )
            "#,
        )
        .bind(project_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn save_progress(&self, session: &BuildSession) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE build_sessions
            SET todos = $2, tools_by_todo = $3
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(&session.id)
        .bind(Json(&session.todos))
        .bind(Json(&session.tools_by_todo))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn transition_if_active(
        &self,
        session_id: &str,
        to: SessionStatus,
        summary: Option<String>,
    ) -> Result<TransitionOutcome, StoreError> {
        let sql = format!(
            r#"
            UPDATE build_sessions
            SET status = $2, ended_at = NOW(), summary = COALESCE($3, summary)
            WHERE id = $1 AND status = 'active'
            RETURNING {SESSION_COLUMNS}
            "#
        );
        let updated: Option<SessionRow> = sqlx::query_as(&sql)
            .bind(session_id)
            .bind(to.as_str())
            .bind(summary)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = updated {
            return Ok(TransitionOutcome::Applied(BuildSession::try_from(row)?));
        }

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM build_sessions WHERE id = $1")
                .bind(session_id)
                .fetch_optional(&self.pool)
                .await?;
        match current {
            Some(raw) => Ok(TransitionOutcome::AlreadyTerminal(parse_status(&raw)?)),
            None => Ok(TransitionOutcome::NotFound),
        }
    }

    async fn active_started_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<BuildSession>, StoreError> {
        let sql = format!(
            "SELECT {SESSION_COLUMNS} FROM build_sessions \
             WHERE status = 'active' AND started_at < $1 ORDER BY started_at ASC"
        );
        let rows: Vec<SessionRow> = sqlx::query_as(&sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(BuildSession::try_from).collect()
    }
}
