use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use tokio::sync::Mutex;

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DevServerStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl DevServerStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DevServerStatus::Stopped => "stopped",
            DevServerStatus::Starting => "starting",
            DevServerStatus::Running => "running",
            DevServerStatus::Stopping => "stopping",
            DevServerStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stopped" => Some(DevServerStatus::Stopped),
            "starting" => Some(DevServerStatus::Starting),
            "running" => Some(DevServerStatus::Running),
            "stopping" => Some(DevServerStatus::Stopping),
            "failed" => Some(DevServerStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for DevServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status fields the broker writes for each project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectState {
    pub id: String,
    pub slug: String,
    pub dev_server_status: DevServerStatus,
    pub port: Option<u16>,
    pub tunnel_url: Option<String>,
    pub run_command: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProjectState {
    pub fn new(id: impl Into<String>, slug: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            slug: slug.into(),
            dev_server_status: DevServerStatus::Stopped,
            port: None,
            tunnel_url: None,
            run_command: None,
            updated_at: Utc::now(),
        }
    }
}

/// Partial update. `Some(None)` clears a nullable field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectPatch {
    pub dev_server_status: Option<DevServerStatus>,
    pub port: Option<Option<u16>>,
    pub tunnel_url: Option<Option<String>>,
    pub run_command: Option<Option<String>>,
}

impl ProjectPatch {
    pub fn status(mut self, status: DevServerStatus) -> Self {
        self.dev_server_status = Some(status);
        self
    }

    pub fn port(mut self, port: Option<u16>) -> Self {
        self.port = Some(port);
        self
    }

    pub fn tunnel_url(mut self, url: Option<String>) -> Self {
        self.tunnel_url = Some(url);
        self
    }

    pub fn run_command(mut self, command: Option<String>) -> Self {
        self.run_command = Some(command);
        self
    }

    fn apply(self, project: &mut ProjectState) {
        if let Some(status) = self.dev_server_status {
            project.dev_server_status = status;
        }
        if let Some(port) = self.port {
            project.port = port;
        }
        if let Some(url) = self.tunnel_url {
            project.tunnel_url = url;
        }
        if let Some(command) = self.run_command {
            project.run_command = command;
        }
        project.updated_at = Utc::now();
    }
}

/// Point lookups and updates by id; nothing else is asked of the backing store.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn get(&self, project_id: &str) -> Result<Option<ProjectState>, StoreError>;

    /// Create or rename a project.
    async fn register(&self, project_id: &str, slug: &str) -> Result<ProjectState, StoreError>;

    /// Apply `patch`, creating the row (slug = id) when the project is unknown.
    async fn update(
        &self,
        project_id: &str,
        patch: ProjectPatch,
    ) -> Result<ProjectState, StoreError>;

    async fn list(&self) -> Result<Vec<ProjectState>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryProjectStore {
    projects: Mutex<HashMap<String, ProjectState>>,
}

impl InMemoryProjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ProjectStore for InMemoryProjectStore {
    async fn get(&self, project_id: &str) -> Result<Option<ProjectState>, StoreError> {
        Ok(self.projects.lock().await.get(project_id).cloned())
    }

    async fn register(&self, project_id: &str, slug: &str) -> Result<ProjectState, StoreError> {
        let mut guard = self.projects.lock().await;
        let project = guard
            .entry(project_id.to_string())
            .or_insert_with(|| ProjectState::new(project_id, slug));
        project.slug = slug.to_string();
        project.updated_at = Utc::now();
        Ok(project.clone())
    }

    async fn update(
        &self,
        project_id: &str,
        patch: ProjectPatch,
    ) -> Result<ProjectState, StoreError> {
        let mut guard = self.projects.lock().await;
        let project = guard
            .entry(project_id.to_string())
            .or_insert_with(|| ProjectState::new(project_id, project_id));
        patch.apply(project);
        Ok(project.clone())
    }

    async fn list(&self) -> Result<Vec<ProjectState>, StoreError> {
        let mut projects: Vec<_> = self.projects.lock().await.values().cloned().collect();
        projects.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(projects)
    }
}

#[derive(Debug, FromRow)]
struct ProjectRow {
    id: String,
    slug: String,
    dev_server_status: String,
    port: Option<i32>,
    tunnel_url: Option<String>,
    run_command: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<ProjectRow> for ProjectState {
    type Error = StoreError;

    fn try_from(row: ProjectRow) -> Result<Self, Self::Error> {
        let dev_server_status = DevServerStatus::parse(&row.dev_server_status).ok_or_else(|| {
            StoreError::Corrupt(format!("dev_server_status {}", row.dev_server_status))
        })?;
        let port = row
            .port
            .map(|p| u16::try_from(p).map_err(|_| StoreError::Corrupt(format!("port {p}"))))
            .transpose()?;
        Ok(ProjectState {
            id: row.id,
            slug: row.slug,
            dev_server_status,
            port,
            tunnel_url: row.tunnel_url,
            run_command: row.run_command,
            updated_at: row.updated_at,
        })
    }
}

pub struct PostgresProjectStore {
    pool: PgPool,
}

impl PostgresProjectStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn write(
        &self,
        executor: &mut sqlx::PgConnection,
        project: &ProjectState,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO projects (id, slug, dev_server_status, port, tunnel_url, run_command, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                slug = EXCLUDED.slug,
                dev_server_status = EXCLUDED.dev_server_status,
                port = EXCLUDED.port,
                tunnel_url = EXCLUDED.tunnel_url,
                run_command = EXCLUDED.run_command,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&project.id)
        .bind(&project.slug)
        .bind(project.dev_server_status.as_str())
        .bind(project.port.map(i32::from))
        .bind(&project.tunnel_url)
        .bind(&project.run_command)
        .bind(project.updated_at)
        .execute(executor)
        .await?;
        Ok(())
    }

    async fn locked(
        executor: &mut sqlx::PgConnection,
        project_id: &str,
    ) -> Result<Option<ProjectState>, StoreError> {
        let row: Option<ProjectRow> = sqlx::query_as(
            r#"
            SELECT id, slug, dev_server_status, port, tunnel_url, run_command, updated_at
            FROM projects WHERE id = $1 FOR UPDATE
            "#,
        )
        .bind(project_id)
        .fetch_optional(executor)
        .await?;
        row.map(ProjectState::try_from).transpose()
    }
}

#[async_trait]
impl ProjectStore for PostgresProjectStore {
    async fn get(&self, project_id: &str) -> Result<Option<ProjectState>, StoreError> {
        let row: Option<ProjectRow> = sqlx::query_as(
            r#"
            SELECT id, slug, dev_server_status, port, tunnel_url, run_command, updated_at
            FROM projects WHERE id = $1
            "#,
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ProjectState::try_from).transpose()
    }

    async fn register(&self, project_id: &str, slug: &str) -> Result<ProjectState, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut project = Self::locked(tx.as_mut(), project_id)
            .await?
            .unwrap_or_else(|| ProjectState::new(project_id, slug));
        project.slug = slug.to_string();
        project.updated_at = Utc::now();
        self.write(tx.as_mut(), &project).await?;
        tx.commit().await?;
        Ok(project)
    }

    async fn update(
        &self,
        project_id: &str,
        patch: ProjectPatch,
    ) -> Result<ProjectState, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut project = Self::locked(tx.as_mut(), project_id)
            .await?
            .unwrap_or_else(|| ProjectState::new(project_id, project_id));
        patch.apply(&mut project);
        self.write(tx.as_mut(), &project).await?;
        tx.commit().await?;
        Ok(project)
    }

    async fn list(&self) -> Result<Vec<ProjectState>, StoreError> {
        let rows: Vec<ProjectRow> = sqlx::query_as(
            r#"
            SELECT id, slug, dev_server_status, port, tunnel_url, run_command, updated_at
            FROM projects ORDER BY slug ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ProjectState::try_from).collect()
    }
}
