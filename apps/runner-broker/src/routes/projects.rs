use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;

use super::{ApiError, ApiResult};
use crate::dev_server::DevServerReceipt;
use crate::error::BrokerError;
use crate::projects::ProjectState;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterProjectRequest {
    pub slug: String,
}

#[derive(Debug, Deserialize)]
pub struct DevServerRequest {
    pub runner_id: String,
    #[serde(default)]
    pub run_command: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RunnerTarget {
    pub runner_id: String,
}

pub async fn list_projects(State(state): State<AppState>) -> ApiResult<Vec<ProjectState>> {
    let projects = state.projects.list().await.map_err(BrokerError::from)?;
    Ok(Json(projects))
}

pub async fn get_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<ProjectState> {
    Ok(Json(state.get_project(&project_id).await?))
}

pub async fn register_project(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(request): Json<RegisterProjectRequest>,
) -> ApiResult<ProjectState> {
    let slug = request.slug.trim();
    if slug.is_empty() || slug.contains('/') || slug.starts_with('.') {
        return Err(ApiError::BadRequest(format!("invalid slug {:?}", request.slug)));
    }
    let project = state
        .projects
        .register(&project_id, slug)
        .await
        .map_err(BrokerError::from)?;
    Ok(Json(project))
}

pub async fn start_dev_server(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(request): Json<DevServerRequest>,
) -> Result<(StatusCode, Json<DevServerReceipt>), ApiError> {
    let receipt = state
        .start_dev_server(&request.runner_id, &project_id, request.run_command)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

pub async fn stop_dev_server(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(target): Json<RunnerTarget>,
) -> Result<(StatusCode, Json<DevServerReceipt>), ApiError> {
    let receipt = state
        .stop_dev_server(&target.runner_id, &project_id)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

pub async fn start_tunnel(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(target): Json<RunnerTarget>,
) -> Result<(StatusCode, Json<DevServerReceipt>), ApiError> {
    let receipt = state.start_tunnel(&target.runner_id, &project_id).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}

pub async fn stop_tunnel(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(target): Json<RunnerTarget>,
) -> Result<(StatusCode, Json<DevServerReceipt>), ApiError> {
    let receipt = state.stop_tunnel(&target.runner_id, &project_id).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}
