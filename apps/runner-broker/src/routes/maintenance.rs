use std::path::Path;

use axum::{extract::State, Json};
use serde::Deserialize;

use super::{ApiError, ApiResult};
use crate::reconcile::{self as drift, ReconcileReport};
use crate::state::AppState;
use crate::sweep::{self, SweepReport};

#[derive(Debug, Default, Deserialize)]
pub struct SweepRequest {
    pub max_age_minutes: Option<u64>,
}

pub async fn cleanup_stuck_sessions(
    State(state): State<AppState>,
    body: Option<Json<SweepRequest>>,
) -> ApiResult<SweepReport> {
    let max_age = body
        .and_then(|Json(b)| b.max_age_minutes)
        .unwrap_or(state.config.stuck_session_max_age_minutes);
    let report = sweep::cleanup_stuck_sessions(state.sessions.as_ref(), max_age).await?;
    Ok(Json(report))
}

pub async fn reconcile(State(state): State<AppState>) -> ApiResult<ReconcileReport> {
    let root = state
        .config
        .workspace_root
        .as_deref()
        .ok_or_else(|| ApiError::Conflict("workspace_root is not configured".into()))?;
    let report = drift::reconcile(Path::new(root), state.projects.as_ref()).await?;
    Ok(Json(report))
}
