use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use super::{ApiError, ApiResult};
use crate::builds::StartBuildRequest;
use crate::error::BrokerError;
use crate::sessions::BuildSession;
use crate::state::AppState;

pub async fn start_build(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
    Json(request): Json<StartBuildRequest>,
) -> Result<(StatusCode, Json<BuildSession>), ApiError> {
    let session = state.start_build(&project_id, request).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn get_build(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<BuildSession> {
    Ok(Json(state.get_build(&session_id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    outcome: String,
    session: Option<BuildSession>,
}

/// Cancelling a session that already finished is not an error for the caller;
/// the body names the status that won.
pub async fn cancel_build(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    body: Option<Json<CancelRequest>>,
) -> Result<Response, ApiError> {
    let reason = body.and_then(|Json(b)| b.reason);
    let response = match state.cancel_build(&session_id, reason).await {
        Ok(session) => CancelResponse {
            outcome: "cancelled".into(),
            session: Some(session),
        },
        Err(BrokerError::AlreadyTerminal { status, .. }) => CancelResponse {
            outcome: format!("already_{status}"),
            session: state.get_build(&session_id).await.ok(),
        },
        Err(err) => return Err(err.into()),
    };
    Ok((StatusCode::OK, Json(response)).into_response())
}
