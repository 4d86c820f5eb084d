use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use runner_proto::{Command, RunnerEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{ApiError, ApiResult};
use crate::bus::any_reply;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct CommandAccepted {
    pub command_id: String,
}

/// Commands may omit `id`; the broker fills one in so callers can correlate later.
fn parse_command(mut raw: Value) -> Result<Command, ApiError> {
    if let Some(obj) = raw.as_object_mut() {
        let missing = obj
            .get("id")
            .and_then(Value::as_str)
            .map_or(true, |id| id.trim().is_empty());
        if missing {
            obj.insert("id".into(), Value::String(Uuid::new_v4().to_string()));
        }
    }
    serde_json::from_value(raw).map_err(|err| ApiError::BadRequest(err.to_string()))
}

pub async fn send_command(
    State(state): State<AppState>,
    Path(runner_id): Path<String>,
    Json(raw): Json<Value>,
) -> Result<(StatusCode, Json<CommandAccepted>), ApiError> {
    let command = parse_command(raw)?;
    let command_id = command.id.clone();
    state.bus.dispatch(&runner_id, command)?;
    Ok((StatusCode::ACCEPTED, Json(CommandAccepted { command_id })))
}

#[derive(Debug, Default, Deserialize)]
pub struct RequestQuery {
    pub timeout_ms: Option<u64>,
}

/// Dispatch and hold the HTTP request open until the runner's reply arrives.
pub async fn request_command(
    State(state): State<AppState>,
    Path(runner_id): Path<String>,
    Query(query): Query<RequestQuery>,
    Json(raw): Json<Value>,
) -> ApiResult<RunnerEvent> {
    let command = parse_command(raw)?;
    let timeout = query
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| state.config.command_timeout());
    let event = state
        .bus
        .request(&runner_id, command, any_reply(), timeout)
        .await?;
    Ok(Json(event))
}
