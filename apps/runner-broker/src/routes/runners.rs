use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use runner_proto::RunnerEvent;
use serde::Deserialize;
use tracing::debug;

use super::{ApiResult, RunnerAuth};
use crate::registry::ConnectedRunner;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ListRunnersQuery {
    pub max_age_ms: Option<u64>,
}

pub async fn list_runners(
    State(state): State<AppState>,
    Query(query): Query<ListRunnersQuery>,
) -> ApiResult<Vec<ConnectedRunner>> {
    let max_age = query.max_age_ms.map(Duration::from_millis);
    Ok(Json(state.registry().list_connected(max_age)))
}

pub async fn heartbeat(
    _auth: RunnerAuth,
    State(state): State<AppState>,
    Path(runner_id): Path<String>,
) -> StatusCode {
    state.registry().register_heartbeat(&runner_id);
    StatusCode::NO_CONTENT
}

/// HTTP fallback for runners that post events instead of holding a socket.
pub async fn ingest_event(
    _auth: RunnerAuth,
    State(state): State<AppState>,
    Path(runner_id): Path<String>,
    Json(event): Json<RunnerEvent>,
) -> StatusCode {
    debug!(runner_id = %runner_id, event_type = event.kind.as_str(), "event via http");
    state.registry().register_heartbeat(&runner_id);
    state.bus.publish(event).await;
    StatusCode::ACCEPTED
}
