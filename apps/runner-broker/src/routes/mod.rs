mod auth;
mod builds;
mod commands;
mod maintenance;
mod projects;
mod runners;
mod sse;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::error;

use crate::error::BrokerError;
use crate::metrics;
use crate::state::AppState;
use crate::websocket;

pub use auth::RunnerAuth;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/readyz", get(ready))
        .route("/metrics", get(prometheus_metrics))
        .route("/runners", get(runners::list_runners))
        .route("/runners/connect", get(websocket::runner_socket))
        .route("/runners/:runner_id/heartbeat", post(runners::heartbeat))
        .route("/runners/:runner_id/events", post(runners::ingest_event))
        .route("/runners/:runner_id/commands", post(commands::send_command))
        .route("/runners/:runner_id/requests", post(commands::request_command))
        .route("/projects", get(projects::list_projects))
        .route(
            "/projects/:project_id",
            get(projects::get_project).put(projects::register_project),
        )
        .route("/projects/:project_id/builds", post(builds::start_build))
        .route(
            "/projects/:project_id/dev-server/start",
            post(projects::start_dev_server),
        )
        .route(
            "/projects/:project_id/dev-server/stop",
            post(projects::stop_dev_server),
        )
        .route("/projects/:project_id/tunnel/start", post(projects::start_tunnel))
        .route("/projects/:project_id/tunnel/stop", post(projects::stop_tunnel))
        .route("/projects/:project_id/logs", get(sse::recent_logs))
        .route("/projects/:project_id/logs/stream", get(sse::stream_logs))
        .route("/projects/:project_id/events", get(sse::stream_project_events))
        .route("/builds/:session_id", get(builds::get_build))
        .route("/builds/:session_id/cancel", post(builds::cancel_build))
        .route(
            "/maintenance/stuck-sessions",
            post(maintenance::cleanup_stuck_sessions),
        )
        .route("/maintenance/reconcile", post(maintenance::reconcile))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    backend: &'static str,
    runners_connected: usize,
    pending_replies: usize,
}

async fn ready(State(state): State<AppState>) -> Result<Json<ReadyResponse>, ApiError> {
    state.check_ready().await.map_err(BrokerError::from)?;
    Ok(Json(ReadyResponse {
        status: "ok",
        backend: state.backend_name(),
        runners_connected: state.registry().list_connected(None).len(),
        pending_replies: state.bus.pending_count(),
    }))
}

async fn prometheus_metrics() -> Response {
    (
        [(
            axum::http::header::CONTENT_TYPE,
            prometheus::TEXT_FORMAT,
        )],
        metrics::gather(),
    )
        .into_response()
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    TooManyRequests(String),
    Unavailable(String),
    BadGateway(String),
    GatewayTimeout(String),
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ApiErrorBody<'a> {
    error: &'a str,
    message: Option<String>,
}

impl ApiError {
    fn parts(self) -> (StatusCode, &'static str, Option<String>) {
        match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized", None),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", Some(msg)),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "not_found", Some(msg)),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "conflict", Some(msg)),
            ApiError::TooManyRequests(msg) => {
                (StatusCode::TOO_MANY_REQUESTS, "backpressure", Some(msg))
            }
            ApiError::Unavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "unavailable", Some(msg))
            }
            ApiError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, "command_failed", Some(msg)),
            ApiError::GatewayTimeout(msg) => {
                (StatusCode::GATEWAY_TIMEOUT, "outcome_unknown", Some(msg))
            }
            ApiError::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", Some(msg))
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, message) = self.parts();
        (status, Json(ApiErrorBody { error, message })).into_response()
    }
}

impl From<BrokerError> for ApiError {
    fn from(err: BrokerError) -> Self {
        let message = err.to_string();
        match err {
            BrokerError::MalformedCommand(_) | BrokerError::InvalidRequest(_) => {
                ApiError::BadRequest(message)
            }
            BrokerError::NotFound(_) => ApiError::NotFound(message),
            BrokerError::Conflict(_) | BrokerError::AlreadyTerminal { .. } => {
                ApiError::Conflict(message)
            }
            BrokerError::RunnerNotConnected(_) | BrokerError::NoPortsAvailable { .. } => {
                ApiError::Unavailable(message)
            }
            BrokerError::CorrelationTimeout { .. } => ApiError::GatewayTimeout(message),
            BrokerError::CommandFailed { .. } => ApiError::BadGateway(message),
            BrokerError::Backpressure(_) => ApiError::TooManyRequests(message),
            BrokerError::Workspace(_) | BrokerError::Store(_) => {
                error!(error = %message, "request failed");
                ApiError::Internal(message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use axum::{
        body::{self, Body},
        http::Request,
    };
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    fn app() -> (AppState, Router) {
        let state = AppState::in_memory(AppConfig {
            runner_shared_secret: Some("s3cret".into()),
            ..AppConfig::default()
        });
        (state.clone(), build_router(state))
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn post(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn runner_post(uri: &str, body: Value, token: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn ingestion_requires_the_shared_secret() {
        let (_state, app) = app();
        let (status, _) = send(&app, post("/runners/r1/heartbeat", json!({}))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = send(&app, runner_post("/runners/r1/heartbeat", json!({}), "nope")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) =
            send(&app, runner_post("/runners/r1/heartbeat", json!({}), "s3cret")).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(
            &app,
            Request::builder()
                .uri("/runners")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["runner_id"], "r1");
        assert_eq!(body[0]["attached"], false);
    }

    #[tokio::test]
    async fn command_to_heartbeat_only_runner_is_unavailable() {
        let (_state, app) = app();
        send(&app, runner_post("/runners/r1/heartbeat", json!({}), "s3cret")).await;
        let (status, body) = send(
            &app,
            post(
                "/runners/r1/commands",
                json!({"type": "read-file", "projectId": "p1", "payload": {"path": "a.txt"}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "unavailable");
    }

    #[tokio::test]
    async fn malformed_commands_are_bad_requests() {
        let (state, app) = app();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        state.registry().attach("r1", tx);

        let (status, _) = send(
            &app,
            post("/runners/r1/commands", json!({"type": "launch-rockets"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = send(
            &app,
            post(
                "/runners/r1/commands",
                json!({"type": "read-file", "payload": {"path": "a.txt"}}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "bad_request");

        let (status, body) = send(
            &app,
            post(
                "/runners/r1/commands",
                json!({"type": "runner-health-check"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert!(body["command_id"].is_string());
    }

    #[tokio::test]
    async fn cancel_of_finished_build_reports_outcome() {
        let (state, app) = app();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        state.registry().attach("r1", tx);

        let (status, session) = send(
            &app,
            post(
                "/projects/p1/builds",
                json!({"runner_id": "r1", "prompt": "a todo app"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let session_id = session["id"].as_str().unwrap().to_string();

        let (status, _) = send(
            &app,
            runner_post(
                "/runners/r1/events",
                json!({"type": "build-completed", "projectId": "p1", "payload": {"sessionId": session_id}}),
                "s3cret",
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let (status, body) = send(
            &app,
            post(&format!("/builds/{session_id}/cancel"), json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "already_completed");

        let (status, body) = send(
            &app,
            Request::builder()
                .uri(format!("/builds/{session_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "completed");
    }

    #[tokio::test]
    async fn missing_resources_are_not_found() {
        let (_state, app) = app();
        let (status, _) = send(
            &app,
            Request::builder()
                .uri("/builds/nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = send(
            &app,
            Request::builder()
                .uri("/projects/nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn readiness_and_metrics_respond() {
        let (_state, app) = app();
        let (status, body) = send(
            &app,
            Request::builder()
                .uri("/readyz")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["backend"], "memory");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn broker_errors_map_to_statuses() {
        let cases = [
            (
                BrokerError::RunnerNotConnected("r1".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                BrokerError::CorrelationTimeout {
                    command_id: "c1".into(),
                    timeout: std::time::Duration::from_secs(1),
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                BrokerError::NoPortsAvailable {
                    start: 3101,
                    end: 3200,
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                BrokerError::CommandFailed {
                    command_id: "c1".into(),
                    message: "ENOENT".into(),
                },
                StatusCode::BAD_GATEWAY,
            ),
            (
                BrokerError::Backpressure("r1".into()),
                StatusCode::TOO_MANY_REQUESTS,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).into_response().status(), expected);
        }
    }
}
