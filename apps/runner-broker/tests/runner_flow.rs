use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use runner_broker::{
    bus::any_reply,
    builds::StartBuildRequest,
    config::AppConfig,
    error::BrokerError,
    projects::DevServerStatus,
    routes::build_router,
    sessions::SessionStatus,
    state::AppState,
};
use runner_proto::{Command, CommandPayload, CommandType};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};

const SECRET: &str = "integration-secret";

type RunnerSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn spawn_broker(config: AppConfig) -> (AppState, String) {
    let state = AppState::in_memory(AppConfig {
        runner_shared_secret: Some(SECRET.into()),
        ..config
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service()).await.unwrap();
    });
    (state, format!("ws://{addr}"))
}

async fn connect_runner(state: &AppState, base: &str, runner_id: &str) -> RunnerSocket {
    let mut request = format!("{base}/runners/connect?runner_id={runner_id}")
        .into_client_request()
        .unwrap();
    request.headers_mut().insert(
        "authorization",
        HeaderValue::from_str(&format!("Bearer {SECRET}")).unwrap(),
    );
    let (socket, _) = connect_async(request).await.unwrap();
    for _ in 0..100 {
        if state.registry().resolve_transport(runner_id).is_ok() {
            return socket;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("runner {runner_id} never attached");
}

async fn next_command(socket: &mut RunnerSocket) -> Command {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("command frame")
            .expect("socket open")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send_event(socket: &mut RunnerSocket, event: serde_json::Value) {
    socket.send(Message::Text(event.to_string())).await.unwrap();
}

async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn connect_without_secret_is_rejected() {
    let (_state, base) = spawn_broker(AppConfig::default()).await;
    let result = connect_async(format!("{base}/runners/connect?runner_id=r1")).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn request_resolves_with_runner_reply() {
    let (state, base) = spawn_broker(AppConfig::default()).await;
    let mut runner = connect_runner(&state, &base, "r1").await;

    let bus = state.bus.clone();
    let pending = tokio::spawn(async move {
        bus.request(
            "r1",
            Command::new(None, CommandPayload::RunnerHealthCheck),
            any_reply(),
            Duration::from_secs(5),
        )
        .await
    });

    let command = next_command(&mut runner).await;
    assert_eq!(command.kind(), CommandType::RunnerHealthCheck);
    send_event(
        &mut runner,
        json!({"type": "ack", "commandId": command.id}),
    )
    .await;
    send_event(
        &mut runner,
        json!({"type": "health-check-result", "commandId": command.id, "payload": {"ok": true}}),
    )
    .await;

    let reply = pending.await.unwrap().unwrap();
    assert_eq!(reply.kind.as_str(), "health-check-result");
    assert_eq!(reply.payload["ok"], true);
    assert_eq!(state.bus.pending_count(), 0);
}

#[tokio::test]
async fn runner_error_reply_fails_the_request() {
    let (state, base) = spawn_broker(AppConfig::default()).await;
    let mut runner = connect_runner(&state, &base, "r1").await;

    let bus = state.bus.clone();
    let pending = tokio::spawn(async move {
        bus.request(
            "r1",
            Command::for_project(
                "p1",
                CommandPayload::ReadFile(runner_proto::ReadFilePayload {
                    path: "missing.txt".into(),
                }),
            ),
            any_reply(),
            Duration::from_secs(5),
        )
        .await
    });
    let command = next_command(&mut runner).await;
    send_event(
        &mut runner,
        json!({"type": "error", "commandId": command.id, "projectId": "p1", "payload": {"message": "ENOENT"}}),
    )
    .await;

    match pending.await.unwrap() {
        Err(BrokerError::CommandFailed { message, .. }) => assert!(message.contains("ENOENT")),
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn garbage_frame_gets_error_reply_and_socket_survives() {
    let (state, base) = spawn_broker(AppConfig::default()).await;
    let mut runner = connect_runner(&state, &base, "r1").await;

    runner.send(Message::Text("not json".into())).await.unwrap();
    let frame = tokio::time::timeout(Duration::from_secs(5), runner.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let value: serde_json::Value = serde_json::from_str(frame.to_text().unwrap()).unwrap();
    assert_eq!(value["type"], "error");
    assert!(state.registry().resolve_transport("r1").is_ok());
}

#[tokio::test]
async fn dev_server_reaches_running_after_port_detected() {
    let vacated = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = vacated.local_addr().unwrap().port();
    drop(vacated);
    let (state, base) = spawn_broker(AppConfig {
        port_range_start: port,
        port_range_end: port,
        ..AppConfig::default()
    })
    .await;
    let mut runner = connect_runner(&state, &base, "r1").await;

    let receipt = state
        .start_dev_server("r1", "p1", Some("npm run dev".into()))
        .await
        .unwrap();
    assert_eq!(receipt.project.port, Some(port));

    let command = next_command(&mut runner).await;
    match &command.payload {
        CommandPayload::StartDevServer(payload) => {
            assert_eq!(payload.env.get("PORT"), Some(&port.to_string()));
        }
        other => panic!("unexpected {other:?}"),
    }

    send_event(
        &mut runner,
        json!({"type": "log-chunk", "projectId": "p1", "payload": {"stream": "stdout", "data": "ready"}}),
    )
    .await;
    send_event(
        &mut runner,
        json!({"type": "port-detected", "commandId": command.id, "projectId": "p1", "payload": {"port": port}}),
    )
    .await;

    eventually(|| {
        let state = state.clone();
        async move {
            state
                .get_project("p1")
                .await
                .map(|p| p.dev_server_status == DevServerStatus::Running)
                .unwrap_or(false)
        }
    })
    .await;
    assert_eq!(state.logs.snapshot("p1")[0].data, "ready");

    send_event(
        &mut runner,
        json!({"type": "process-exited", "projectId": "p1", "payload": {"exitCode": 0}}),
    )
    .await;
    eventually(|| {
        let state = state.clone();
        async move {
            state
                .get_project("p1")
                .await
                .map(|p| p.dev_server_status == DevServerStatus::Stopped && p.port.is_none())
                .unwrap_or(false)
        }
    })
    .await;
    assert!(state.ports.reservations().is_empty());
}

#[tokio::test]
async fn completion_after_cancel_is_ignored() {
    let (state, base) = spawn_broker(AppConfig::default()).await;
    let mut runner = connect_runner(&state, &base, "r1").await;

    let session = state
        .start_build(
            "p1",
            StartBuildRequest {
                runner_id: "r1".into(),
                prompt: "a blog".into(),
                agent: None,
                selected_element: None,
                retry_of: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(next_command(&mut runner).await.kind(), CommandType::StartBuild);

    let cancelled = state.cancel_build(&session.id, None).await.unwrap();
    assert_eq!(cancelled.status, SessionStatus::Cancelled);
    assert_eq!(next_command(&mut runner).await.kind(), CommandType::CancelBuild);

    send_event(
        &mut runner,
        json!({"type": "build-completed", "projectId": "p1", "payload": {"sessionId": session.id, "summary": "late"}}),
    )
    .await;
    // A marker event on the same project is handled after the completion.
    send_event(
        &mut runner,
        json!({"type": "log-chunk", "projectId": "p1", "payload": {"data": "marker"}}),
    )
    .await;
    eventually(|| {
        let state = state.clone();
        async move { !state.logs.snapshot("p1").is_empty() }
    })
    .await;

    let stored = state.get_build(&session.id).await.unwrap();
    assert_eq!(stored.status, SessionStatus::Cancelled);
    assert_ne!(stored.summary.as_deref(), Some("late"));
}

#[tokio::test]
async fn reconnect_replaces_socket_and_old_close_keeps_new_link() {
    let (state, base) = spawn_broker(AppConfig::default()).await;
    let first = connect_runner(&state, &base, "r1").await;
    let generation = state.registry().resolve_transport("r1").unwrap().generation();

    let mut second = connect_runner(&state, &base, "r1").await;
    eventually(|| {
        let state = state.clone();
        async move {
            state
                .registry()
                .resolve_transport("r1")
                .map(|link| link.generation() != generation)
                .unwrap_or(false)
        }
    })
    .await;

    drop(first);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(state.registry().resolve_transport("r1").is_ok());

    state
        .bus
        .dispatch("r1", Command::new(None, CommandPayload::RunnerHealthCheck))
        .unwrap();
    assert_eq!(
        next_command(&mut second).await.kind(),
        CommandType::RunnerHealthCheck
    );
}
