use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use runner_proto::{Command, RunnerEvent};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::routes::RunnerAuth;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub runner_id: String,
}

pub async fn runner_socket(
    ws: WebSocketUpgrade,
    _auth: RunnerAuth,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, params.runner_id, state))
}

async fn handle_socket(socket: WebSocket, runner_id: String, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (command_tx, mut command_rx) = mpsc::unbounded_channel::<Command>();
    let (notice_tx, mut notice_rx) = mpsc::unbounded_channel::<String>();

    let generation = state.registry().attach(&runner_id, command_tx);

    let forward_id = runner_id.clone();
    let forwarder = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                command = command_rx.recv() => match command {
                    Some(command) => match serde_json::to_string(&command) {
                        Ok(text) => Message::Text(text),
                        Err(err) => {
                            warn!(runner_id = %forward_id, error = %err, "command not serializable");
                            continue;
                        }
                    },
                    // Registry dropped our sender: a newer socket took over.
                    None => {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                },
                Some(notice) = notice_rx.recv() => {
                    Message::Text(json!({"type": "error", "message": notice}).to_string())
                }
            };
            if sender.send(frame).await.is_err() {
                break;
            }
        }
        debug!(runner_id = %forward_id, "runner forwarder ended");
    });

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                warn!(runner_id = %runner_id, error = %err, "runner socket error");
                break;
            }
        };
        let text = match frame {
            Message::Text(text) => text,
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    let _ = notice_tx.send("binary frame is not UTF-8".into());
                    continue;
                }
            },
            Message::Ping(_) | Message::Pong(_) => {
                state.registry().register_heartbeat(&runner_id);
                continue;
            }
            Message::Close(_) => break,
        };

        match serde_json::from_str::<RunnerEvent>(&text) {
            Ok(event) => {
                state.registry().register_heartbeat(&runner_id);
                debug!(
                    runner_id = %runner_id,
                    event_type = event.kind.as_str(),
                    command_id = event.command_id.as_deref().unwrap_or(""),
                    "runner event"
                );
                state.bus.publish(event).await;
            }
            Err(err) => {
                warn!(runner_id = %runner_id, error = %err, "unparseable runner frame");
                let _ = notice_tx.send(format!("Invalid event format: {err}"));
            }
        }
    }

    if state.registry().detach(&runner_id, generation) {
        info!(runner_id = %runner_id, "runner disconnected");
    }
    forwarder.abort();
}
