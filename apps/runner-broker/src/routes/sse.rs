use std::convert::Infallible;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures_core::Stream;
use futures_util::stream;
use runner_proto::EventKind;
use serde_json::json;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use super::ApiResult;
use crate::logs::{ExitMarker, LogEntry, LogFrame, LogSubscription};
use crate::state::AppState;

pub async fn recent_logs(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> ApiResult<Vec<LogEntry>> {
    Ok(Json(state.logs.snapshot(&project_id)))
}

/// Buffered output first, then live lines. An exit frame ends the stream.
pub async fn stream_logs(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut subscription = state.logs.subscribe(&project_id);
    let mut replay: Vec<Result<Event, Infallible>> = subscription
        .backlog
        .drain(..)
        .map(|entry| Ok(entry_event(&entry)))
        .collect();
    let live = match subscription.exited.take() {
        Some(exit) => {
            replay.push(Ok(exit_event(&exit)));
            None
        }
        None => Some(subscription),
    };

    let live = stream::unfold(live, |live: Option<LogSubscription>| async move {
        let mut subscription = live?;
        match subscription.next_frame().await? {
            LogFrame::Entry(entry) => {
                Some((Ok::<_, Infallible>(entry_event(&entry)), Some(subscription)))
            }
            LogFrame::Exit(exit) => Some((Ok(exit_event(&exit)), None)),
        }
    });

    Sse::new(tokio_stream::iter(replay).chain(live)).keep_alive(KeepAlive::default())
}

/// Session and dev-server events for one project. Log lines have their own stream.
pub async fn stream_project_events(
    State(state): State<AppState>,
    Path(project_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.bus.subscribe_project(&project_id);
    let stream = BroadcastStream::new(rx)
        .filter_map(|msg| msg.ok())
        .filter(|event| event.kind != EventKind::LogChunk)
        .map(|event| {
            let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".into());
            Ok(Event::default().event(event.kind.as_str()).data(data))
        });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn entry_event(entry: &LogEntry) -> Event {
    let data = json!({
        "type": "log",
        "stream": entry.stream.as_str(),
        "data": entry.data,
        "timestamp": entry.timestamp,
    });
    Event::default().event("log").data(data.to_string())
}

fn exit_event(exit: &ExitMarker) -> Event {
    let data = json!({
        "type": "exit",
        "exitCode": exit.exit_code,
        "signal": exit.signal,
        "timestamp": exit.timestamp,
    });
    Event::default().event("exit").data(data.to_string())
}
