use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use runner_proto::{LogStream, ProcessExitedPayload};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    pub stream: LogStream,
    pub data: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExitMarker {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LogFrame {
    Entry(LogEntry),
    Exit(ExitMarker),
}

#[derive(Default)]
struct ProjectLog {
    entries: VecDeque<LogEntry>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<LogFrame>>,
    exited: Option<ExitMarker>,
}

impl ProjectLog {
    fn fan_out(&mut self, frame: &LogFrame) {
        self.subscribers
            .retain(|_, tx| tx.send(frame.clone()).is_ok());
    }
}

struct LogInner {
    capacity: usize,
    projects: Mutex<HashMap<String, ProjectLog>>,
    next_subscriber: AtomicU64,
}

impl LogInner {
    fn projects(&self) -> MutexGuard<'_, HashMap<String, ProjectLog>> {
        self.projects.lock()
    }
}

/// Bounded per-project output buffer with live subscribers.
#[derive(Clone)]
pub struct LogBuffer {
    inner: Arc<LogInner>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(LogInner {
                capacity: capacity.max(1),
                projects: Mutex::new(HashMap::new()),
                next_subscriber: AtomicU64::new(1),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn append(&self, project_id: &str, stream: LogStream, data: impl Into<String>) {
        let entry = LogEntry {
            stream,
            data: data.into(),
            timestamp: Utc::now(),
        };
        let mut projects = self.inner.projects();
        let log = projects.entry(project_id.to_string()).or_default();
        log.exited = None;
        log.entries.push_back(entry.clone());
        while log.entries.len() > self.inner.capacity {
            log.entries.pop_front();
        }
        log.fan_out(&LogFrame::Entry(entry));
    }

    /// Emit the terminal marker. Subscribers should close after receiving it.
    pub fn mark_exit(&self, project_id: &str, payload: &ProcessExitedPayload) {
        let marker = ExitMarker {
            exit_code: payload.exit_code,
            signal: payload.signal.clone(),
            timestamp: Utc::now(),
        };
        let mut projects = self.inner.projects();
        let log = projects.entry(project_id.to_string()).or_default();
        log.exited = Some(marker.clone());
        log.fan_out(&LogFrame::Exit(marker));
        trace!(project_id = %project_id, "log exit marker emitted");
    }

    /// Snapshot the buffer and start live delivery atomically: nothing appended
    /// after the snapshot is missed, nothing in it is delivered twice.
    pub fn subscribe(&self, project_id: &str) -> LogSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let mut projects = self.inner.projects();
        let log = projects.entry(project_id.to_string()).or_default();
        log.subscribers.insert(id, tx);
        LogSubscription {
            backlog: log.entries.iter().cloned().collect(),
            exited: log.exited.clone(),
            rx,
            _guard: SubscriberGuard {
                logs: self.inner.clone(),
                project_id: project_id.to_string(),
                id,
            },
        }
    }

    pub fn snapshot(&self, project_id: &str) -> Vec<LogEntry> {
        self.inner
            .projects()
            .get(project_id)
            .map(|log| log.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, project_id: &str) -> usize {
        self.inner
            .projects()
            .get(project_id)
            .map(|log| log.subscribers.len())
            .unwrap_or(0)
    }
}

struct SubscriberGuard {
    logs: Arc<LogInner>,
    project_id: String,
    id: u64,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        if let Some(log) = self.logs.projects().get_mut(&self.project_id) {
            log.subscribers.remove(&self.id);
        }
    }
}

/// Replay plus live feed for one project. Dropping it unsubscribes.
pub struct LogSubscription {
    pub backlog: Vec<LogEntry>,
    /// Set when the process had already exited at subscribe time.
    pub exited: Option<ExitMarker>,
    rx: mpsc::UnboundedReceiver<LogFrame>,
    _guard: SubscriberGuard,
}

impl LogSubscription {
    pub async fn next_frame(&mut self) -> Option<LogFrame> {
        self.rx.recv().await
    }
}
