use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use runner_proto::Command;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::BrokerError;
use crate::metrics;

/// Outbound half of an attached runner socket. Only the registry hands these out.
#[derive(Clone, Debug)]
pub struct RunnerLink {
    runner_id: String,
    generation: Uuid,
    tx: mpsc::UnboundedSender<Command>,
}

impl RunnerLink {
    pub fn runner_id(&self) -> &str {
        &self.runner_id
    }

    pub fn generation(&self) -> Uuid {
        self.generation
    }

    /// Hand a command to the socket forwarder. Delivery to the runner is not confirmed.
    pub fn send(&self, command: Command) -> Result<(), BrokerError> {
        self.tx
            .send(command)
            .map_err(|_| BrokerError::RunnerNotConnected(self.runner_id.clone()))
    }
}

struct RunnerRecord {
    last_heartbeat: Instant,
    link: Option<RunnerLink>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConnectedRunner {
    pub runner_id: String,
    pub heartbeat_age_ms: u64,
    pub attached: bool,
}

/// Tracks runner liveness and owns their transport handles.
///
/// Liveness is computed on read; there is no background reaper. Stale records are
/// evicted lazily when a caller tries to resolve their transport.
#[derive(Clone)]
pub struct ConnectionRegistry {
    runners: Arc<DashMap<String, RunnerRecord>>,
    liveness_window: Duration,
}

impl ConnectionRegistry {
    pub fn new(liveness_window: Duration) -> Self {
        Self {
            runners: Arc::new(DashMap::new()),
            liveness_window,
        }
    }

    pub fn liveness_window(&self) -> Duration {
        self.liveness_window
    }

    /// Attach a socket for `runner_id`, replacing any previous one. The returned
    /// generation must be presented to [`ConnectionRegistry::detach`].
    pub fn attach(&self, runner_id: &str, tx: mpsc::UnboundedSender<Command>) -> Uuid {
        let generation = Uuid::new_v4();
        let link = RunnerLink {
            runner_id: runner_id.to_string(),
            generation,
            tx,
        };
        let replaced = self
            .runners
            .insert(
                runner_id.to_string(),
                RunnerRecord {
                    last_heartbeat: Instant::now(),
                    link: Some(link),
                },
            )
            .and_then(|previous| previous.link)
            .is_some();
        if replaced {
            info!(runner_id = %runner_id, "runner socket replaced by reconnect");
        } else {
            info!(runner_id = %runner_id, "runner attached");
        }
        self.refresh_gauge();
        generation
    }

    pub fn register_heartbeat(&self, runner_id: &str) {
        let now = Instant::now();
        self.runners
            .entry(runner_id.to_string())
            .and_modify(|record| record.last_heartbeat = now)
            .or_insert_with(|| {
                debug!(runner_id = %runner_id, "first heartbeat");
                RunnerRecord {
                    last_heartbeat: now,
                    link: None,
                }
            });
    }

    /// Runners whose last heartbeat is younger than `max_age` (the liveness window by default).
    pub fn list_connected(&self, max_age: Option<Duration>) -> Vec<ConnectedRunner> {
        let max_age = max_age.unwrap_or(self.liveness_window);
        let now = Instant::now();
        let mut runners: Vec<ConnectedRunner> = self
            .runners
            .iter()
            .filter_map(|entry| {
                let age = now.saturating_duration_since(entry.last_heartbeat);
                (age < max_age).then(|| ConnectedRunner {
                    runner_id: entry.key().clone(),
                    heartbeat_age_ms: age.as_millis() as u64,
                    attached: entry.link.is_some(),
                })
            })
            .collect();
        runners.sort_by(|a, b| a.runner_id.cmp(&b.runner_id));
        runners
    }

    pub fn is_connected(&self, runner_id: &str) -> bool {
        self.runners
            .get(runner_id)
            .map(|record| record.last_heartbeat.elapsed() < self.liveness_window)
            .unwrap_or(false)
    }

    pub fn resolve_transport(&self, runner_id: &str) -> Result<RunnerLink, BrokerError> {
        let not_connected = || BrokerError::RunnerNotConnected(runner_id.to_string());
        let (stale, link) = match self.runners.get(runner_id) {
            Some(record) => (
                record.last_heartbeat.elapsed() >= self.liveness_window,
                record.link.clone(),
            ),
            None => return Err(not_connected()),
        };
        if stale {
            let window = self.liveness_window;
            let evicted = self
                .runners
                .remove_if(runner_id, |_, record| record.last_heartbeat.elapsed() >= window)
                .is_some();
            if evicted {
                info!(runner_id = %runner_id, "evicted runner past liveness window");
                self.refresh_gauge();
            }
            return Err(not_connected());
        }
        match link {
            Some(link) if !link.tx.is_closed() => Ok(link),
            _ => Err(not_connected()),
        }
    }

    /// Remove the runner if `generation` still names its current socket. Returns
    /// whether anything was removed; a stale close after a reconnect is ignored.
    pub fn detach(&self, runner_id: &str, generation: Uuid) -> bool {
        let removed = self
            .runners
            .remove_if(runner_id, |_, record| {
                record
                    .link
                    .as_ref()
                    .is_some_and(|link| link.generation == generation)
            })
            .is_some();
        if removed {
            info!(runner_id = %runner_id, "runner detached");
            self.refresh_gauge();
        } else {
            debug!(runner_id = %runner_id, %generation, "ignoring close of superseded socket");
        }
        removed
    }

    fn refresh_gauge(&self) {
        let attached = self
            .runners
            .iter()
            .filter(|entry| entry.link.is_some())
            .count();
        metrics::RUNNERS_ATTACHED.set(attached as i64);
    }
}
