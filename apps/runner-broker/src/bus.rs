use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard, RwLock};
use runner_proto::{Command, EventKind, RunnerEvent};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, trace, warn};

use crate::error::BrokerError;
use crate::metrics;
use crate::registry::ConnectionRegistry;

const PROJECT_STREAM_CAPACITY: usize = 512;

/// Side-effect consumer of inbound runner events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    /// Runs while the project's delivery lock is held; keep it short.
    async fn handle(&self, event: &RunnerEvent);
}

pub type EventPredicate = Box<dyn Fn(&RunnerEvent) -> bool + Send + Sync>;

/// Matches any correlated reply except acknowledgements.
pub fn any_reply() -> EventPredicate {
    Box::new(|event| event.kind != EventKind::Ack)
}

pub fn reply_of(kinds: Vec<EventKind>) -> EventPredicate {
    Box::new(move |event| event.kind == EventKind::Error || kinds.contains(&event.kind))
}

struct Waiter {
    id: u64,
    runner_id: Option<String>,
    predicate: EventPredicate,
    tx: oneshot::Sender<RunnerEvent>,
}

#[derive(Default)]
struct PendingTable {
    by_command: HashMap<String, Vec<Waiter>>,
    per_runner: HashMap<String, usize>,
    total: usize,
}

impl PendingTable {
    fn take(&mut self, command_id: &str, waiter_id: u64) -> Option<Waiter> {
        let waiters = self.by_command.get_mut(command_id)?;
        let index = waiters.iter().position(|w| w.id == waiter_id)?;
        let waiter = waiters.remove(index);
        if waiters.is_empty() {
            self.by_command.remove(command_id);
        }
        self.forget(&waiter);
        Some(waiter)
    }

    fn take_first_match(&mut self, command_id: &str, event: &RunnerEvent) -> Option<Waiter> {
        let waiters = self.by_command.get_mut(command_id)?;
        let index = waiters.iter().position(|w| (w.predicate)(event))?;
        let waiter = waiters.remove(index);
        if waiters.is_empty() {
            self.by_command.remove(command_id);
        }
        self.forget(&waiter);
        Some(waiter)
    }

    fn forget(&mut self, waiter: &Waiter) {
        self.total = self.total.saturating_sub(1);
        if let Some(runner_id) = &waiter.runner_id {
            if let Some(count) = self.per_runner.get_mut(runner_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.per_runner.remove(runner_id);
                }
            }
        }
        metrics::PENDING_WAITERS.set(self.total as i64);
    }
}

struct BusInner {
    registry: ConnectionRegistry,
    pending: Mutex<PendingTable>,
    next_waiter: AtomicU64,
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
    project_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    project_streams: DashMap<String, broadcast::Sender<RunnerEvent>>,
    max_pending_per_runner: usize,
    max_pending_total: usize,
}

impl BusInner {
    fn pending(&self) -> MutexGuard<'_, PendingTable> {
        self.pending.lock()
    }
}

/// Routes commands to runners and correlated events back to whoever is waiting.
#[derive(Clone)]
pub struct CommandBus {
    inner: Arc<BusInner>,
}

impl CommandBus {
    pub fn new(
        registry: ConnectionRegistry,
        max_pending_per_runner: usize,
        max_pending_total: usize,
    ) -> Self {
        Self {
            inner: Arc::new(BusInner {
                registry,
                pending: Mutex::new(PendingTable::default()),
                next_waiter: AtomicU64::new(1),
                handlers: RwLock::new(Vec::new()),
                project_locks: DashMap::new(),
                project_streams: DashMap::new(),
                max_pending_per_runner,
                max_pending_total,
            }),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        debug!(handler = handler.name(), "event handler registered");
        self.inner.handlers.write().push(handler);
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending().total
    }

    /// Validate and send a command. Never touches waiter state and never queues:
    /// a disconnected runner fails immediately.
    pub fn dispatch(&self, runner_id: &str, command: Command) -> Result<(), BrokerError> {
        let kind = command.kind();
        let result = command
            .validate()
            .map_err(BrokerError::from)
            .and_then(|_| self.inner.registry.resolve_transport(runner_id))
            .and_then(|link| {
                debug!(
                    runner_id = %runner_id,
                    command_id = %command.id,
                    command_type = %kind,
                    "dispatching command"
                );
                link.send(command)
            });
        let label = match &result {
            Ok(()) => "sent",
            Err(BrokerError::MalformedCommand(_)) => "malformed",
            Err(_) => "not_connected",
        };
        metrics::COMMANDS_DISPATCHED
            .with_label_values(&[kind.as_str(), label])
            .inc();
        result
    }

    /// Register a one-shot waiter for `command_id`. Register before dispatching
    /// so a fast reply cannot slip past.
    pub fn register_waiter(
        &self,
        command_id: &str,
        runner_id: Option<&str>,
        predicate: EventPredicate,
    ) -> Result<PendingReply, BrokerError> {
        let (tx, rx) = oneshot::channel();
        let id = self.inner.next_waiter.fetch_add(1, Ordering::Relaxed);
        {
            let mut table = self.inner.pending();
            if table.total >= self.inner.max_pending_total {
                return Err(BrokerError::Backpressure(
                    runner_id.unwrap_or("*").to_string(),
                ));
            }
            if let Some(runner_id) = runner_id {
                let count = table.per_runner.get(runner_id).copied().unwrap_or(0);
                if count >= self.inner.max_pending_per_runner {
                    return Err(BrokerError::Backpressure(runner_id.to_string()));
                }
                table.per_runner.insert(runner_id.to_string(), count + 1);
            }
            table.total += 1;
            table
                .by_command
                .entry(command_id.to_string())
                .or_default()
                .push(Waiter {
                    id,
                    runner_id: runner_id.map(str::to_string),
                    predicate,
                    tx,
                });
            metrics::PENDING_WAITERS.set(table.total as i64);
        }
        Ok(PendingReply {
            guard: WaiterGuard {
                bus: self.inner.clone(),
                command_id: command_id.to_string(),
                waiter_id: id,
            },
            rx,
        })
    }

    /// Wait for the first event correlated to `command_id` that satisfies `predicate`.
    pub async fn await_event(
        &self,
        command_id: &str,
        predicate: EventPredicate,
        timeout: Duration,
    ) -> Result<RunnerEvent, BrokerError> {
        self.register_waiter(command_id, None, predicate)?
            .wait(timeout)
            .await
    }

    /// Dispatch `command` and wait for its correlated reply.
    pub async fn request(
        &self,
        runner_id: &str,
        command: Command,
        predicate: EventPredicate,
        timeout: Duration,
    ) -> Result<RunnerEvent, BrokerError> {
        command.validate()?;
        self.inner.registry.resolve_transport(runner_id)?;
        let reply = self.register_waiter(&command.id, Some(runner_id), predicate)?;
        self.dispatch(runner_id, command)?;
        reply.wait(timeout).await
    }

    pub fn subscribe_project(&self, project_id: &str) -> broadcast::Receiver<RunnerEvent> {
        self.inner
            .project_streams
            .entry(project_id.to_string())
            .or_insert_with(|| broadcast::channel(PROJECT_STREAM_CAPACITY).0)
            .subscribe()
    }

    /// Deliver an inbound event: side-effect handlers and project listeners in
    /// per-project order, then at most one correlated waiter.
    pub async fn publish(&self, event: RunnerEvent) {
        metrics::EVENTS_INGESTED
            .with_label_values(&[event.kind.metric_label()])
            .inc();
        trace!(
            event_type = %event.kind,
            command_id = ?event.command_id,
            project_id = ?event.project_id,
            "publishing event"
        );

        let handlers: Vec<Arc<dyn EventHandler>> = self.inner.handlers.read().clone();

        match event.project_id.as_deref() {
            Some(project_id) => {
                let lock = self
                    .inner
                    .project_locks
                    .entry(project_id.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                    .clone();
                {
                    let _ordered = lock.lock().await;
                    for handler in &handlers {
                        handler.handle(&event).await;
                    }
                    let delivered = match self.inner.project_streams.get(project_id) {
                        Some(stream) => stream.send(event.clone()).is_ok(),
                        None => true,
                    };
                    if !delivered {
                        self.inner
                            .project_streams
                            .remove_if(project_id, |_, stream| stream.receiver_count() == 0);
                    }
                }
                drop(lock);
                // Only the map's own handle left means no publisher is queued behind us.
                self.inner
                    .project_locks
                    .remove_if(project_id, |_, lock| Arc::strong_count(lock) == 1);
            }
            None => {
                for handler in &handlers {
                    handler.handle(&event).await;
                }
            }
        }

        self.resolve_waiter(&event);
    }

    fn resolve_waiter(&self, event: &RunnerEvent) {
        let Some(command_id) = event.command_id.as_deref() else {
            return;
        };
        let mut table = self.inner.pending();
        while let Some(waiter) = table.take_first_match(command_id, event) {
            if waiter.tx.send(event.clone()).is_ok() {
                return;
            }
        }
        trace!(command_id = %command_id, "no waiter for correlated event");
    }
}

struct WaiterGuard {
    bus: Arc<BusInner>,
    command_id: String,
    waiter_id: u64,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.bus.pending().take(&self.command_id, self.waiter_id);
    }
}

/// A registered waiter. Dropping it unregisters the subscription.
pub struct PendingReply {
    guard: WaiterGuard,
    rx: oneshot::Receiver<RunnerEvent>,
}

impl PendingReply {
    pub fn command_id(&self) -> &str {
        &self.guard.command_id
    }

    /// Resolve with the matching event, `CommandFailed` if it carries an error,
    /// or `CorrelationTimeout` once the deadline passes (outcome unknown).
    pub async fn wait(self, timeout: Duration) -> Result<RunnerEvent, BrokerError> {
        let PendingReply { guard, rx } = self;
        let command_id = guard.command_id.clone();
        let outcome = tokio::time::timeout(timeout, rx).await;
        drop(guard);
        match outcome {
            Ok(Ok(event)) => match event.error_message() {
                Some(message) => Err(BrokerError::CommandFailed {
                    command_id,
                    message,
                }),
                None => Ok(event),
            },
            Ok(Err(_)) | Err(_) => {
                metrics::CORRELATION_TIMEOUTS.inc();
                warn!(command_id = %command_id, ?timeout, "correlated reply timed out");
                Err(BrokerError::CorrelationTimeout {
                    command_id,
                    timeout,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runner_proto::{CommandPayload, ReadFilePayload};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn bus() -> CommandBus {
        CommandBus::new(ConnectionRegistry::new(Duration::from_secs(30)), 2, 3)
    }

    fn read_file(project: &str) -> Command {
        Command::for_project(
            project,
            CommandPayload::ReadFile(ReadFilePayload {
                path: "src/main.rs".into(),
            }),
        )
    }

    fn reply(kind: EventKind, command_id: &str, payload: serde_json::Value) -> RunnerEvent {
        RunnerEvent::new(kind, Some("p1".into()), payload).reply_to(command_id)
    }

    #[tokio::test]
    async fn dispatch_to_disconnected_runner_leaves_no_waiters() {
        let bus = bus();
        let err = bus.dispatch("ghost", read_file("p1")).unwrap_err();
        assert!(matches!(err, BrokerError::RunnerNotConnected(_)));

        let err = bus
            .request("ghost", read_file("p1"), any_reply(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::RunnerNotConnected(_)));
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn malformed_command_is_rejected_before_dispatch() {
        let bus = bus();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.registry().attach("r1", tx);
        let command = Command::new(
            None,
            CommandPayload::ReadFile(ReadFilePayload { path: "x".into() }),
        );
        assert!(matches!(
            bus.dispatch("r1", command),
            Err(BrokerError::MalformedCommand(_))
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn first_match_resolves_once() {
        let bus = bus();
        let pending = bus.register_waiter("c1", None, any_reply()).unwrap();
        bus.publish(reply(EventKind::FileContent, "c1", json!({"content": "one"})))
            .await;
        bus.publish(reply(EventKind::FileContent, "c1", json!({"content": "two"})))
            .await;

        let event = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(event.payload["content"], "one");
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn predicate_skips_acks() {
        let bus = bus();
        let pending = bus
            .register_waiter("c1", None, reply_of(vec![EventKind::FileContent]))
            .unwrap();
        bus.publish(reply(EventKind::Ack, "c1", json!({}))).await;
        assert_eq!(bus.pending_count(), 1);
        bus.publish(reply(EventKind::FileContent, "c1", json!({"content": "ok"})))
            .await;
        let event = pending.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(event.kind, EventKind::FileContent);
    }

    #[tokio::test]
    async fn error_payload_rejects_waiter() {
        let bus = bus();
        let pending = bus.register_waiter("c1", None, any_reply()).unwrap();
        bus.publish(reply(EventKind::FileContent, "c1", json!({"error": "ENOENT"})))
            .await;
        match pending.wait(Duration::from_secs(1)).await {
            Err(BrokerError::CommandFailed { message, .. }) => assert_eq!(message, "ENOENT"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_waiter() {
        let bus = bus();
        let err = bus
            .await_event("c1", any_reply(), Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::CorrelationTimeout { .. }));
        assert_eq!(bus.pending_count(), 0);
        bus.publish(reply(EventKind::FileContent, "c1", json!({}))).await;
    }

    #[tokio::test]
    async fn dropped_reply_unregisters() {
        let bus = bus();
        let pending = bus.register_waiter("c1", Some("r1"), any_reply()).unwrap();
        assert_eq!(bus.pending_count(), 1);
        drop(pending);
        assert_eq!(bus.pending_count(), 0);
    }

    #[tokio::test]
    async fn waiter_bounds_apply_backpressure() {
        let bus = bus();
        let _a = bus.register_waiter("a", Some("r1"), any_reply()).unwrap();
        let _b = bus.register_waiter("b", Some("r1"), any_reply()).unwrap();
        assert!(matches!(
            bus.register_waiter("c", Some("r1"), any_reply()),
            Err(BrokerError::Backpressure(id)) if id == "r1"
        ));
        let _c = bus.register_waiter("c", Some("r2"), any_reply()).unwrap();
        assert!(matches!(
            bus.register_waiter("d", None, any_reply()),
            Err(BrokerError::Backpressure(_))
        ));
    }

    #[tokio::test]
    async fn request_round_trip_through_fake_runner() {
        let bus = bus();
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        bus.registry().attach("r1", tx);
        let runner_bus = bus.clone();
        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                runner_bus
                    .publish(reply(EventKind::Ack, &command.id, json!({})))
                    .await;
                runner_bus
                    .publish(reply(
                        EventKind::FileContent,
                        &command.id,
                        json!({"content": "fn main() {}"}),
                    ))
                    .await;
            }
        });

        let event = bus
            .request("r1", read_file("p1"), any_reply(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(event.kind, EventKind::FileContent);
        assert_eq!(bus.pending_count(), 0);
    }

    struct Recorder(tokio::sync::Mutex<Vec<String>>);

    #[async_trait]
    impl EventHandler for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        async fn handle(&self, event: &RunnerEvent) {
            self.0.lock().await.push(event.payload["n"].to_string());
        }
    }

    #[tokio::test]
    async fn handlers_and_project_listeners_see_events_in_order() {
        let bus = bus();
        let recorder = Arc::new(Recorder(tokio::sync::Mutex::new(Vec::new())));
        bus.register_handler(recorder.clone());
        let mut stream = bus.subscribe_project("p1");

        for n in 0..5 {
            bus.publish(RunnerEvent::new(
                EventKind::LogChunk,
                Some("p1".into()),
                json!({"n": n, "data": "x"}),
            ))
            .await;
        }
        bus.publish(RunnerEvent::new(EventKind::LogChunk, Some("p2".into()), json!({"n": 99})))
            .await;

        assert_eq!(*recorder.0.lock().await, vec!["0", "1", "2", "3", "4", "99"]);
        for n in 0..5 {
            assert_eq!(stream.recv().await.unwrap().payload["n"], n);
        }
        assert!(stream.try_recv().is_err());
    }

    #[tokio::test]
    async fn idle_projects_leave_no_bookkeeping() {
        let bus = bus();
        let chunk = |project: &str| {
            RunnerEvent::new(EventKind::LogChunk, Some(project.into()), json!({"data": "x"}))
        };
        for n in 0..10 {
            bus.publish(chunk(&format!("p{n}"))).await;
        }
        assert!(bus.inner.project_locks.is_empty());
        assert!(bus.inner.project_streams.is_empty());

        let stream = bus.subscribe_project("p1");
        bus.publish(chunk("p1")).await;
        assert_eq!(bus.inner.project_streams.len(), 1);

        drop(stream);
        bus.publish(chunk("p1")).await;
        assert!(bus.inner.project_streams.is_empty());
        assert!(bus.inner.project_locks.is_empty());
    }
}
