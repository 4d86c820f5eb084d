use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static BOOT_COUNTER: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new("runner_broker_boot_total", "broker boots")).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static COMMANDS_DISPATCHED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "runner_commands_dispatched_total",
            "commands handed to runner transports by type and result",
        ),
        &["command_type", "result"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static EVENTS_INGESTED: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new("runner_events_ingested_total", "runner events published on the bus"),
        &["event_type"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static CORRELATION_TIMEOUTS: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "runner_correlation_timeouts_total",
        "correlated waits that hit their deadline",
    ))
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static PENDING_WAITERS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new(
        "runner_correlation_pending",
        "correlation waiters currently registered",
    )
    .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static RUNNERS_ATTACHED: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("runner_transports_attached", "runner sockets currently attached")
        .unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static SESSION_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "build_session_transitions_total",
            "terminal transitions attempted by target status and outcome",
        ),
        &["status", "outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static PORTS_RESERVED: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("runner_ports_reserved", "ports currently leased to projects").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});

pub static STUCK_SESSIONS_FAILED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::with_opts(Opts::new(
        "build_sessions_stuck_failed_total",
        "sessions force-failed by the stuck-session sweep",
    ))
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub fn gather() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %err, "metrics encode error");
    }
    buffer
}
