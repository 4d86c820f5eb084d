use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

pub const DEFAULT_LOG_FILTER: &str = "info,runner_broker=debug";

/// Install the global subscriber. An unparseable `filter` falls back to
/// [`DEFAULT_LOG_FILTER`] and is reported once the subscriber is live.
pub fn init_tracing(filter: &str) {
    let (env_filter, rejected) = match EnvFilter::try_new(filter) {
        Ok(parsed) => (parsed, None),
        Err(err) => (EnvFilter::new(DEFAULT_LOG_FILTER), Some(err)),
    };
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    Registry::default().with(env_filter).with(fmt_layer).init();
    if let Some(err) = rejected {
        tracing::warn!(filter = %filter, error = %err, "invalid log filter, using default");
    }
}
