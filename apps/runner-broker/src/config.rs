use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default)]
    pub runner_shared_secret: Option<String>,
    #[serde(default)]
    pub auth_bypass: bool,
    #[serde(default = "default_liveness_window_ms")]
    pub liveness_window_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_max_pending_per_runner")]
    pub max_pending_per_runner: usize,
    #[serde(default = "default_max_pending_total")]
    pub max_pending_total: usize,
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
    #[serde(default = "default_port_connect_timeout_ms")]
    pub port_connect_timeout_ms: u64,
    #[serde(default = "default_log_buffer_capacity")]
    pub log_buffer_capacity: usize,
    #[serde(default = "default_stuck_session_max_age_minutes")]
    pub stuck_session_max_age_minutes: u64,
    #[serde(default = "default_stuck_sweep_interval_secs")]
    pub stuck_sweep_interval_secs: u64,
    #[serde(default)]
    pub workspace_root: Option<String>,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl AppConfig {
    /// Load `RUNNER_BROKER_*` variables (after `.env`), falling back to defaults.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        config::Config::builder()
            .add_source(config::Environment::with_prefix("RUNNER_BROKER").prefix_separator("_"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map(AppConfig::normalize)
            .unwrap_or_else(|_| AppConfig::default().normalize())
    }

    fn normalize(mut self) -> Self {
        self.database_url = Self::normalize_opt(self.database_url.take());
        self.runner_shared_secret = Self::normalize_opt(self.runner_shared_secret.take());
        self.workspace_root = Self::normalize_opt(self.workspace_root.take());
        if self.port_range_end < self.port_range_start {
            std::mem::swap(&mut self.port_range_start, &mut self.port_range_end);
        }
        self
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.liveness_window_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn port_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.port_connect_timeout_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            database_url: None,
            runner_shared_secret: None,
            auth_bypass: false,
            liveness_window_ms: default_liveness_window_ms(),
            command_timeout_ms: default_command_timeout_ms(),
            max_pending_per_runner: default_max_pending_per_runner(),
            max_pending_total: default_max_pending_total(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            port_connect_timeout_ms: default_port_connect_timeout_ms(),
            log_buffer_capacity: default_log_buffer_capacity(),
            stuck_session_max_age_minutes: default_stuck_session_max_age_minutes(),
            stuck_sweep_interval_secs: default_stuck_sweep_interval_secs(),
            workspace_root: None,
            log_filter: default_log_filter(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:4000".to_string()
}

fn default_liveness_window_ms() -> u64 {
    30_000
}

fn default_command_timeout_ms() -> u64 {
    30_000
}

fn default_max_pending_per_runner() -> usize {
    256
}

fn default_max_pending_total() -> usize {
    4_096
}

fn default_port_range_start() -> u16 {
    3_101
}

fn default_port_range_end() -> u16 {
    3_200
}

fn default_port_connect_timeout_ms() -> u64 {
    250
}

fn default_log_buffer_capacity() -> usize {
    1_000
}

fn default_stuck_session_max_age_minutes() -> u64 {
    30
}

fn default_stuck_sweep_interval_secs() -> u64 {
    300
}

fn default_log_filter() -> String {
    std::env::var("RUST_LOG").unwrap_or_else(|_| crate::telemetry::DEFAULT_LOG_FILTER.into())
}
