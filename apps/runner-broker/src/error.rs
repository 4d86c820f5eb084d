use std::time::Duration;

use runner_proto::ValidationError;

use crate::sessions::SessionStatus;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid stored value: {0}")]
    Corrupt(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("runner {0} is not connected")]
    RunnerNotConnected(String),
    #[error("no reply for command {command_id} within {timeout:?}; outcome unknown")]
    CorrelationTimeout { command_id: String, timeout: Duration },
    #[error("malformed command: {0}")]
    MalformedCommand(#[from] ValidationError),
    #[error("no ports available in {start}..={end}")]
    NoPortsAvailable { start: u16, end: u16 },
    #[error("session {session_id} is already {status}")]
    AlreadyTerminal {
        session_id: String,
        status: SessionStatus,
    },
    #[error("command {command_id} failed: {message}")]
    CommandFailed { command_id: String, message: String },
    #[error("too many pending replies for runner {0}")]
    Backpressure(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("workspace scan failed: {0}")]
    Workspace(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}
