//! Shared protocol definitions for broker <-> runner communication.
//!
//! Commands flow broker → runner and are a closed set. Everything a runner
//! sends back is a [`RunnerEvent`]; event kinds the broker does not know are
//! preserved as [`EventKind::Unknown`] rather than rejected.

mod command;
mod event;

pub use command::{
    CancelBuildPayload, Command, CommandPayload, CommandType, DeleteProjectFilesPayload,
    FetchLogsPayload, GithubPushPayload, ListFilesPayload, OperationType, ReadFilePayload,
    StartBuildPayload, StartDevServerPayload, StartTunnelPayload, StopTunnelPayload,
    ValidationError, WriteFilePayload,
};
pub use event::{
    BuildCompletedPayload, BuildFailedPayload, EventKind, LogChunkPayload, LogStream,
    PortDetectedPayload, ProcessExitedPayload, RunnerEvent, RunnerStatusPayload,
    TodoItem, TodoStatus, TodoUpdatePayload, ToolStartPayload, ToolState, ToolUpdatePayload,
    TunnelCreatedPayload,
};
