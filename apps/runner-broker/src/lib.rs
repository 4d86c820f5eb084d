pub mod builds;
pub mod bus;
pub mod config;
pub mod dev_server;
pub mod error;
pub mod handlers;
pub mod logs;
pub mod metrics;
pub mod ports;
pub mod projects;
pub mod reconcile;
pub mod registry;
pub mod routes;
pub mod sessions;
pub mod state;
pub mod sweep;
pub mod telemetry;
pub mod websocket;
