//! Per-account connection sessions and their reconnect supervision.

mod connection;
mod supervisor;

pub use connection::{
    ConnectionState, SessionClient, SessionConfig, SessionEvent, SessionEventKind, SessionFactory,
    SessionHandle,
};
pub use supervisor::{
    Recovery, RetryPolicy, SessionHealth, SessionSupervisor, SupervisorReport,
};
