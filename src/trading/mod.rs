//! Trade replication: stake sizing, the coordinator state machine, config.

mod config;
mod coordinator;
mod request;
mod stake_sizer;

pub use config::EngineConfig;
pub use coordinator::{Coordinator, CopyState};
pub use request::StartRequest;
