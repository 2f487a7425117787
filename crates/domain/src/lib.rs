//! Shared data model for Switchboard: the unified agent-event stream,
//! session status and monitor snapshots, configuration, and the common
//! error type used across all crates.

pub mod config;
pub mod error;
pub mod event;
pub mod snapshot;

pub use error::{Error, Result};
pub use event::{AgentEvent, BoxStream, SessionState, SessionStatus, TokenUsage};
pub use snapshot::{ActivityPhase, Provider, SessionSnapshot, SnapshotState, WaitReason};
