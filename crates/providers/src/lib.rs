//! Provider adapters: three heterogeneous agent backends normalized behind
//! the [`session::AgentSession`] streaming contract.
//!
//! - [`codex_sdk`] wraps a stateful SDK producing thread events.
//! - [`claude_cli`] drives a CLI emitting line-delimited JSON.
//! - [`app_server`] speaks JSON-RPC 2.0 to a persistent child process.
//!
//! The [`manager::SessionManager`] owns the `key → session` pool.

pub mod app_server;
pub mod claude_cli;
pub mod codex_sdk;
pub mod manager;
pub mod rpc;
pub mod session;

pub use manager::{AgentProvider, SessionManager, SessionOptions};
pub use session::{AgentSession, EventStream, StatusCell};
