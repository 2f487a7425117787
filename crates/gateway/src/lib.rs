//! Switchboard gateway: the long-running hub process.
//!
//! Wires the provider session layer and the session monitor to the chat
//! egress pipeline, the approval broker, the hook surface, and the cron
//! engine, and exposes the HTTP API.

pub mod approvals;
pub mod chat;
pub mod cli;
pub mod cron;
pub mod discovery;
pub mod hooks;
pub mod http;
pub mod lifecycle;
pub mod routes;
pub mod state;
