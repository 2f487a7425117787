/// Shared error type used across all Switchboard crates.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("provider {provider}: {message}")]
    Provider { provider: String, message: String },

    #[error("session closed")]
    SessionClosed,

    #[error("subprocess exited: {0}")]
    ProcessExit(String),

    #[error("rpc: {0}")]
    Rpc(String),

    #[error("store: {0}")]
    Store(String),

    #[error("config: {0}")]
    Config(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
