use std::time::Duration;
use thiserror::Error;

/// Errors produced across the rexec server and client.
#[derive(Debug, Error)]
pub enum RexecError {
    #[error("bind failed on {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("{0}")]
    Execution(String),

    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid config: {0}")]
    ConfigInvalid(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type RexecResult<T> = Result<T, RexecError>;
