//! Narrow, typed errors at the crate's public boundaries, so callers can
//! match on failure kind; the gateway binary wraps these in
//! `anyhow::Result` with `.context()` as it composes them.

use thiserror::Error;

/// Errors surfaced across `iotdevice-core`'s public API.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A transient I/O failure (broker unreachable, socket reset, timeout).
    /// Always retryable by the restart supervisor.
    #[error("transient I/O error: {0}")]
    TransientIo(#[source] std::io::Error),

    /// The peer sent something that violates the expected wire contract
    /// (malformed topic, unparseable payload, unexpected packet).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A config value failed validation before any device or client was
    /// started.
    #[error("configuration error: {0}")]
    Config(String),

    /// The component was asked to stop and is reporting that as its exit
    /// reason rather than a failure.
    #[error("shutdown requested")]
    Shutdown,
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::TransientIo(err)
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
