use std::io;
use thiserror::Error;

/// Connection-level fault reported through the transport error callback.
///
/// These never cross the pool boundary as `Err`: the pool converts them to a
/// boolean send failure and forwards the error out-of-band.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Programmer errors in the client configuration. The only failures in this
/// crate that surface as `Err` to the caller.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("at least one node endpoint is required")]
    NoEndpoints,
    #[error("pool size must be greater than zero")]
    ZeroPoolSize,
}
