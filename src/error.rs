//! Error types for imagefetch_core.

use std::sync::Arc;

use thiserror::Error;

/// Failures reported by a [`Transport`](crate::transport::Transport).
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Unsupported URL scheme: {0}")]
    UnsupportedScheme(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(Arc::new(err))
    }
}

/// Failures reported by a [`Decoder`](crate::decoder::Decoder).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Image data is empty")]
    Empty,

    #[error("Failed to decode image: {0}")]
    Malformed(String),

    #[error("Invalid target size: {width}x{height}")]
    InvalidTargetSize { width: u32, height: u32 },
}

/// Error returned to `image`/`data` callers.
///
/// Transport and status failures are shared by every subscriber of one fetch,
/// so the type is `Clone`.
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Unacceptable status code: {0}")]
    UnacceptableStatus(u16),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl FetchError {
    /// Whether the caller cancelled the request (as opposed to an upstream failure).
    pub fn is_cancelled(&self) -> bool {
        matches!(self, FetchError::Cancelled)
    }
}

/// Errors raised while loading or applying [`PipelineConfig`](crate::config::PipelineConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to build decode thread pool: {0}")]
    ThreadPool(String),
}

/// Result type alias for fetch operations.
pub type FetchResult<T> = Result<T, FetchError>;
