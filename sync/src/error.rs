//! Error types for the sync runtime.

use crate::config::ConfigError;
use std::time::Duration;

/// Failure of a call to the remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    /// Network failure or 5xx; retried with backoff
    #[error("transient network error: {0}")]
    Transient(String),

    /// No response within the request timeout; retried with backoff
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// 4xx, another non-2xx status, or a structurally invalid request; never
    /// retried
    #[error("request rejected: {message}")]
    Permanent {
        status: Option<u16>,
        message: String,
    },
}

impl RemoteError {
    pub fn permanent(message: impl Into<String>) -> Self {
        RemoteError::Permanent {
            status: None,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient(_) | RemoteError::Timeout(_))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            RemoteError::Permanent { status, .. } => *status,
            _ => None,
        }
    }
}

/// Failure of a durable storage backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error on {key}: {message}")]
    Io { key: String, message: String },

    #[error("invalid storage key: {0:?}")]
    InvalidKey(String),
}

/// Runtime error type.
///
/// `Clone` so a shared initialization can hand the same error to every
/// waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("engine error: {0}")]
    Engine(#[from] tether_engine::Error),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("initialization failed: {0}")]
    Initialization(String),

    #[error("offline")]
    Offline,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("sync orchestrator has been shut down")]
    ShutDown,

    #[error("background task failed: {0}")]
    Task(String),
}

/// Result type alias for the runtime.
pub type Result<T> = std::result::Result<T, SyncError>;
