//! Error types for the Tether engine.
//!
//! Conflicts are not errors: they are always resolved to a concrete
//! [`ConflictCase`](crate::ConflictCase).

use crate::{ActionId, Module, RecordId};
use thiserror::Error;

/// All possible errors from the Tether engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Record store errors
    #[error("{module} record not found: {id}")]
    NotFound { module: Module, id: RecordId },

    #[error("{module} record already exists: {id}")]
    RecordAlreadyExists { module: Module, id: RecordId },

    #[error("unknown module: {0}")]
    UnknownModule(String),

    // Validation errors
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // Queue errors
    #[error("queued action not found: {0}")]
    ActionNotFound(ActionId),

    #[error("mutation queue is full ({capacity} entries)")]
    QueueFull { capacity: usize },

    #[error("queued action {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: ActionId,
        from: &'static str,
        to: &'static str,
    },

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
