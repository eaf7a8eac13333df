//! Domain error types.

use thiserror::Error;
use uuid::Uuid;

use crate::step::StepKind;

/// Top-level domain error type.
#[derive(Debug, Error)]
pub enum DomainError {
    /// A referenced record (scene, draft, iteration, task, ...) does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record that was looked up.
        entity: &'static str,
        /// The identifier that was not found.
        id: Uuid,
    },

    /// A cross-reference mismatch or a contract violation by the caller.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A step handler raised an error while executing a task.
    #[error("{step} handler failed: {message}")]
    HandlerFailure {
        /// The step kind whose handler failed.
        step: StepKind,
        /// The handler's error message.
        message: String,
    },

    /// A conditional write lost a race (e.g. the task is no longer running).
    #[error("conflict: {0}")]
    Conflict(String),

    /// An infrastructure/persistence error.
    #[error("infrastructure error: {0}")]
    Infrastructure(String),
}

impl DomainError {
    /// Shorthand for a `NotFound` error.
    #[must_use]
    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        Self::NotFound { entity, id }
    }
}
