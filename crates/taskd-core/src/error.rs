use thiserror::Error;

use crate::ports::StoreError;

/// Errors surfaced by the task service to its callers.
#[derive(Debug, Error)]
pub enum TaskdError {
    /// Rejected input; nothing was written.
    #[error("{0}")]
    Validation(String),

    #[error("task not found: {0}")]
    NotFound(String),

    /// The task's current status does not allow the operation.
    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
