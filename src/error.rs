use thiserror::Error;

use crate::dao::storage::StorageError;

/// Errors that can occur in service layer operations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Storage collaborator failed.
    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
    /// Requested resource was not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Operation cannot be performed in the current state.
    #[error("invalid state: {0}")]
    InvalidState(String),
}

impl ServiceError {
    /// Whether the underlying cause is a benign duplicate-key race.
    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, ServiceError::Storage(source) if source.is_duplicate_key())
    }
}
