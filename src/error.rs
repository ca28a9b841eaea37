//! Error taxonomy shared by every pipeline stage.
//!
//! Whether an error propagates (so the triggering message is redelivered) or is
//! logged and absorbed is decided by [`SyncError::is_retryable`].
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Input that will fail the same way on every redelivery.
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("upstream catalog request failed: {0:#}")]
    Upstream(anyhow::Error),
    #[error("storage operation failed: {0:#}")]
    Storage(anyhow::Error),
    #[error("database error: {0}")]
    Relational(#[from] sqlx::Error),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    pub fn validation(msg: impl Into<String>) -> Self {
        SyncError::Validation(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Validation(_) | SyncError::Payload(_) => false,
            SyncError::Upstream(_) | SyncError::Storage(_) | SyncError::Relational(_) => true,
        }
    }
}
