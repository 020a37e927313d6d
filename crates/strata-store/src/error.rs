//! Store error types.

use strata_core::{ScanError, SessionId};
use thiserror::Error;

/// Errors raised by the tree store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite failure.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Stored configuration snapshot could not be (de)serialized.
    #[error("Invalid config snapshot: {0}")]
    Json(#[from] serde_json::Error),

    /// A session is already marked running.
    #[error("A scan session is already running")]
    SessionRunning,

    /// The writer's session is no longer running; its writes are discarded.
    #[error("Session {session} is no longer running")]
    Fenced { session: SessionId },

    /// A stored value could not be interpreted.
    #[error("Corrupt row: {message}")]
    Corrupt { message: String },
}

impl From<StoreError> for ScanError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SessionRunning => ScanError::AlreadyRunning,
            other => ScanError::storage(other),
        }
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
