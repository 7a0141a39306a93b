//! Error types for coordination store operations.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during coordination store operations.
///
/// `KeyExists`, `KeyNotFound` and `RevisionMismatch` are the expected
/// outcomes of conditional writes. `Unavailable` and `Timeout` are transient.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("key already exists: {0}")]
    KeyExists(String),

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("revision mismatch on {key}: expected {expected}, found {actual:?}")]
    RevisionMismatch {
        key: String,
        expected: u64,
        actual: Option<u64>,
    },

    #[error("invalid put options: {0}")]
    InvalidOptions(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("watch lagged, {0} events dropped")]
    WatchLagged(u64),
}

impl StoreError {
    /// Failure of the store itself, as opposed to a conditional write losing.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::Timeout(_) | StoreError::Backend(_)
        )
    }

    /// Outcome of a conditional write that did not apply.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StoreError::KeyExists(_) | StoreError::KeyNotFound(_) | StoreError::RevisionMismatch { .. }
        )
    }
}
