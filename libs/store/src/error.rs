//! Error types for store operations.

use eru_types::CoreError;
use thiserror::Error;

/// Errors that can occur against the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// CAS put lost the race: the key moved past the expected revision.
    #[error("revision conflict on {key}: expected {expected}, current {current}")]
    RevisionMismatch {
        key: String,
        expected: u64,
        current: u64,
    },

    /// Create-only put found the key already present.
    #[error("key {0} already exists")]
    AlreadyExists(String),

    /// The lock could not be acquired within the wait bound.
    #[error("failed to acquire lock {0}")]
    LockFailed(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Connection-level failure.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LockFailed(key) => CoreError::LockFailed(key),
            StoreError::Unavailable(_) => CoreError::NoStore,
            other => CoreError::Store(other.to_string()),
        }
    }
}
