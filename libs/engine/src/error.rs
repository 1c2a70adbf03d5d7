//! Error types for engine operations.

use eru_types::CoreError;
use thiserror::Error;

/// Errors that can occur against a container engine.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    /// The unit does not exist on the node.
    #[error("not found: {0}")]
    NotFound(String),

    /// The engine rejected the given args.
    #[error("invalid engine args: {0}")]
    InvalidArgs(String),

    /// Transport-level failure.
    #[error("engine transport error: {0}")]
    Transport(String),
}

impl From<EngineError> for CoreError {
    fn from(err: EngineError) -> Self {
        CoreError::Engine(err.to_string())
    }
}
