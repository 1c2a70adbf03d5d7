//! Error types for resource plugins.

use eru_store::StoreError;
use eru_types::CoreError;
use thiserror::Error;

/// Errors that can occur inside a resource plugin or the aggregator.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// The opaque request blob did not match the plugin's schema.
    #[error("invalid resource request: {0}")]
    InvalidRequest(String),

    /// No resource record exists for the node.
    #[error("node {0} has no resource record")]
    NodeNotFound(String),

    /// The node is already registered with the plugin.
    #[error("node {0} already registered")]
    NodeExists(String),

    /// The node cannot hold the requested allocation.
    #[error("not enough resource on {nodename}: {detail}")]
    Insufficient { nodename: String, detail: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(String),

    /// A failure attributed to one plugin by the aggregator.
    #[error("plugin {plugin}: {message}")]
    Plugin { plugin: String, message: String },
}

impl From<serde_json::Error> for ResourceError {
    fn from(err: serde_json::Error) -> Self {
        ResourceError::Serialization(err.to_string())
    }
}

impl From<CoreError> for ResourceError {
    fn from(err: CoreError) -> Self {
        ResourceError::InvalidRequest(err.to_string())
    }
}

impl From<ResourceError> for CoreError {
    fn from(err: ResourceError) -> Self {
        match err {
            ResourceError::Store(e) => e.into(),
            ResourceError::NodeNotFound(name) => CoreError::NodeNotFound(name),
            other => CoreError::Plugin(other.to_string()),
        }
    }
}
