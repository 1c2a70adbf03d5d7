//! # eru-engine
//!
//! The container-engine contract consumed per node: virtualization
//! lifecycle primitives, inspection, and the streaming resource-remap
//! call. A mock implementation with scripted failures backs tests and
//! dev mode.

mod error;
mod mock;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

pub use error::EngineError;
pub use mock::{MockEngine, MockEngineFactory};

/// Parameters for creating one virtualization unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VirtualizationParams {
    pub name: String,
    pub image: String,
    /// Per-plugin runtime parameters, keyed by plugin name.
    pub engine_args: HashMap<String, Value>,
    pub labels: HashMap<String, String>,
}

/// Result of creating one virtualization unit.
#[derive(Debug, Clone)]
pub struct VirtualizationCreated {
    /// Engine-side identifier.
    pub id: String,
}

/// Inspection snapshot of a running unit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VirtualizationInfo {
    pub id: String,
    pub image: String,
    pub running: bool,
    pub labels: HashMap<String, String>,
}

/// One outcome from the streaming remap call.
#[derive(Debug, Clone)]
pub struct RemapMessage {
    pub workload_id: String,
    pub error: Option<String>,
}

/// The per-node engine API.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Check that the engine accepts the given merged engine args.
    async fn resource_validate(&self, engine_args: &HashMap<String, Value>)
        -> Result<(), EngineError>;

    async fn virtualization_create(
        &self,
        params: VirtualizationParams,
    ) -> Result<VirtualizationCreated, EngineError>;

    async fn virtualization_start(&self, id: &str) -> Result<(), EngineError>;

    async fn virtualization_stop(&self, id: &str) -> Result<(), EngineError>;

    async fn virtualization_remove(&self, id: &str) -> Result<(), EngineError>;

    async fn virtualization_inspect(&self, id: &str)
        -> Result<VirtualizationInfo, EngineError>;

    /// Push fresh engine args to running units.
    ///
    /// Returns a stream of per-unit outcomes; the receiver ends when the
    /// engine has attempted every unit.
    async fn virtualization_resource_remap(
        &self,
        args: HashMap<String, HashMap<String, Value>>,
    ) -> Result<mpsc::Receiver<RemapMessage>, EngineError>;
}

/// Makes engine handles from node endpoints.
#[async_trait]
pub trait EngineFactory: Send + Sync {
    async fn make(&self, endpoint: &str) -> Result<Arc<dyn Engine>, EngineError>;
}
