//! # eru-types
//!
//! Domain types shared across the eru control plane:
//!
//! - Volume binding algebra: parse, normalize, merge, and plan-apply
//!   volume specifications.
//! - Node and workload records as persisted in the store.
//! - Cluster configuration.
//! - The shared error enum surfaced by cluster operations.

mod config;
mod error;
mod node;
mod volume;
mod workload;

pub use config::{Config, SchedConfig, TimeoutConfig};
pub use error::CoreError;
pub use node::{Node, NodeResourceInfo};
pub use volume::{VolumeBinding, VolumeBindings, VolumeMap, VolumePlan};
pub use workload::{Workload, WorkloadStatus};

/// Result alias used throughout the cluster service.
pub type CoreResult<T> = Result<T, CoreError>;
