//! eru cluster service.
//!
//! The control plane of the cluster: accepts workload deployment
//! requests, selects nodes by consulting the resource plugins, and
//! drives the container engines on the chosen nodes, with all node
//! state serialized through per-node distributed locks against the
//! store.

pub mod cluster;
pub mod config;
pub mod strategy;
pub mod worker;

pub use cluster::{
    AddNodeOptions, Calcium, CreateWorkloadMessage, DeployOptions, NodeFilter, NodeResource,
    RemoveWorkloadMessage,
};
pub use strategy::Strategy;
