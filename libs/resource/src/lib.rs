//! # eru-resource
//!
//! The resource-plugin contract and its aggregator.
//!
//! Each resource dimension (cpu-mem, volumes, ...) implements [`Plugin`].
//! Argument payloads are opaque JSON trees carrying the plugin's own
//! schema; the aggregator never inspects them. The [`Aggregator`] fans
//! every operation out over all registered plugins in parallel and merges
//! the outcomes, rolling back on partial allocation failure.

mod aggregator;
mod error;
pub mod plugins;

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;

use eru_types::{NodeResourceInfo, Workload};

pub use aggregator::Aggregator;
pub use error::ResourceError;

/// Result alias for plugin operations.
pub type ResourceResult<T> = Result<T, ResourceError>;

/// Per-node deploy capacity as seen by one plugin.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeCapacityInfo {
    pub nodename: String,
    /// How many replicas of the request fit on the node.
    pub capacity: i64,
    /// Fraction of the node's tightest dimension already in use, 0..=1.
    pub usage_rate: f64,
}

/// Reservation produced by [`Plugin::alloc`]; arrays index by replica.
#[derive(Debug, Clone, Default)]
pub struct AllocResponse {
    pub engine_args: Vec<Value>,
    pub resource_args: Vec<Value>,
}

/// Result of [`Plugin::realloc`] for a single workload.
#[derive(Debug, Clone, Default)]
pub struct ReallocResponse {
    pub engine_args: Value,
    pub resource_args: Value,
}

/// Undo handle returned by the reserving operations.
///
/// [`Plugin::free`] releases every blob in `release`, then re-applies
/// every blob in `reapply`. A plain allocation populates only `release`;
/// a realloc records the new args to release and the original args to
/// restore. Freeing the same token twice is a no-op in effect: plugins
/// must make `free` idempotent with respect to the node state the token
/// was minted against.
#[derive(Debug, Clone)]
pub struct RollbackToken {
    pub plugin: String,
    pub nodename: String,
    pub release: Vec<Value>,
    pub reapply: Vec<Value>,
}

/// The contract every resource dimension implements.
///
/// External effects of all operations must be commutative across plugins:
/// the aggregator calls plugins in parallel and no ordering between them
/// is observable to clients. Plugins must tolerate workloads they have
/// never seen (treated as empty resource args).
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Stable name; the key of this plugin's slice in every args map.
    fn name(&self) -> &str;

    /// How many replicas of `request` fit on each node.
    ///
    /// A `Null` request constrains nothing and yields `i64::MAX`.
    async fn get_nodes_deploy_capacity(
        &self,
        nodenames: &[String],
        request: &Value,
    ) -> ResourceResult<HashMap<String, NodeCapacityInfo>>;

    /// Reserve `count` replicas of `request` on the node.
    async fn alloc(
        &self,
        nodename: &str,
        count: usize,
        request: &Value,
    ) -> ResourceResult<(AllocResponse, RollbackToken)>;

    /// Adjust one workload's reservation by a delta request.
    async fn realloc(
        &self,
        nodename: &str,
        origin: &Value,
        delta: &Value,
    ) -> ResourceResult<(ReallocResponse, RollbackToken)>;

    /// Undo a reservation.
    async fn free(&self, token: &RollbackToken) -> ResourceResult<()>;

    /// The plugin's view of the node versus the given workloads.
    ///
    /// Returns the stored info and human-readable diffs; with `fix`, the
    /// corrected state has been persisted before returning.
    async fn get_node_resource_info(
        &self,
        nodename: &str,
        workloads: &[Workload],
        fix: bool,
    ) -> ResourceResult<(NodeResourceInfo, Vec<String>)>;

    /// Recompute engine args from present resource args, per workload.
    async fn get_remap_args(
        &self,
        nodename: &str,
        workloads: &[Workload],
    ) -> ResourceResult<HashMap<String, Value>>;

    /// Overwrite or shift the node's capacity.
    async fn set_node_resource_capacity(
        &self,
        nodename: &str,
        capacity: &Value,
        delta: bool,
    ) -> ResourceResult<NodeResourceInfo>;

    /// Overwrite or shift the node's usage.
    async fn set_node_resource_usage(
        &self,
        nodename: &str,
        usage: &Value,
        delta: bool,
    ) -> ResourceResult<NodeResourceInfo>;

    /// Register a node with its initial capacity.
    async fn add_node(&self, nodename: &str, request: &Value) -> ResourceResult<NodeResourceInfo>;

    /// Drop the node's resource record.
    async fn remove_node(&self, nodename: &str) -> ResourceResult<()>;
}
