//! The error enum surfaced by cluster operations.

use thiserror::Error;

/// Errors that can occur in cluster operations.
///
/// Errors raised before a store commit are returned directly from the
/// operation; once a commit has happened, per-replica outcomes flow
/// through the result stream instead.
#[derive(Debug, Error, Clone)]
pub enum CoreError {
    /// A volume string failed to parse or validate.
    #[error("invalid volume spec: {0}")]
    InvalidVolumeSpec(String),

    /// The requested deploy count is not positive.
    #[error("invalid deploy count: {0}")]
    InvalidCount(i64),

    /// A node name was required but empty.
    #[error("node name must be provided")]
    EmptyNodeName,

    /// The store is unreachable.
    #[error("no available store")]
    NoStore,

    /// CAS retries against a node record were exhausted.
    #[error("node {0} is stale, retries exhausted")]
    NodeStale(String),

    /// The distributed lock could not be acquired within the wait bound.
    #[error("failed to acquire lock {0}")]
    LockFailed(String),

    /// The candidate nodes cannot hold the requested count.
    #[error("not enough resource: need {need}, available {available}")]
    InsufficientResource { need: i64, available: i64 },

    #[error("node {0} not found")]
    NodeNotFound(String),

    #[error("workload {0} not found")]
    WorkloadNotFound(String),

    /// A node cannot be removed while workloads still reference it.
    #[error("node {0} still has workloads")]
    NodeOccupied(String),

    /// The operation deadline expired before the critical section began.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// A resource plugin failed.
    #[error("plugin error: {0}")]
    Plugin(String),

    /// The container engine failed.
    #[error("engine error: {0}")]
    Engine(String),

    /// A store operation failed for a reason other than staleness.
    #[error("store error: {0}")]
    Store(String),
}
