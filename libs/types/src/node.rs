//! Node records as persisted in the store.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A plugin's view of one node's resources.
///
/// Both blobs are opaque to the cluster service; only the owning plugin
/// interprets them. The plugin enforces `usage ≤ capacity` componentwise
/// and persists the record under its own key, so the node record stays
/// free of resource state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeResourceInfo {
    pub capacity: Value,
    pub usage: Value,
}

/// A host capable of running workloads.
///
/// Owned by the store; an in-memory copy is the lock holder's property
/// for the duration of the critical section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub podname: String,
    /// Container-engine endpoint for this node.
    pub endpoint: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default = "default_available")]
    pub available: bool,
}

fn default_available() -> bool {
    true
}

impl Node {
    /// True if the node's labels contain every requested (key, value) pair.
    pub fn matches_labels(&self, labels: &HashMap<String, String>) -> bool {
        labels
            .iter()
            .all(|(k, v)| self.labels.get(k).is_some_and(|have| have == v))
    }
}
