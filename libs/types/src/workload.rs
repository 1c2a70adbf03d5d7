//! Workload records as persisted in the store.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One container-managed unit.
///
/// The two maps are the fundamental split: `resource_args` is what each
/// plugin records against node capacity; `engine_args` is what the
/// container runtime must be told at launch. A plugin may recompute
/// engine args from resource args at any time ("remap").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Workload {
    pub id: String,
    pub name: String,
    pub podname: String,
    pub nodename: String,
    pub image: String,
    /// Per-plugin resource accounting, keyed by plugin name.
    #[serde(default)]
    pub resource_args: HashMap<String, Value>,
    /// Per-plugin runtime parameters, keyed by plugin name.
    #[serde(default)]
    pub engine_args: HashMap<String, Value>,
    #[serde(default)]
    pub status: WorkloadStatus,
}

/// Liveness as last reported by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadStatus {
    #[default]
    Created,
    Running,
    Stopped,
    Unknown,
}

impl Workload {
    /// Resource args for one plugin; a plugin the workload has never seen
    /// yields an empty blob.
    pub fn resource_args_for(&self, plugin: &str) -> Value {
        self.resource_args.get(plugin).cloned().unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_plugin_args_are_null() {
        let w = Workload::default();
        assert_eq!(w.resource_args_for("cpumem"), Value::Null);
    }
}
