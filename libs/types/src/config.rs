//! Cluster configuration.
//!
//! The daemon deserializes this from a TOML file; every field carries a
//! default so a partial file (or none at all, in dev mode) still yields a
//! runnable configuration.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the cluster service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Store endpoints.
    pub etcd: Vec<String>,
    /// Namespace under which all lock keys are created.
    pub etcd_lock_prefix: String,
    /// Allocator mode: `scheduler` or `cpu-period`.
    pub resource_alloc: String,
    /// Multi-zone label partition, e.g. `C1`.
    pub zone: String,
    /// Upper bound on concurrent per-node operations.
    pub fan_out: usize,
    /// Retries on store CAS conflict before surfacing staleness.
    pub cas_retry: u32,

    pub scheduler: SchedConfig,
    pub timeout: TimeoutConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            etcd: vec!["127.0.0.1:2379".to_string()],
            etcd_lock_prefix: "/eru-core/_lock".to_string(),
            resource_alloc: "scheduler".to_string(),
            zone: String::new(),
            fan_out: 10,
            cas_retry: 3,
            scheduler: SchedConfig::default(),
            timeout: TimeoutConfig::default(),
        }
    }
}

/// Scheduler parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedConfig {
    /// Key fragment for per-node locks.
    pub lock_key: String,
    /// Lock TTL in seconds.
    pub lock_ttl: u64,
    /// Strategy family default: `simple` or `complex`.
    #[serde(rename = "type")]
    pub sched_type: String,
    /// Max pieces of a single core a fractional request may occupy.
    pub maxshare: i64,
    /// How many pieces one core is divided into.
    pub sharebase: i64,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            lock_key: "core".to_string(),
            lock_ttl: 30,
            sched_type: "simple".to_string(),
            maxshare: -1,
            sharebase: 100,
        }
    }
}

/// Per-operation deadlines, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub create_workload: u64,
    pub remove_workload: u64,
    pub remap: u64,
    pub realloc: u64,
    pub common: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            create_workload: 300,
            remove_workload: 60,
            remap: 60,
            realloc: 60,
            common: 10,
        }
    }
}

impl Config {
    /// Lock key for one node, namespaced under the configured prefix.
    pub fn node_lock_key(&self, nodename: &str) -> String {
        format!(
            "{}/{}_{}",
            self.etcd_lock_prefix, self.scheduler.lock_key, nodename
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.fan_out, 10);
        assert_eq!(cfg.cas_retry, 3);
        assert_eq!(cfg.scheduler.sharebase, 100);
        assert_eq!(cfg.scheduler.sched_type, "simple");
    }

    #[test]
    fn node_lock_key_is_namespaced() {
        let cfg = Config::default();
        assert_eq!(cfg.node_lock_key("n1"), "/eru-core/_lock/core_n1");
    }
}
