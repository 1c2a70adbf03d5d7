//! Plugin aggregator.
//!
//! Fans each operation out over every registered plugin in parallel and
//! merges per-plugin outcomes:
//!
//! - `alloc`/`realloc`/`add_node` are all-or-nothing: if any plugin
//!   fails, every plugin that succeeded is rolled back with its token and
//!   the first failure is surfaced.
//! - `get_nodes_deploy_capacity` intersects candidate node sets; per
//!   surviving node capacity is the minimum and usage rate the maximum
//!   across plugins (the tightest dimension rules).
//! - `get_node_resource_info` is best-effort: plugin failures become
//!   diffs and the merge continues.
//!
//! Merged args maps are keyed by plugin name and never merged by value,
//! so plugins stay independent dimensions.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use serde_json::Value;
use tracing::{error, warn};

use eru_types::{NodeResourceInfo, Workload};

use crate::error::ResourceError;
use crate::{NodeCapacityInfo, Plugin, ResourceResult, RollbackToken};

/// Engine args and resource args for a batch of replicas, keyed by
/// plugin name per replica.
pub type ReplicaArgs = Vec<HashMap<String, Value>>;

/// The set of plugins, discovered at startup and frozen for process
/// lifetime.
#[derive(Clone)]
pub struct Aggregator {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl Aggregator {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self { plugins }
    }

    pub fn plugins(&self) -> &[Arc<dyn Plugin>] {
        &self.plugins
    }

    fn request_for<'a>(requests: &'a HashMap<String, Value>, plugin: &str) -> &'a Value {
        requests.get(plugin).unwrap_or(&Value::Null)
    }

    /// Merged deploy capacity over all plugins.
    pub async fn get_nodes_deploy_capacity(
        &self,
        nodenames: &[String],
        requests: &HashMap<String, Value>,
    ) -> ResourceResult<HashMap<String, NodeCapacityInfo>> {
        let futures = self.plugins.iter().map(|plugin| {
            let request = Self::request_for(requests, plugin.name());
            plugin.get_nodes_deploy_capacity(nodenames, request)
        });
        let outcomes = join_all(futures).await;

        let mut merged: Option<HashMap<String, NodeCapacityInfo>> = None;
        for outcome in outcomes {
            let infos = outcome?;
            merged = Some(match merged {
                None => infos,
                Some(mut acc) => {
                    // intersect: a node missing from any plugin is out
                    acc.retain(|nodename, _| infos.contains_key(nodename));
                    for (nodename, info) in infos {
                        if let Some(have) = acc.get_mut(&nodename) {
                            have.capacity = have.capacity.min(info.capacity);
                            have.usage_rate = have.usage_rate.max(info.usage_rate);
                        }
                    }
                    acc
                }
            });
        }
        Ok(merged.unwrap_or_default())
    }

    /// Reserve `count` replicas on a node across every plugin.
    ///
    /// Returns per-replica engine args and resource args maps, plus the
    /// tokens needed to undo the whole reservation.
    pub async fn alloc(
        &self,
        nodename: &str,
        count: usize,
        requests: &HashMap<String, Value>,
    ) -> ResourceResult<(ReplicaArgs, ReplicaArgs, Vec<RollbackToken>)> {
        let futures = self.plugins.iter().map(|plugin| {
            let request = Self::request_for(requests, plugin.name());
            plugin.alloc(nodename, count, request)
        });
        let outcomes = join_all(futures).await;

        let mut engine_args: ReplicaArgs = vec![HashMap::new(); count];
        let mut resource_args: ReplicaArgs = vec![HashMap::new(); count];
        let mut tokens = Vec::new();
        let mut first_error = None;

        for (plugin, outcome) in self.plugins.iter().zip(outcomes) {
            match outcome {
                Ok((response, token)) => {
                    for (i, args) in response.engine_args.into_iter().enumerate().take(count) {
                        engine_args[i].insert(plugin.name().to_string(), args);
                    }
                    for (i, args) in response.resource_args.into_iter().enumerate().take(count) {
                        resource_args[i].insert(plugin.name().to_string(), args);
                    }
                    tokens.push(token);
                }
                Err(err) if first_error.is_none() => first_error = Some(err),
                Err(err) => warn!(plugin = plugin.name(), error = %err, "alloc failed after another plugin"),
            }
        }

        if let Some(err) = first_error {
            self.rollback(&tokens).await;
            return Err(err);
        }
        Ok((engine_args, resource_args, tokens))
    }

    /// Adjust one workload's reservation across every plugin.
    pub async fn realloc(
        &self,
        nodename: &str,
        origin: &HashMap<String, Value>,
        deltas: &HashMap<String, Value>,
    ) -> ResourceResult<(HashMap<String, Value>, HashMap<String, Value>)> {
        let futures = self.plugins.iter().map(|plugin| {
            let origin_args = Self::request_for(origin, plugin.name());
            let delta = Self::request_for(deltas, plugin.name());
            plugin.realloc(nodename, origin_args, delta)
        });
        let outcomes = join_all(futures).await;

        let mut engine_args = HashMap::new();
        let mut resource_args = HashMap::new();
        let mut tokens = Vec::new();
        let mut first_error = None;

        for (plugin, outcome) in self.plugins.iter().zip(outcomes) {
            match outcome {
                Ok((response, token)) => {
                    engine_args.insert(plugin.name().to_string(), response.engine_args);
                    resource_args.insert(plugin.name().to_string(), response.resource_args);
                    tokens.push(token);
                }
                Err(err) if first_error.is_none() => first_error = Some(err),
                Err(err) => {
                    warn!(plugin = plugin.name(), error = %err, "realloc failed after another plugin")
                }
            }
        }

        if let Some(err) = first_error {
            self.rollback(&tokens).await;
            return Err(err);
        }
        Ok((engine_args, resource_args))
    }

    /// Release the reservations recorded in per-replica resource args.
    pub async fn free(
        &self,
        nodename: &str,
        resource_args: &[HashMap<String, Value>],
    ) -> ResourceResult<()> {
        let futures = self.plugins.iter().map(|plugin| {
            let release: Vec<Value> = resource_args
                .iter()
                .filter_map(|args| args.get(plugin.name()).cloned())
                .collect();
            let token = RollbackToken {
                plugin: plugin.name().to_string(),
                nodename: nodename.to_string(),
                release,
                reapply: Vec::new(),
            };
            let plugin = plugin.clone();
            async move { plugin.free(&token).await }
        });
        for outcome in join_all(futures).await {
            outcome?;
        }
        Ok(())
    }

    /// Merged node resource info; plugin failures become diffs.
    pub async fn get_node_resource_info(
        &self,
        nodename: &str,
        workloads: &[Workload],
        fix: bool,
    ) -> ResourceResult<(HashMap<String, NodeResourceInfo>, Vec<String>)> {
        let futures = self
            .plugins
            .iter()
            .map(|plugin| plugin.get_node_resource_info(nodename, workloads, fix));
        let outcomes = join_all(futures).await;

        let mut info = HashMap::new();
        let mut diffs = Vec::new();
        for (plugin, outcome) in self.plugins.iter().zip(outcomes) {
            match outcome {
                Ok((plugin_info, plugin_diffs)) => {
                    info.insert(plugin.name().to_string(), plugin_info);
                    diffs.extend(plugin_diffs);
                }
                Err(err) => diffs.push(format!("plugin {}: {}", plugin.name(), err)),
            }
        }
        Ok((info, diffs))
    }

    /// Fresh engine args per workload, keyed workload id → plugin → args.
    pub async fn get_remap_args(
        &self,
        nodename: &str,
        workloads: &[Workload],
    ) -> ResourceResult<HashMap<String, HashMap<String, Value>>> {
        let futures = self
            .plugins
            .iter()
            .map(|plugin| plugin.get_remap_args(nodename, workloads));
        let outcomes = join_all(futures).await;

        let mut merged: HashMap<String, HashMap<String, Value>> = HashMap::new();
        for (plugin, outcome) in self.plugins.iter().zip(outcomes) {
            for (workload_id, args) in outcome? {
                merged
                    .entry(workload_id)
                    .or_default()
                    .insert(plugin.name().to_string(), args);
            }
        }
        Ok(merged)
    }

    /// Register a node with every plugin; on partial failure the plugins
    /// that succeeded have the node removed again.
    pub async fn add_node(
        &self,
        nodename: &str,
        requests: &HashMap<String, Value>,
    ) -> ResourceResult<HashMap<String, NodeResourceInfo>> {
        let futures = self.plugins.iter().map(|plugin| {
            let request = Self::request_for(requests, plugin.name());
            plugin.add_node(nodename, request)
        });
        let outcomes = join_all(futures).await;

        let mut info = HashMap::new();
        let mut succeeded = Vec::new();
        let mut first_error = None;
        for (plugin, outcome) in self.plugins.iter().zip(outcomes) {
            match outcome {
                Ok(plugin_info) => {
                    info.insert(plugin.name().to_string(), plugin_info);
                    succeeded.push(plugin.clone());
                }
                Err(err) if first_error.is_none() => first_error = Some(err),
                Err(err) => {
                    warn!(plugin = plugin.name(), error = %err, "add_node failed after another plugin")
                }
            }
        }

        if let Some(err) = first_error {
            for plugin in succeeded {
                if let Err(undo_err) = plugin.remove_node(nodename).await {
                    error!(plugin = plugin.name(), error = %undo_err, "add_node rollback failed");
                }
            }
            return Err(err);
        }
        Ok(info)
    }

    /// Drop the node from every plugin.
    pub async fn remove_node(&self, nodename: &str) -> ResourceResult<()> {
        let futures = self.plugins.iter().map(|plugin| plugin.remove_node(nodename));
        for outcome in join_all(futures).await {
            outcome?;
        }
        Ok(())
    }

    /// Overwrite or shift capacity for the plugins named in `values`.
    pub async fn set_node_resource_capacity(
        &self,
        nodename: &str,
        values: &HashMap<String, Value>,
        delta: bool,
    ) -> ResourceResult<HashMap<String, NodeResourceInfo>> {
        let mut info = HashMap::new();
        for plugin in &self.plugins {
            if let Some(value) = values.get(plugin.name()) {
                let plugin_info = plugin
                    .set_node_resource_capacity(nodename, value, delta)
                    .await?;
                info.insert(plugin.name().to_string(), plugin_info);
            }
        }
        Ok(info)
    }

    /// Overwrite or shift usage for the plugins named in `values`.
    pub async fn set_node_resource_usage(
        &self,
        nodename: &str,
        values: &HashMap<String, Value>,
        delta: bool,
    ) -> ResourceResult<HashMap<String, NodeResourceInfo>> {
        let mut info = HashMap::new();
        for plugin in &self.plugins {
            if let Some(value) = values.get(plugin.name()) {
                let plugin_info = plugin.set_node_resource_usage(nodename, value, delta).await?;
                info.insert(plugin.name().to_string(), plugin_info);
            }
        }
        Ok(info)
    }

    async fn rollback(&self, tokens: &[RollbackToken]) {
        for token in tokens {
            let Some(plugin) = self.plugins.iter().find(|p| p.name() == token.plugin) else {
                continue;
            };
            if let Err(err) = plugin.free(token).await {
                error!(
                    plugin = %token.plugin,
                    nodename = %token.nodename,
                    error = %err,
                    "rollback failed, node resource record may need a fix pass"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AllocResponse, ReallocResponse};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Scripted plugin for aggregator behavior tests.
    struct FakePlugin {
        name: String,
        capacity: HashMap<String, (i64, f64)>,
        fail_alloc: bool,
        freed: Arc<AtomicUsize>,
        diffs: Mutex<Vec<String>>,
        fail_info: bool,
    }

    impl FakePlugin {
        fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                capacity: HashMap::new(),
                fail_alloc: false,
                freed: Arc::new(AtomicUsize::new(0)),
                diffs: Mutex::new(Vec::new()),
                fail_info: false,
            }
        }

        fn with_capacity(mut self, nodename: &str, capacity: i64, usage_rate: f64) -> Self {
            self.capacity
                .insert(nodename.to_string(), (capacity, usage_rate));
            self
        }
    }

    #[async_trait]
    impl Plugin for FakePlugin {
        fn name(&self) -> &str {
            &self.name
        }

        async fn get_nodes_deploy_capacity(
            &self,
            nodenames: &[String],
            _request: &Value,
        ) -> ResourceResult<HashMap<String, NodeCapacityInfo>> {
            Ok(nodenames
                .iter()
                .filter_map(|nodename| {
                    self.capacity.get(nodename).map(|(capacity, usage_rate)| {
                        (
                            nodename.clone(),
                            NodeCapacityInfo {
                                nodename: nodename.clone(),
                                capacity: *capacity,
                                usage_rate: *usage_rate,
                            },
                        )
                    })
                })
                .collect())
        }

        async fn alloc(
            &self,
            nodename: &str,
            count: usize,
            _request: &Value,
        ) -> ResourceResult<(AllocResponse, RollbackToken)> {
            if self.fail_alloc {
                return Err(ResourceError::Insufficient {
                    nodename: nodename.to_string(),
                    detail: "scripted".to_string(),
                });
            }
            let args: Vec<Value> = (0..count).map(|i| json!({"replica": i})).collect();
            let token = RollbackToken {
                plugin: self.name.clone(),
                nodename: nodename.to_string(),
                release: args.clone(),
                reapply: Vec::new(),
            };
            Ok((
                AllocResponse {
                    engine_args: args.clone(),
                    resource_args: args,
                },
                token,
            ))
        }

        async fn realloc(
            &self,
            _nodename: &str,
            _origin: &Value,
            _delta: &Value,
        ) -> ResourceResult<(ReallocResponse, RollbackToken)> {
            unimplemented!("not exercised")
        }

        async fn free(&self, _token: &RollbackToken) -> ResourceResult<()> {
            self.freed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn get_node_resource_info(
            &self,
            nodename: &str,
            _workloads: &[Workload],
            _fix: bool,
        ) -> ResourceResult<(NodeResourceInfo, Vec<String>)> {
            if self.fail_info {
                return Err(ResourceError::NodeNotFound(nodename.to_string()));
            }
            let diffs = self.diffs.lock().unwrap_or_else(|e| e.into_inner()).clone();
            Ok((NodeResourceInfo::default(), diffs))
        }

        async fn get_remap_args(
            &self,
            _nodename: &str,
            workloads: &[Workload],
        ) -> ResourceResult<HashMap<String, Value>> {
            Ok(workloads
                .iter()
                .map(|w| (w.id.clone(), json!({"plugin": self.name})))
                .collect())
        }

        async fn set_node_resource_capacity(
            &self,
            _nodename: &str,
            _capacity: &Value,
            _delta: bool,
        ) -> ResourceResult<NodeResourceInfo> {
            Ok(NodeResourceInfo::default())
        }

        async fn set_node_resource_usage(
            &self,
            _nodename: &str,
            _usage: &Value,
            _delta: bool,
        ) -> ResourceResult<NodeResourceInfo> {
            Ok(NodeResourceInfo::default())
        }

        async fn add_node(
            &self,
            _nodename: &str,
            _request: &Value,
        ) -> ResourceResult<NodeResourceInfo> {
            Ok(NodeResourceInfo::default())
        }

        async fn remove_node(&self, nodename: &str) -> ResourceResult<()> {
            self.freed.fetch_add(1, Ordering::SeqCst);
            let _ = nodename;
            Ok(())
        }
    }

    #[tokio::test]
    async fn capacity_is_min_rate_is_max_nodes_intersect() {
        let a = FakePlugin::new("a")
            .with_capacity("n1", 5, 0.1)
            .with_capacity("n2", 3, 0.5);
        let b = FakePlugin::new("b").with_capacity("n1", 2, 0.8);
        let aggregator = Aggregator::new(vec![Arc::new(a), Arc::new(b)]);

        let merged = aggregator
            .get_nodes_deploy_capacity(
                &["n1".to_string(), "n2".to_string()],
                &HashMap::new(),
            )
            .await
            .unwrap();

        // n2 missing from plugin b → dropped
        assert_eq!(merged.len(), 1);
        assert_eq!(merged["n1"].capacity, 2);
        assert_eq!(merged["n1"].usage_rate, 0.8);
    }

    #[tokio::test]
    async fn alloc_merges_args_by_plugin_name() {
        let a = FakePlugin::new("a");
        let b = FakePlugin::new("b");
        let aggregator = Aggregator::new(vec![Arc::new(a), Arc::new(b)]);

        let (engine_args, resource_args, tokens) =
            aggregator.alloc("n1", 2, &HashMap::new()).await.unwrap();
        assert_eq!(engine_args.len(), 2);
        assert_eq!(tokens.len(), 2);
        assert_eq!(engine_args[0]["a"], json!({"replica": 0}));
        assert_eq!(engine_args[1]["b"], json!({"replica": 1}));
        assert_eq!(resource_args[0].len(), 2);
    }

    #[tokio::test]
    async fn alloc_rolls_back_successful_plugins_on_failure() {
        let a = FakePlugin::new("a");
        let a_freed = a.freed.clone();
        let mut b = FakePlugin::new("b");
        b.fail_alloc = true;
        let aggregator = Aggregator::new(vec![Arc::new(a), Arc::new(b)]);

        let err = aggregator.alloc("n1", 1, &HashMap::new()).await.unwrap_err();
        assert!(matches!(err, ResourceError::Insufficient { .. }));
        assert_eq!(a_freed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn info_failures_become_diffs() {
        let a = FakePlugin::new("a");
        a.diffs
            .lock()
            .unwrap()
            .push("device drift".to_string());
        let mut b = FakePlugin::new("b");
        b.fail_info = true;
        let aggregator = Aggregator::new(vec![Arc::new(a), Arc::new(b)]);

        let (info, diffs) = aggregator
            .get_node_resource_info("n1", &[], false)
            .await
            .unwrap();
        // the failing plugin contributes a diff, not an error
        assert_eq!(info.len(), 1);
        assert!(info.contains_key("a"));
        assert_eq!(diffs.len(), 2);
        assert!(diffs.iter().any(|d| d.contains("plugin b")));
    }

    #[tokio::test]
    async fn remap_args_keyed_by_workload_then_plugin() {
        let aggregator = Aggregator::new(vec![
            Arc::new(FakePlugin::new("a")),
            Arc::new(FakePlugin::new("b")),
        ]);
        let workload = Workload {
            id: "w1".to_string(),
            ..Default::default()
        };
        let args = aggregator.get_remap_args("n1", &[workload]).await.unwrap();
        assert_eq!(args["w1"].len(), 2);
        assert_eq!(args["w1"]["a"], json!({"plugin": "a"}));
    }
}
