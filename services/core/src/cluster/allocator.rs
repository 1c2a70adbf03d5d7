//! Node allocation planning.
//!
//! Selecting nodes and counts for a deploy is a read-only computation:
//! the plan is a pure function of the store snapshot and the request.
//! Mutation happens later, per node, under the node lock.

use tracing::debug;

use eru_types::{CoreError, CoreResult, Node};

use crate::strategy::{self, StrategyInfo};

use super::{Calcium, DeployOptions, NodeFilter};

impl Calcium {
    /// Compute the `(node, count)` plan for a deploy.
    ///
    /// The returned order is deterministic: capacity descending, usage
    /// rate ascending, then name ascending. Nodes assigned zero replicas
    /// are elided.
    pub async fn alloc_plan(&self, opts: &DeployOptions) -> CoreResult<Vec<(Node, i64)>> {
        if opts.count <= 0 {
            return Err(CoreError::InvalidCount(opts.count));
        }

        let nodes = self.filter_nodes(&opts.podname, &opts.node_filter).await?;
        let nodenames: Vec<String> = nodes.iter().map(|node| node.name.clone()).collect();

        let capacities = self
            .resource
            .get_nodes_deploy_capacity(&nodenames, &opts.resource_requests)
            .await
            .map_err(CoreError::from)?;

        let mut infos = Vec::new();
        for node in &nodes {
            let Some(info) = capacities.get(&node.name) else {
                continue;
            };
            if info.capacity == 0 {
                continue;
            }
            let deployed = self.list_node_workloads(&node.name).await?.len() as i64;
            infos.push(StrategyInfo {
                nodename: node.name.clone(),
                capacity: info.capacity,
                usage_rate: info.usage_rate,
                count: deployed,
            });
        }

        let available = infos
            .iter()
            .fold(0i64, |acc, info| acc.saturating_add(info.capacity));
        if available < opts.count {
            return Err(CoreError::InsufficientResource {
                need: opts.count,
                available,
            });
        }

        let deploy_map = strategy::plan(opts.strategy, &infos, opts.count, opts.each_limit)?;
        debug!(podname = %opts.podname, candidates = infos.len(), ?deploy_map, "deploy plan computed");

        // deterministic plan order, zero-count nodes elided
        let mut ordered = infos;
        ordered.sort_by(|a, b| {
            b.capacity
                .cmp(&a.capacity)
                .then(a.usage_rate.total_cmp(&b.usage_rate))
                .then(a.nodename.cmp(&b.nodename))
        });

        let mut plan = Vec::new();
        for info in ordered {
            let count = deploy_map.get(&info.nodename).copied().unwrap_or(0);
            if count == 0 {
                continue;
            }
            let node = nodes
                .iter()
                .find(|node| node.name == info.nodename)
                .cloned()
                .ok_or_else(|| CoreError::NodeNotFound(info.nodename.clone()))?;
            plan.push((node, count));
        }
        Ok(plan)
    }

    /// Enumerate pod nodes and apply the request's node filter.
    async fn filter_nodes(&self, podname: &str, filter: &NodeFilter) -> CoreResult<Vec<Node>> {
        let mut nodes = if filter.includes.is_empty() {
            self.get_nodes_by_pod(podname, filter.all).await?
        } else {
            let mut nodes = Vec::new();
            for nodename in &filter.includes {
                let (node, _) = self.get_node(nodename).await?;
                if node.available || filter.all {
                    nodes.push(node);
                }
            }
            nodes
        };
        nodes.retain(|node| {
            !filter.excludes.contains(&node.name) && node.matches_labels(&filter.labels)
        });
        Ok(nodes)
    }
}
