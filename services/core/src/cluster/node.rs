//! Node administration.

use std::collections::HashMap;

use serde_json::Value;
use tracing::info;

use eru_store::put_json;
use eru_types::{CoreError, CoreResult, Node, NodeResourceInfo};

use super::{node_key, Calcium};

/// Registration request for a new node.
#[derive(Debug, Clone, Default)]
pub struct AddNodeOptions {
    pub name: String,
    pub podname: String,
    pub endpoint: String,
    pub labels: HashMap<String, String>,
    /// Initial per-plugin capacities, keyed by plugin name.
    pub resources: HashMap<String, Value>,
}

impl Calcium {
    /// Register a node and its initial capacity with every plugin.
    pub async fn add_node(&self, opts: AddNodeOptions) -> CoreResult<Node> {
        if opts.name.is_empty() {
            return Err(CoreError::EmptyNodeName);
        }

        let info = self
            .resource
            .add_node(&opts.name, &opts.resources)
            .await
            .map_err(CoreError::from)?;

        let node = Node {
            name: opts.name.clone(),
            podname: opts.podname,
            endpoint: opts.endpoint,
            labels: opts.labels,
            available: true,
        };
        if let Err(err) = put_json(self.store.as_ref(), &node_key(&node.name), &node, Some(0)).await
        {
            // undo the plugin registrations before surfacing
            let _ = self.resource.remove_node(&opts.name).await;
            return Err(err.into());
        }
        info!(nodename = %node.name, podname = %node.podname, plugins = info.len(), "node registered");
        Ok(node)
    }

    /// Delete a node that no workloads reference.
    pub async fn remove_node(&self, nodename: &str) -> CoreResult<()> {
        let (guard, node, _) = self.lock_node(nodename).await?;
        if !self.list_node_workloads(nodename).await?.is_empty() {
            return Err(CoreError::NodeOccupied(nodename.to_string()));
        }
        self.resource
            .remove_node(nodename)
            .await
            .map_err(CoreError::from)?;
        self.store
            .delete(&node_key(nodename))
            .await
            .map_err(CoreError::from)?;
        info!(nodename = %node.name, "node removed");
        drop(guard);
        Ok(())
    }

    /// Flip a node's availability flag.
    pub async fn set_node_status(&self, nodename: &str, available: bool) -> CoreResult<Node> {
        let (guard, mut node, revision) = self.lock_node(nodename).await?;
        node.available = available;
        self.commit_node(&node, revision).await?;
        info!(nodename = %node.name, available, "node status updated");
        drop(guard);
        Ok(node)
    }

    /// Overwrite or shift a node's per-plugin capacity.
    pub async fn set_node_resource_capacity(
        &self,
        nodename: &str,
        values: HashMap<String, Value>,
        delta: bool,
    ) -> CoreResult<HashMap<String, NodeResourceInfo>> {
        let (guard, node, revision) = self.lock_node(nodename).await?;
        let info = self
            .resource
            .set_node_resource_capacity(nodename, &values, delta)
            .await
            .map_err(CoreError::from)?;
        self.commit_node(&node, revision).await?;
        drop(guard);
        Ok(info)
    }

    /// Overwrite or shift a node's per-plugin usage.
    pub async fn set_node_resource_usage(
        &self,
        nodename: &str,
        values: HashMap<String, Value>,
        delta: bool,
    ) -> CoreResult<HashMap<String, NodeResourceInfo>> {
        let (guard, node, revision) = self.lock_node(nodename).await?;
        let info = self
            .resource
            .set_node_resource_usage(nodename, &values, delta)
            .await
            .map_err(CoreError::from)?;
        self.commit_node(&node, revision).await?;
        drop(guard);
        Ok(info)
    }
}
