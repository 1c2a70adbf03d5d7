//! The cluster service.
//!
//! `Calcium` glues the store, the container engines, and the resource
//! plugin aggregator together. Mutations of node or workload state all
//! follow the same discipline: acquire the node's distributed lock,
//! re-read, invoke the plugins, persist with a CAS against the node
//! revision, release the lock.

mod allocator;
mod create;
mod lock;
mod node;
mod realloc;
mod remove;
mod resource;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use eru_engine::EngineFactory;
use eru_resource::Aggregator;
use eru_store::{get_json, Store};
use eru_types::{Config, CoreError, CoreResult, Node, NodeResourceInfo, Workload};

use crate::strategy::Strategy;

pub use node::AddNodeOptions;

const NODE_PREFIX: &str = "/nodes/";
const WORKLOAD_PREFIX: &str = "/workloads/";
const WORKLOAD_INDEX_PREFIX: &str = "/workload-index/";

fn node_key(nodename: &str) -> String {
    format!("{NODE_PREFIX}{nodename}")
}

fn workload_key(nodename: &str, workload_id: &str) -> String {
    format!("{WORKLOAD_PREFIX}{nodename}/{workload_id}")
}

fn workload_index_key(workload_id: &str) -> String {
    format!("{WORKLOAD_INDEX_PREFIX}{workload_id}")
}

/// Which nodes of a pod a deploy may use.
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    /// Only these nodes, when non-empty.
    pub includes: Vec<String>,
    pub excludes: Vec<String>,
    /// Required node labels.
    pub labels: HashMap<String, String>,
    /// Consider unavailable nodes too.
    pub all: bool,
}

/// A workload deployment request.
#[derive(Debug, Clone)]
pub struct DeployOptions {
    pub name: String,
    pub podname: String,
    pub image: String,
    pub count: i64,
    pub strategy: Strategy,
    /// Per-node limit used by the fill and each strategies.
    pub each_limit: i64,
    /// Opaque per-plugin resource requests, keyed by plugin name.
    pub resource_requests: HashMap<String, Value>,
    pub node_filter: NodeFilter,
    pub labels: HashMap<String, String>,
}

/// Per-replica outcome of a deploy, emitted on the result stream.
#[derive(Debug, Clone)]
pub struct CreateWorkloadMessage {
    pub nodename: String,
    pub workload_id: Option<String>,
    pub error: Option<String>,
}

/// Per-workload outcome of a removal.
#[derive(Debug, Clone)]
pub struct RemoveWorkloadMessage {
    pub workload_id: String,
    pub error: Option<String>,
}

/// One node's reconciliation result.
#[derive(Debug, Clone, Default)]
pub struct NodeResource {
    pub name: String,
    /// Per-plugin capacity and usage, keyed by plugin name.
    pub resource_info: HashMap<String, NodeResourceInfo>,
    pub diffs: Vec<String>,
}

/// The cluster service.
#[derive(Clone)]
pub struct Calcium {
    config: Config,
    store: Arc<dyn Store>,
    engines: Arc<dyn EngineFactory>,
    resource: Aggregator,
}

impl Calcium {
    pub fn new(
        config: Config,
        store: Arc<dyn Store>,
        engines: Arc<dyn EngineFactory>,
        resource: Aggregator,
    ) -> Self {
        Self {
            config,
            store,
            engines,
            resource,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Read one node and its record revision.
    pub async fn get_node(&self, nodename: &str) -> CoreResult<(Node, u64)> {
        if nodename.is_empty() {
            return Err(CoreError::EmptyNodeName);
        }
        get_json::<Node>(self.store.as_ref(), &node_key(nodename))
            .await?
            .ok_or_else(|| CoreError::NodeNotFound(nodename.to_string()))
    }

    /// All nodes of a pod; unavailable nodes only with `all`.
    pub async fn get_nodes_by_pod(&self, podname: &str, all: bool) -> CoreResult<Vec<Node>> {
        let entries = self.store.list(NODE_PREFIX).await.map_err(CoreError::from)?;
        let mut nodes = Vec::new();
        for entry in entries {
            let node: Node = serde_json::from_slice(&entry.value)
                .map_err(|e| CoreError::Store(e.to_string()))?;
            if node.podname == podname && (all || node.available) {
                nodes.push(node);
            }
        }
        Ok(nodes)
    }

    /// All nodes known to the store.
    pub async fn list_nodes(&self) -> CoreResult<Vec<Node>> {
        let entries = self.store.list(NODE_PREFIX).await.map_err(CoreError::from)?;
        entries
            .iter()
            .map(|entry| {
                serde_json::from_slice(&entry.value).map_err(|e| CoreError::Store(e.to_string()))
            })
            .collect()
    }

    /// Workloads recorded on one node, ordered by id.
    pub async fn list_node_workloads(&self, nodename: &str) -> CoreResult<Vec<Workload>> {
        let prefix = format!("{WORKLOAD_PREFIX}{nodename}/");
        let entries = self.store.list(&prefix).await.map_err(CoreError::from)?;
        entries
            .iter()
            .map(|entry| {
                serde_json::from_slice(&entry.value).map_err(|e| CoreError::Store(e.to_string()))
            })
            .collect()
    }

    /// Load one workload by id via the node index.
    pub async fn get_workload(&self, workload_id: &str) -> CoreResult<Workload> {
        let nodename = self.workload_nodename(workload_id).await?;
        get_json::<Workload>(self.store.as_ref(), &workload_key(&nodename, workload_id))
            .await?
            .map(|(workload, _)| workload)
            .ok_or_else(|| CoreError::WorkloadNotFound(workload_id.to_string()))
    }

    pub(crate) async fn workload_nodename(&self, workload_id: &str) -> CoreResult<String> {
        match self
            .store
            .get(&workload_index_key(workload_id))
            .await
            .map_err(CoreError::from)?
        {
            Some(kv) => Ok(String::from_utf8_lossy(&kv.value).into_owned()),
            None => Err(CoreError::WorkloadNotFound(workload_id.to_string())),
        }
    }

    pub(crate) async fn node_engine(&self, node: &Node) -> CoreResult<Arc<dyn eru_engine::Engine>> {
        Ok(self.engines.make(&node.endpoint).await?)
    }
}
