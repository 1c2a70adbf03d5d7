//! Resource reconciliation and remap.
//!
//! Reconciliation is observation-first: `node_resource` reports how the
//! plugins' records compare to the workloads the store knows about, and
//! only persists corrections when `fix` is requested. Engine inspection
//! failures become diffs, never errors: read operations are best-effort,
//! write operations are all-or-nothing.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info};

use eru_engine::RemapMessage;
use eru_types::{CoreError, CoreResult, Node};

use super::{Calcium, NodeResource};

impl Calcium {
    /// One node's resource view and diffs, under the node lock.
    ///
    /// Read-only unless `fix`: two consecutive calls with `fix = false`
    /// return identical info and leave the store untouched.
    pub async fn node_resource(&self, nodename: &str, fix: bool) -> CoreResult<NodeResource> {
        if nodename.is_empty() {
            return Err(CoreError::EmptyNodeName);
        }
        let (guard, node, _) = self.lock_node(nodename).await?;
        let result = self.node_resource_locked(&node, fix).await;
        drop(guard);
        result
    }

    async fn node_resource_locked(&self, node: &Node, fix: bool) -> CoreResult<NodeResource> {
        let workloads = self.list_node_workloads(&node.name).await?;
        let (resource_info, mut diffs) = self
            .resource
            .get_node_resource_info(&node.name, &workloads, fix)
            .await
            .map_err(CoreError::from)?;

        // inspection failures are diagnostics, not failures of the pass
        match self.node_engine(node).await {
            Ok(engine) => {
                for workload in &workloads {
                    if let Err(err) = engine.virtualization_inspect(&workload.id).await {
                        diffs.push(format!("{}: inspect failed: {}", workload.id, err));
                    }
                }
            }
            Err(err) => diffs.push(format!("engine unreachable: {err}")),
        }

        Ok(NodeResource {
            name: node.name.clone(),
            resource_info,
            diffs,
        })
    }

    /// Reconcile every node of a pod, streaming per-node results.
    ///
    /// Failing to enumerate the pod's nodes fails the call before any
    /// stream exists; after that, per-node failures are carried inside
    /// the emitted items as diffs.
    pub async fn pod_resource(&self, podname: &str) -> CoreResult<ReceiverStream<NodeResource>> {
        let nodes = self.get_nodes_by_pod(podname, true).await?;
        info!(podname, nodes = nodes.len(), "pod reconcile starting");

        let (tx, rx) = mpsc::channel(16);
        let semaphore = Arc::new(Semaphore::new(self.config.fan_out.max(1)));
        for node in nodes {
            let this = self.clone();
            let tx = tx.clone();
            let semaphore = Arc::clone(&semaphore);
            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let result = match this.node_resource(&node.name, false).await {
                    Ok(result) => result,
                    Err(err) => NodeResource {
                        name: node.name.clone(),
                        diffs: vec![err.to_string()],
                        ..Default::default()
                    },
                };
                let _ = tx.send(result).await;
            });
        }
        Ok(ReceiverStream::new(rx))
    }

    /// Recompute engine args from current resource args and push them to
    /// the node's running containers.
    ///
    /// Per-container failures are reported in the returned messages and
    /// do not abort the others.
    pub async fn remap_resource(&self, node: &Node) -> CoreResult<Vec<RemapMessage>> {
        let workloads = self.list_node_workloads(&node.name).await?;
        if workloads.is_empty() {
            return Ok(Vec::new());
        }
        let remap_args = self
            .resource
            .get_remap_args(&node.name, &workloads)
            .await
            .map_err(CoreError::from)?;
        if remap_args.is_empty() {
            return Ok(Vec::new());
        }

        let engine = self.node_engine(node).await?;
        let mut rx = engine.virtualization_resource_remap(remap_args).await?;
        let mut messages = Vec::new();
        while let Some(message) = rx.recv().await {
            messages.push(message);
        }
        Ok(messages)
    }

    /// Remap with failures logged instead of surfaced; used after
    /// mutations and by the periodic worker.
    pub async fn do_remap_resource_and_log(&self, node: &Node) {
        match self.remap_resource(node).await {
            Ok(messages) => {
                for message in messages {
                    match message.error {
                        Some(err) => error!(
                            workload_id = %message.workload_id,
                            nodename = %node.name,
                            error = %err,
                            "remap failed"
                        ),
                        None => debug!(
                            workload_id = %message.workload_id,
                            nodename = %node.name,
                            "remap applied"
                        ),
                    }
                }
            }
            Err(err) => error!(nodename = %node.name, error = %err, "remap pass failed"),
        }
    }
}
