//! Workload creation: the locked mutation driver.
//!
//! Distinct nodes proceed in parallel under a bounded fan-out; work on
//! one node is serialized by its distributed lock. The deploy deadline
//! covers lock acquisition and plugin allocation; once the node commit
//! starts, the critical section runs to completion (atomicity beats
//! promptness). Partial success is first-class: replicas committed
//! before a failure stay, and every replica's outcome flows through the
//! result stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use eru_engine::{Engine, VirtualizationParams};
use eru_store::put_json;
use eru_types::{CoreError, CoreResult, Node, Workload, WorkloadStatus};

use super::{workload_index_key, workload_key, Calcium, CreateWorkloadMessage, DeployOptions};

fn new_workload_id(name: &str, nodename: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(nodename.as_bytes());
    hasher.update(Uuid::new_v4().as_bytes());
    hex::encode(hasher.finalize())
}

impl Calcium {
    /// Deploy workloads across the pod.
    ///
    /// Planning failures surface as the function error; from then on
    /// per-replica outcomes arrive on the returned stream, which ends
    /// once every planned node has been driven. Dropping the receiver
    /// early stops the producers and releases unused reservations.
    pub async fn create_workloads(
        &self,
        opts: DeployOptions,
    ) -> CoreResult<ReceiverStream<CreateWorkloadMessage>> {
        let plan = self.alloc_plan(&opts).await?;
        info!(
            name = %opts.name,
            podname = %opts.podname,
            count = opts.count,
            nodes = plan.len(),
            "workload deploy starting"
        );

        let opts = Arc::new(opts);
        let (tx, rx) = mpsc::channel(16);
        let semaphore = Arc::new(Semaphore::new(self.config.fan_out.max(1)));

        for (node, count) in plan {
            let this = self.clone();
            let opts = Arc::clone(&opts);
            let tx = tx.clone();
            let semaphore = Arc::clone(&semaphore);
            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                this.create_on_node(&opts, node, count, &tx).await;
            });
        }
        Ok(ReceiverStream::new(rx))
    }

    async fn create_on_node(
        &self,
        opts: &DeployOptions,
        node: Node,
        count: i64,
        tx: &mpsc::Sender<CreateWorkloadMessage>,
    ) {
        let nodename = node.name.clone();
        let count = count as usize;
        let deadline = Duration::from_secs(self.config.timeout.create_workload);

        // lock, re-read, allocate: abortable until the commit starts
        let prepared = tokio::time::timeout(deadline, async {
            let (guard, node, revision) = self.lock_node(&nodename).await?;
            let (engine_args, resource_args, _tokens) = self
                .resource
                .alloc(&nodename, count, &opts.resource_requests)
                .await
                .map_err(CoreError::from)?;
            Ok::<_, CoreError>((guard, node, revision, engine_args, resource_args))
        })
        .await;

        let (guard, node, revision, engine_args, resource_args) = match prepared {
            Ok(Ok(prepared)) => prepared,
            Ok(Err(err)) => {
                self.emit_failures(tx, &nodename, count, &err).await;
                return;
            }
            Err(_) => {
                self.emit_failures(tx, &nodename, count, &CoreError::DeadlineExceeded)
                    .await;
                return;
            }
        };

        // the commit point: CAS on the node revision
        if let Err(err) = self.commit_node(&node, revision).await {
            self.release_reservations(&nodename, &resource_args).await;
            self.emit_failures(tx, &nodename, count, &err).await;
            return;
        }

        let engine = match self.node_engine(&node).await {
            Ok(engine) => engine,
            Err(err) => {
                self.release_reservations(&nodename, &resource_args).await;
                self.emit_failures(tx, &nodename, count, &err).await;
                return;
            }
        };

        for i in 0..count {
            let workload = Workload {
                id: new_workload_id(&opts.name, &nodename),
                name: opts.name.clone(),
                podname: opts.podname.clone(),
                nodename: nodename.clone(),
                image: opts.image.clone(),
                resource_args: resource_args[i].clone(),
                engine_args: engine_args[i].clone(),
                status: WorkloadStatus::Running,
            };
            let workload_id = workload.id.clone();

            let message = match self.start_workload(engine.as_ref(), &workload, opts).await {
                Ok(()) => {
                    debug!(workload_id = %workload_id, nodename = %nodename, "workload created");
                    CreateWorkloadMessage {
                        nodename: nodename.clone(),
                        workload_id: Some(workload_id),
                        error: None,
                    }
                }
                Err(err) => {
                    warn!(nodename = %nodename, error = %err, "replica creation failed");
                    self.release_reservations(&nodename, &resource_args[i..=i]).await;
                    CreateWorkloadMessage {
                        nodename: nodename.clone(),
                        workload_id: None,
                        error: Some(err.to_string()),
                    }
                }
            };

            if tx.send(message).await.is_err() {
                // consumer gone: release what the untouched replicas hold
                debug!(nodename = %nodename, "deploy consumer dropped, stopping");
                if i + 1 < count {
                    self.release_reservations(&nodename, &resource_args[i + 1..]).await;
                }
                return;
            }
        }

        drop(guard);
        self.do_remap_resource_and_log(&node).await;
    }

    /// Create and start one replica; any failure undoes its records.
    async fn start_workload(
        &self,
        engine: &dyn Engine,
        workload: &Workload,
        opts: &DeployOptions,
    ) -> CoreResult<()> {
        engine.resource_validate(&workload.engine_args).await?;

        put_json(
            self.store.as_ref(),
            &workload_key(&workload.nodename, &workload.id),
            workload,
            None,
        )
        .await
        .map_err(CoreError::from)?;
        self.store
            .put(
                &workload_index_key(&workload.id),
                workload.nodename.clone().into_bytes(),
                None,
            )
            .await
            .map_err(CoreError::from)?;

        let params = VirtualizationParams {
            name: workload.id.clone(),
            image: workload.image.clone(),
            engine_args: workload.engine_args.clone(),
            labels: opts.labels.clone(),
        };
        let created = match engine.virtualization_create(params).await {
            Ok(created) => created,
            Err(err) => {
                self.erase_workload_records(workload).await;
                return Err(err.into());
            }
        };
        if let Err(err) = engine.virtualization_start(&created.id).await {
            let _ = engine.virtualization_remove(&created.id).await;
            self.erase_workload_records(workload).await;
            return Err(err.into());
        }
        Ok(())
    }

    async fn erase_workload_records(&self, workload: &Workload) {
        let _ = self
            .store
            .delete(&workload_key(&workload.nodename, &workload.id))
            .await;
        let _ = self.store.delete(&workload_index_key(&workload.id)).await;
    }

    pub(crate) async fn release_reservations(
        &self,
        nodename: &str,
        resource_args: &[HashMap<String, Value>],
    ) {
        if resource_args.is_empty() {
            return;
        }
        if let Err(err) = self.resource.free(nodename, resource_args).await {
            warn!(
                nodename,
                error = %err,
                "failed to release reservations, a fix pass will reconcile"
            );
        }
    }

    async fn emit_failures(
        &self,
        tx: &mpsc::Sender<CreateWorkloadMessage>,
        nodename: &str,
        count: usize,
        err: &CoreError,
    ) {
        for _ in 0..count {
            let message = CreateWorkloadMessage {
                nodename: nodename.to_string(),
                workload_id: None,
                error: Some(err.to_string()),
            };
            if tx.send(message).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workload_ids_are_64_hex_and_unique() {
        let a = new_workload_id("app", "n1");
        let b = new_workload_id("app", "n1");
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
