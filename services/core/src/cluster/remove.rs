//! Workload removal: the inverse of the create driver.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use eru_types::{CoreResult, Workload};

use super::{workload_index_key, workload_key, Calcium, RemoveWorkloadMessage};

impl Calcium {
    /// Remove workloads by id, grouped per node under the node lock.
    ///
    /// Ids that resolve to no workload yield an error message on the
    /// stream rather than failing the call.
    pub async fn remove_workloads(
        &self,
        workload_ids: Vec<String>,
    ) -> CoreResult<ReceiverStream<RemoveWorkloadMessage>> {
        let (tx, rx) = mpsc::channel(16);

        // group by owning node before locking anything
        let mut by_node: HashMap<String, Vec<String>> = HashMap::new();
        for workload_id in workload_ids {
            match self.workload_nodename(&workload_id).await {
                Ok(nodename) => by_node.entry(nodename).or_default().push(workload_id),
                Err(err) => {
                    let _ = tx
                        .send(RemoveWorkloadMessage {
                            workload_id,
                            error: Some(err.to_string()),
                        })
                        .await;
                }
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.config.fan_out.max(1)));
        for (nodename, ids) in by_node {
            let this = self.clone();
            let tx = tx.clone();
            let semaphore = Arc::clone(&semaphore);
            tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                this.remove_on_node(&nodename, ids, &tx).await;
            });
        }
        Ok(ReceiverStream::new(rx))
    }

    async fn remove_on_node(
        &self,
        nodename: &str,
        workload_ids: Vec<String>,
        tx: &mpsc::Sender<RemoveWorkloadMessage>,
    ) {
        let deadline = std::time::Duration::from_secs(self.config.timeout.remove_workload);
        let locked = tokio::time::timeout(deadline, self.lock_node(nodename))
            .await
            .unwrap_or(Err(eru_types::CoreError::DeadlineExceeded));
        let (guard, node, revision) = match locked {
            Ok(locked) => locked,
            Err(err) => {
                for workload_id in workload_ids {
                    let _ = tx
                        .send(RemoveWorkloadMessage {
                            workload_id,
                            error: Some(err.to_string()),
                        })
                        .await;
                }
                return;
            }
        };

        let engine = self.node_engine(&node).await.ok();
        for workload_id in workload_ids {
            let outcome = self.remove_one(nodename, &workload_id, engine.as_deref()).await;
            let message = RemoveWorkloadMessage {
                workload_id: workload_id.clone(),
                error: outcome.err().map(|e| e.to_string()),
            };
            if message.error.is_none() {
                info!(workload_id = %workload_id, nodename, "workload removed");
            }
            if tx.send(message).await.is_err() {
                break;
            }
        }

        if let Err(err) = self.commit_node(&node, revision).await {
            warn!(nodename, error = %err, "node commit after removal failed");
        }
        drop(guard);
    }

    async fn remove_one(
        &self,
        nodename: &str,
        workload_id: &str,
        engine: Option<&dyn eru_engine::Engine>,
    ) -> CoreResult<()> {
        let workload: Workload = eru_store::get_json(
            self.store.as_ref(),
            &workload_key(nodename, workload_id),
        )
        .await
        .map_err(eru_types::CoreError::from)?
        .map(|(workload, _)| workload)
        .ok_or_else(|| eru_types::CoreError::WorkloadNotFound(workload_id.to_string()))?;

        // engine teardown is best-effort; a vanished unit is fine
        if let Some(engine) = engine {
            if let Err(err) = engine.virtualization_stop(workload_id).await {
                warn!(workload_id, error = %err, "stop before removal failed");
            }
            if let Err(err) = engine.virtualization_remove(workload_id).await {
                warn!(workload_id, error = %err, "engine removal failed");
            }
        }

        self.resource
            .free(nodename, std::slice::from_ref(&workload.resource_args))
            .await
            .map_err(eru_types::CoreError::from)?;
        self.store
            .delete(&workload_key(nodename, workload_id))
            .await
            .map_err(eru_types::CoreError::from)?;
        self.store
            .delete(&workload_index_key(workload_id))
            .await
            .map_err(eru_types::CoreError::from)?;
        Ok(())
    }
}
