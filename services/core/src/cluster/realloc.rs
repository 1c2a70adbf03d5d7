//! Workload reallocation.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use eru_store::put_json;
use eru_types::{CoreError, CoreResult};

use super::{workload_key, Calcium};

impl Calcium {
    /// Adjust one workload's reservation by per-plugin delta requests.
    ///
    /// Runs under the owning node's lock: plugins recompute both arg
    /// maps, the workload record is persisted, the node commit bumps the
    /// revision, and the fresh engine args are pushed to the running
    /// container. The realloc deadline covers lock acquisition and the
    /// plugin calls; the commit runs to completion once reached.
    pub async fn realloc_workload(
        &self,
        workload_id: &str,
        deltas: HashMap<String, Value>,
    ) -> CoreResult<()> {
        let nodename = self.workload_nodename(workload_id).await?;
        let deadline = Duration::from_secs(self.config.timeout.realloc);
        let prepared = tokio::time::timeout(deadline, async {
            let locked = self.lock_node(&nodename).await?;
            let workload = self.get_workload(workload_id).await?;
            let args = self
                .resource
                .realloc(&nodename, &workload.resource_args, &deltas)
                .await
                .map_err(CoreError::from)?;
            Ok::<_, CoreError>((locked, workload, args))
        })
        .await
        .map_err(|_| CoreError::DeadlineExceeded)??;
        let ((guard, node, revision), mut workload, (engine_args, resource_args)) = prepared;

        workload.engine_args = engine_args.clone();
        workload.resource_args = resource_args;
        put_json(
            self.store.as_ref(),
            &workload_key(&nodename, workload_id),
            &workload,
            None,
        )
        .await
        .map_err(CoreError::from)?;
        self.commit_node(&node, revision).await?;

        // push the recomputed args to the running container
        let engine = self.node_engine(&node).await?;
        let mut remap_args = HashMap::new();
        remap_args.insert(workload_id.to_string(), engine_args);
        match engine.virtualization_resource_remap(remap_args).await {
            Ok(mut rx) => {
                while let Some(message) = rx.recv().await {
                    if let Some(err) = message.error {
                        warn!(workload_id = %message.workload_id, error = %err, "remap after realloc failed");
                    }
                }
            }
            Err(err) => warn!(workload_id, error = %err, "remap call after realloc failed"),
        }

        info!(workload_id, nodename = %nodename, "workload reallocated");
        drop(guard);
        Ok(())
    }
}
