//! Periodic remap worker.
//!
//! Runs the remap pass over every node on an interval, realigning
//! running containers with their recorded resource args after capacity
//! changes or drifts.

use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info};

use crate::cluster::Calcium;

/// Background worker driving periodic remaps.
pub struct RemapWorker {
    calcium: Calcium,
    interval: Duration,
}

impl RemapWorker {
    pub fn new(calcium: Calcium, interval: Duration) -> Self {
        Self { calcium, interval }
    }

    /// Run until shutdown is signaled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "remap worker starting");

        let mut interval = tokio::time::interval(self.interval);
        // skip the immediate first tick
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_pass().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("remap worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn run_pass(&self) {
        let nodes = match self.calcium.list_nodes().await {
            Ok(nodes) => nodes,
            Err(err) => {
                error!(error = %err, "remap pass could not list nodes");
                return;
            }
        };
        for node in nodes {
            if !node.available {
                continue;
            }
            self.calcium.do_remap_resource_and_log(&node).await;
        }
    }
}
