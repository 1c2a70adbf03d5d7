//! Per-node lock discipline.

use std::time::Duration;

use eru_store::LockGuard;
use eru_types::{CoreResult, Node};

use super::{Calcium, node_key};

impl Calcium {
    /// Acquire the node's distributed lock and re-read the node under it.
    ///
    /// The pre-lock snapshot a caller may hold can be stale; the copy
    /// returned here is the lock holder's property until the guard drops.
    pub(crate) async fn lock_node(&self, nodename: &str) -> CoreResult<(LockGuard, Node, u64)> {
        let lock = self.store.create_lock(
            &self.config.node_lock_key(nodename),
            Duration::from_secs(self.config.scheduler.lock_ttl),
        );
        let guard = lock.lock().await?;
        let (node, revision) = self.get_node(nodename).await?;
        Ok((guard, node, revision))
    }

    /// Commit the node record with a CAS on its revision, retrying a
    /// bounded number of times with backoff.
    ///
    /// Under the node lock a conflict can only come from a writer outside
    /// the lock discipline; after `cas_retry` attempts the node is
    /// declared stale.
    pub(crate) async fn commit_node(&self, node: &Node, mut revision: u64) -> CoreResult<u64> {
        let mut attempt = 0u32;
        loop {
            match eru_store::put_json(self.store.as_ref(), &node_key(&node.name), node, Some(revision))
                .await
            {
                Ok(new_revision) => return Ok(new_revision),
                Err(
                    eru_store::StoreError::RevisionMismatch { .. }
                    | eru_store::StoreError::AlreadyExists(_),
                ) => {
                    attempt += 1;
                    if attempt > self.config.cas_retry {
                        return Err(eru_types::CoreError::NodeStale(node.name.clone()));
                    }
                    tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
                    let (_, current) = self.get_node(&node.name).await?;
                    revision = current;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
