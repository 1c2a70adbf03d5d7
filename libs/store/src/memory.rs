//! In-memory store for tests and dev mode.
//!
//! Implements the full [`Store`] contract: per-key revisions, CAS puts,
//! prefix listing, and per-key locks. Locks are backed by binary
//! semaphores, so a guard drop (on any exit path) releases the lock;
//! TTL-based session expiry is the province of a networked backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::StoreError;
use crate::lock::{DistributedLock, LockGuard};
use crate::{KvPair, Store};

#[derive(Default)]
struct MemInner {
    data: BTreeMap<String, (Vec<u8>, u64)>,
    revision: u64,
}

/// Thread-safe in-memory store.
#[derive(Clone)]
pub struct MemStore {
    inner: Arc<Mutex<MemInner>>,
    locks: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
    /// Bound on lock-acquisition wait before reporting contention.
    lock_wait: Duration,
}

impl MemStore {
    pub fn new() -> Self {
        Self::with_lock_wait(Duration::from_secs(5))
    }

    /// Store whose locks give up after `lock_wait` of contention.
    pub fn with_lock_wait(lock_wait: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemInner::default())),
            locks: Arc::new(Mutex::new(HashMap::new())),
            lock_wait,
        }
    }

    fn semaphore_for(&self, key: &str) -> Arc<Semaphore> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get(&self, key: &str) -> Result<Option<KvPair>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.data.get(key).map(|(value, revision)| KvPair {
            key: key.to_string(),
            value: value.clone(),
            revision: *revision,
        }))
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        expected: Option<u64>,
    ) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let current = inner.data.get(key).map(|(_, rev)| *rev).unwrap_or(0);
        if let Some(expected) = expected {
            if expected == 0 && current != 0 {
                return Err(StoreError::AlreadyExists(key.to_string()));
            }
            if expected != current {
                return Err(StoreError::RevisionMismatch {
                    key: key.to_string(),
                    expected,
                    current,
                });
            }
        }
        inner.revision += 1;
        let revision = inner.revision;
        inner.data.insert(key.to_string(), (value, revision));
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.data.remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>, StoreError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .data
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, (value, revision))| KvPair {
                key: k.clone(),
                value: value.clone(),
                revision: *revision,
            })
            .collect())
    }

    fn create_lock(&self, key: &str, _ttl: Duration) -> Box<dyn DistributedLock> {
        Box::new(MemLock {
            key: key.to_string(),
            semaphore: self.semaphore_for(key),
            wait: self.lock_wait,
        })
    }
}

struct MemLock {
    key: String,
    semaphore: Arc<Semaphore>,
    wait: Duration,
}

#[async_trait]
impl DistributedLock for MemLock {
    fn key(&self) -> &str {
        &self.key
    }

    async fn lock(&self) -> Result<LockGuard, StoreError> {
        let acquired =
            tokio::time::timeout(self.wait, self.semaphore.clone().acquire_owned()).await;
        match acquired {
            Ok(Ok(permit)) => {
                debug!(key = %self.key, "lock acquired");
                let key = self.key.clone();
                Ok(LockGuard::new(key, Box::new(move || drop(permit))))
            }
            Ok(Err(_)) | Err(_) => Err(StoreError::LockFailed(self.key.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete() {
        let store = MemStore::new();
        let rev = store.put("/a", b"1".to_vec(), None).await.unwrap();
        let kv = store.get("/a").await.unwrap().unwrap();
        assert_eq!(kv.value, b"1");
        assert_eq!(kv.revision, rev);

        assert!(store.delete("/a").await.unwrap());
        assert!(!store.delete("/a").await.unwrap());
        assert!(store.get("/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cas_put_detects_conflict() {
        let store = MemStore::new();
        let rev = store.put("/a", b"1".to_vec(), Some(0)).await.unwrap();

        // create-only on an existing key
        let err = store.put("/a", b"2".to_vec(), Some(0)).await.unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));

        // stale revision
        store.put("/a", b"2".to_vec(), Some(rev)).await.unwrap();
        let err = store.put("/a", b"3".to_vec(), Some(rev)).await.unwrap_err();
        assert!(matches!(err, StoreError::RevisionMismatch { .. }));
    }

    #[tokio::test]
    async fn list_by_prefix_ordered() {
        let store = MemStore::new();
        store.put("/node/b", b"2".to_vec(), None).await.unwrap();
        store.put("/node/a", b"1".to_vec(), None).await.unwrap();
        store.put("/other/c", b"3".to_vec(), None).await.unwrap();

        let entries = store.list("/node/").await.unwrap();
        let keys: Vec<_> = entries.iter().map(|kv| kv.key.as_str()).collect();
        assert_eq!(keys, vec!["/node/a", "/node/b"]);
    }

    #[tokio::test]
    async fn lock_is_exclusive_and_released_on_drop() {
        let store = MemStore::with_lock_wait(Duration::from_millis(50));
        let lock = store.create_lock("/lock/n1", Duration::from_secs(30));

        let guard = lock.lock().await.unwrap();
        let err = lock.lock().await.unwrap_err();
        assert!(matches!(err, StoreError::LockFailed(_)));

        drop(guard);
        let guard = lock.lock().await.unwrap();
        guard.unlock();
        lock.lock().await.unwrap();
    }

    #[tokio::test]
    async fn lock_released_even_when_holder_panics() {
        let store = MemStore::with_lock_wait(Duration::from_millis(100));
        let lock = store.create_lock("/lock/n1", Duration::from_secs(30));

        let store2 = store.clone();
        let handle = tokio::spawn(async move {
            let lock = store2.create_lock("/lock/n1", Duration::from_secs(30));
            let _guard = lock.lock().await.unwrap();
            panic!("holder dies");
        });
        assert!(handle.await.is_err());

        // the panicking task's guard was dropped, so we can acquire
        lock.lock().await.unwrap();
    }

    #[tokio::test]
    async fn json_helpers_round_trip() {
        let store = MemStore::new();
        let value = serde_json::json!({"cpu": 4.0});
        let rev = crate::put_json(&store, "/r", &value, Some(0)).await.unwrap();
        let (back, got_rev): (serde_json::Value, u64) =
            crate::get_json(&store, "/r").await.unwrap().unwrap();
        assert_eq!(back, value);
        assert_eq!(got_rev, rev);
    }
}
