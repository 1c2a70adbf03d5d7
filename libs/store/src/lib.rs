//! # eru-store
//!
//! The store contract consumed by the cluster service: a revisioned
//! key-value space with compare-and-set puts, prefix listing, and
//! per-key distributed locks.
//!
//! Any store satisfying [`Store`] may back the system; an in-memory
//! implementation ([`MemStore`]) is provided for tests and dev mode.

mod error;
mod lock;
mod memory;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

pub use error::StoreError;
pub use lock::{DistributedLock, LockGuard};
pub use memory::MemStore;

/// A key-value entry together with its revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    /// Monotonically increasing per key; the CAS token for [`Store::put`].
    pub revision: u64,
}

/// The durable shared resource. Every mutation of node or workload state
/// goes through `(lock, read, compute, CAS, unlock)` against it.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KvPair>, StoreError>;

    /// Write a key.
    ///
    /// `expected` of `None` writes unconditionally. `Some(rev)` succeeds
    /// only while the key is at that revision (`Some(0)` means the key
    /// must not exist yet). Returns the new revision.
    async fn put(&self, key: &str, value: Vec<u8>, expected: Option<u64>)
        -> Result<u64, StoreError>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// List all entries under a key prefix, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>, StoreError>;

    /// Create a handle for the distributed lock at `key`.
    ///
    /// Ownership is exclusive; the lock is released on guard drop or
    /// session expiry after `ttl`.
    fn create_lock(&self, key: &str, ttl: Duration) -> Box<dyn DistributedLock>;
}

/// Read a key and deserialize its JSON value, returning the revision too.
pub async fn get_json<T: DeserializeOwned>(
    store: &dyn Store,
    key: &str,
) -> Result<Option<(T, u64)>, StoreError> {
    match store.get(key).await? {
        Some(kv) => {
            let value = serde_json::from_slice(&kv.value)?;
            Ok(Some((value, kv.revision)))
        }
        None => Ok(None),
    }
}

/// Serialize a value as JSON and write it, with the same CAS semantics
/// as [`Store::put`].
pub async fn put_json<T: Serialize>(
    store: &dyn Store,
    key: &str,
    value: &T,
    expected: Option<u64>,
) -> Result<u64, StoreError> {
    let bytes = serde_json::to_vec(value)?;
    store.put(key, bytes, expected).await
}
