//! Distributed locks with scoped release.
//!
//! Acquisition returns a [`LockGuard`] whose release is guaranteed on
//! every exit path, including panic propagation: dropping the guard
//! releases the lock.

use async_trait::async_trait;
use tracing::trace;

use crate::error::StoreError;

/// An exclusive per-key lock handle created by
/// [`Store::create_lock`](crate::Store::create_lock).
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// The lock key.
    fn key(&self) -> &str;

    /// Acquire the lock, waiting up to the store's configured bound.
    ///
    /// Contention beyond the bound fails with [`StoreError::LockFailed`].
    async fn lock(&self) -> Result<LockGuard, StoreError>;
}

/// Proof of lock ownership. Releases on drop.
pub struct LockGuard {
    key: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LockGuard {
    /// Build a guard around a release action.
    pub fn new(key: impl Into<String>, release: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            key: key.into(),
            release: Some(release),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release explicitly. Equivalent to dropping the guard.
    pub fn unlock(self) {}
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
            trace!(key = %self.key, "lock released");
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("key", &self.key).finish()
    }
}
