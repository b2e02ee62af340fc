//! Cross-instance mutual exclusion for the reconciliation sweeps.
//!
//! [`SweepLock`] names one lock key and one holder id and delegates to the
//! storage lock primitive. Failing to acquire is not an error: the caller
//! skips this cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::StorageResult;
use crate::storage::SharedStorage;

/// A TTL'd, holder-id'd lock on one storage key.
#[derive(Clone)]
pub struct SweepLock {
    storage: SharedStorage,
    key: Arc<str>,
    holder: Arc<str>,
    ttl: Duration,
}

impl SweepLock {
    pub fn new(
        storage: SharedStorage,
        key: impl Into<String>,
        holder: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            storage,
            key: key.into().into(),
            holder: holder.into().into(),
            ttl,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// `Some(guard)` when this holder now owns the lock.
    pub async fn try_acquire(&self) -> StorageResult<Option<LockGuard>> {
        if self
            .storage
            .acquire_lock(&self.key, self.ttl, &self.holder)
            .await?
        {
            debug!(key = %self.key, holder = %self.holder, "Lock acquired");
            Ok(Some(LockGuard {
                lock: self.clone(),
                renewed_at: Instant::now(),
                released: false,
            }))
        } else {
            debug!(key = %self.key, holder = %self.holder, "Lock held elsewhere");
            Ok(None)
        }
    }
}

/// Ownership of an acquired [`SweepLock`].
///
/// Call [`LockGuard::release`] when done. A guard dropped without release
/// simply lets the lock expire after its TTL.
pub struct LockGuard {
    lock: SweepLock,
    renewed_at: Instant,
    released: bool,
}

impl LockGuard {
    /// Extend the TTL. `false` means the lock was lost (expired and taken).
    pub async fn renew(&self) -> StorageResult<bool> {
        let renewed = self
            .lock
            .storage
            .renew_lock(&self.lock.key, self.lock.ttl, &self.lock.holder)
            .await?;
        if !renewed {
            warn!(key = %self.lock.key, holder = %self.lock.holder, "Lock lost before renewal");
        }
        Ok(renewed)
    }

    /// Renew once a third of the TTL has passed since the last renewal;
    /// cheap to call between items of a long sweep. `false` means the lock
    /// was lost and the caller must stop.
    pub async fn keep_alive(&mut self) -> StorageResult<bool> {
        if self.renewed_at.elapsed() < self.lock.ttl / 3 {
            return Ok(true);
        }
        let renewed = self.renew().await?;
        if renewed {
            self.renewed_at = Instant::now();
        }
        Ok(renewed)
    }

    pub async fn release(mut self) -> StorageResult<()> {
        self.released = true;
        self.lock
            .storage
            .release_lock(&self.lock.key, &self.lock.holder)
            .await
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            debug!(key = %self.lock.key, holder = %self.lock.holder, "Lock guard dropped, waiting for expiry");
        }
    }
}

/// A holder id unique to this process and worker.
pub fn instance_holder(worker_id: u16) -> String {
    format!("outbox-{}-{worker_id}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    fn shared() -> SharedStorage {
        Arc::new(InMemoryStorage::new())
    }

    #[tokio::test]
    async fn only_one_holder_acquires() {
        let storage = shared();
        let a = SweepLock::new(Arc::clone(&storage), "retry:published", "a", Duration::from_secs(30));
        let b = SweepLock::new(storage, "retry:published", "b", Duration::from_secs(30));

        let guard = a.try_acquire().await.unwrap().expect("a acquires");
        assert!(b.try_acquire().await.unwrap().is_none());

        guard.release().await.unwrap();
        assert!(b.try_acquire().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_acquire_has_exactly_one_winner() {
        let storage = shared();
        let handles: Vec<_> = (0..6)
            .map(|n| {
                let lock = SweepLock::new(
                    Arc::clone(&storage),
                    "retry:received",
                    format!("node-{n}"),
                    Duration::from_secs(30),
                );
                tokio::spawn(async move { lock.try_acquire().await.unwrap().is_some() })
            })
            .collect();

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn dropped_guard_expires_and_renew_reports_loss() {
        let storage = shared();
        let a = SweepLock::new(Arc::clone(&storage), "collector", "a", Duration::from_millis(30));
        let b = SweepLock::new(storage, "collector", "b", Duration::from_millis(30));

        let guard = a.try_acquire().await.unwrap().expect("a acquires");
        assert!(guard.renew().await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let taken = b.try_acquire().await.unwrap();
        assert!(taken.is_some());
        assert!(!guard.renew().await.unwrap());
    }

    #[tokio::test]
    async fn keep_alive_extends_the_lock_while_work_continues() {
        let storage = shared();
        let a = SweepLock::new(Arc::clone(&storage), "retry:published", "a", Duration::from_millis(60));
        let b = SweepLock::new(storage, "retry:published", "b", Duration::from_millis(60));

        let mut guard = a.try_acquire().await.unwrap().expect("a acquires");
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(25)).await;
            assert!(guard.keep_alive().await.unwrap());
        }
        // 150ms in, well past the original TTL, and still held.
        assert!(b.try_acquire().await.unwrap().is_none());
        guard.release().await.unwrap();
        assert!(b.try_acquire().await.unwrap().is_some());
    }

    #[test]
    fn holder_includes_worker() {
        assert!(instance_holder(12).ends_with("-12"));
    }
}
