//! Dedup port: atomic "mark processed once" with a TTL window.
//!
//! Handlers use it through `Context::once` to avoid double-applying side
//! effects when the transport redelivers a message they already handled.

mod memory;
#[cfg(feature = "redis")]
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StorageResult;
use crate::storage::SharedStorage;

pub use memory::InMemoryDeduplicator;
#[cfg(feature = "redis")]
pub use self::redis::RedisDeduplicator;

#[async_trait]
pub trait Deduplicator: Send + Sync {
    /// Record `key` as seen. Only the first caller within `ttl` gets `true`.
    async fn try_mark_processed(&self, key: &str, ttl: Duration) -> StorageResult<bool>;
}

pub type SharedDeduplicator = Arc<dyn Deduplicator>;

const HOLDER: &str = "dedup";

/// Dedup over the storage lock table. Never released, so the mark lives
/// until the lock expires.
#[derive(Clone)]
pub struct StorageDeduplicator {
    storage: SharedStorage,
    prefix: String,
}

impl StorageDeduplicator {
    pub fn new(storage: SharedStorage) -> Self {
        Self {
            storage,
            prefix: "dedup".to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

#[async_trait]
impl Deduplicator for StorageDeduplicator {
    async fn try_mark_processed(&self, key: &str, ttl: Duration) -> StorageResult<bool> {
        self.storage
            .acquire_lock(&format!("{}:{key}", self.prefix), ttl, HOLDER)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    #[tokio::test]
    async fn storage_dedup_marks_once_per_window() {
        let dedup = StorageDeduplicator::new(Arc::new(InMemoryStorage::new()));
        let ttl = Duration::from_millis(40);

        assert!(dedup.try_mark_processed("charge:O1", ttl).await.unwrap());
        assert!(!dedup.try_mark_processed("charge:O1", ttl).await.unwrap());
        assert!(dedup.try_mark_processed("charge:O2", ttl).await.unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(dedup.try_mark_processed("charge:O1", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn prefixes_isolate_namespaces() {
        let storage: SharedStorage = Arc::new(InMemoryStorage::new());
        let billing = StorageDeduplicator::new(Arc::clone(&storage)).with_prefix("billing");
        let shipping = StorageDeduplicator::new(storage).with_prefix("shipping");
        let ttl = Duration::from_secs(60);

        assert!(billing.try_mark_processed("O1", ttl).await.unwrap());
        assert!(shipping.try_mark_processed("O1", ttl).await.unwrap());
    }
}
