use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::Deduplicator;
use crate::error::StorageResult;

/// Process-local dedup. Expired marks are pruned on every call.
#[derive(Clone, Default)]
pub struct InMemoryDeduplicator {
    seen: Arc<Mutex<HashMap<String, Instant>>>,
}

impl InMemoryDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live marks.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.seen.lock().values().filter(|until| **until > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Deduplicator for InMemoryDeduplicator {
    async fn try_mark_processed(&self, key: &str, ttl: Duration) -> StorageResult<bool> {
        let now = Instant::now();
        let mut seen = self.seen.lock();
        seen.retain(|_, until| *until > now);
        if seen.contains_key(key) {
            return Ok(false);
        }
        seen.insert(key.to_string(), now + ttl);
        Ok(true)
    }
}
