//! Storage port - durable outbox/inbox rows and the lock primitive.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 MessageStorage (async trait)                 │
//! │  store / change state / sweeps / delete_expired / locks      │
//! └──────────────────────────────────────────────────────────────┘
//!          │                    │                      │
//!          ▼                    ▼                      ▼
//!   ┌─────────────┐     ┌───────────────┐     ┌─────────────────┐
//!   │InMemory     │     │ Sqlite        │     │ Redis           │
//!   │(tests/dev)  │     │ (relational)  │     │ (key-value/TTL) │
//!   └─────────────┘     └───────────────┘     └─────────────────┘
//! ```
//!
//! Every write may fail with [`StorageError`]; callers log it and try again
//! on their next cycle. Status writes are idempotent: applying the same
//! status twice leaves the row unchanged apart from `updated_at`.

mod memory;
#[cfg(feature = "redis")]
mod redis;
#[cfg(feature = "sqlite")]
mod sqlite;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{StorageError, StorageResult};
use crate::message::{Message, MessageCategory, MessageStatus};
use crate::transaction::{ListenerResult, Transaction, TransactionListener};

pub use memory::InMemoryStorage;
#[cfg(feature = "redis")]
pub use self::redis::RedisStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;

/// A short-lived mutual-exclusion record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockRecord {
    pub key: String,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Per-category, per-status row counts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StorageStatistics {
    counts: HashMap<(MessageCategory, MessageStatus), u64>,
}

impl StorageStatistics {
    pub fn record(&mut self, category: MessageCategory, status: MessageStatus, count: u64) {
        *self.counts.entry((category, status)).or_insert(0) += count;
    }

    pub fn count(&self, category: MessageCategory, status: MessageStatus) -> u64 {
        self.counts.get(&(category, status)).copied().unwrap_or(0)
    }

    pub fn total(&self, category: MessageCategory) -> u64 {
        self.counts
            .iter()
            .filter(|((row_category, _), _)| *row_category == category)
            .map(|(_, count)| count)
            .sum()
    }
}

#[async_trait]
pub trait MessageStorage: Send + Sync {
    /// Persist a new outbox row. With an active transaction the row is held
    /// back from every sweep until commit, and deleted on rollback.
    async fn store_message(
        &self,
        message: Message,
        tx: Option<&Transaction>,
    ) -> StorageResult<Message>;

    /// Persist an inbox row for a delivery accepted by `group`.
    ///
    /// Insert-if-absent on (origin id, group): a redelivery returns the
    /// existing row so that its retry count survives.
    async fn store_received_message(&self, delivered: &Message, group: &str)
        -> StorageResult<Message>;

    /// Write `status`, `retries`, `expires_at` and `updated_at` of an outbox
    /// row. With an active transaction the write is applied after commit.
    async fn change_publish_state(
        &self,
        message: &Message,
        status: MessageStatus,
        tx: Option<&Transaction>,
    ) -> StorageResult<()>;

    async fn change_receive_state(&self, message: &Message, status: MessageStatus)
        -> StorageResult<()>;

    /// Compare-and-set on an outbox row's status. Returns `false` when the
    /// row is missing, held, or not in one of the `expected` states.
    async fn try_change_publish_state(
        &self,
        id: i64,
        expected: &[MessageStatus],
        status: MessageStatus,
    ) -> StorageResult<bool>;

    /// Compare-and-set on an inbox row's status. Returns `false` when the
    /// row is missing or not in one of the `expected` states.
    async fn try_change_receive_state(
        &self,
        id: i64,
        expected: &[MessageStatus],
        status: MessageStatus,
    ) -> StorageResult<bool>;

    /// Atomically flip up to `limit` `PENDING` outbox rows to `QUEUED` and
    /// return them, oldest first.
    ///
    /// Rows that never reached the transport (`retries == 0`) are claimable
    /// at once. Rows whose send failed wait until they have been quiet for
    /// `retry_backoff`.
    async fn claim_publish_backlog(
        &self,
        retry_backoff: Duration,
        limit: usize,
    ) -> StorageResult<Vec<Message>>;

    /// Outbox rows in a retryable status, under their retry ceiling, quiet
    /// for at least `lookback`, oldest `added` first.
    async fn get_published_messages_needing_retry(
        &self,
        lookback: Duration,
        limit: usize,
    ) -> StorageResult<Vec<Message>>;

    async fn get_received_messages_needing_retry(
        &self,
        lookback: Duration,
        limit: usize,
    ) -> StorageResult<Vec<Message>>;

    /// `DELAYED` outbox rows whose `expires_at` has passed.
    async fn get_expired_delayed_messages(&self, limit: usize) -> StorageResult<Vec<Message>>;

    /// Delete at most `batch_limit` rows of `category` in terminal `status`
    /// last updated before `cutoff`.
    async fn delete_expired(
        &self,
        category: MessageCategory,
        status: MessageStatus,
        cutoff: DateTime<Utc>,
        batch_limit: usize,
    ) -> StorageResult<u64>;

    async fn get_message(&self, category: MessageCategory, id: i64)
        -> StorageResult<Option<Message>>;

    async fn delete_message(&self, category: MessageCategory, id: i64) -> StorageResult<bool>;

    /// Make a transactionally held outbox row visible to the sweeps.
    async fn release_hold(&self, id: i64) -> StorageResult<()>;

    /// Insert-if-absent. An expired lock is reclaimable by any holder.
    async fn acquire_lock(&self, key: &str, ttl: Duration, holder: &str) -> StorageResult<bool>;

    async fn release_lock(&self, key: &str, holder: &str) -> StorageResult<()>;

    /// Extend a lock still owned by `holder`.
    async fn renew_lock(&self, key: &str, ttl: Duration, holder: &str) -> StorageResult<bool>;

    async fn statistics(&self) -> StorageResult<StorageStatistics>;
}

/// Releases or deletes a held outbox row when its transaction finishes.
struct HoldListener<S> {
    storage: S,
    id: i64,
}

#[async_trait]
impl<S: MessageStorage> TransactionListener for HoldListener<S> {
    async fn after_commit(&self) -> ListenerResult {
        self.storage.release_hold(self.id).await?;
        Ok(())
    }

    async fn after_rollback(&self) -> ListenerResult {
        let deleted = self
            .storage
            .delete_message(MessageCategory::Published, self.id)
            .await?;
        debug!(message_id = self.id, deleted, "Dropped outbox row of rolled back transaction");
        Ok(())
    }
}

/// Enlist a freshly stored outbox row on `tx`. Returns whether the row must
/// be stored held.
pub(crate) fn enlist_stored_row<S>(storage: &S, tx: Option<&Transaction>, id: i64) -> StorageResult<bool>
where
    S: MessageStorage + Clone + 'static,
{
    match tx {
        Some(tx) => {
            tx.add_listener(HoldListener {
                storage: storage.clone(),
                id,
            })
            .map_err(|err| StorageError::Rejected(err.to_string()))?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Defer a status write until `tx` commits. Returns `true` when deferred.
pub(crate) fn defer_publish_state<S>(
    storage: &S,
    tx: Option<&Transaction>,
    message: &Message,
    status: MessageStatus,
) -> StorageResult<bool>
where
    S: MessageStorage + Clone + 'static,
{
    let Some(tx) = tx else {
        return Ok(false);
    };
    let storage = storage.clone();
    let message = message.clone();
    tx.after_commit(move || async move {
        storage.change_publish_state(&message, status, None).await?;
        Ok(())
    })
    .map_err(|err| StorageError::Rejected(err.to_string()))?;
    Ok(true)
}

/// Cutoff for "quiet for at least `lookback`".
pub(crate) fn lookback_cutoff(lookback: Duration) -> DateTime<Utc> {
    let lookback = chrono::Duration::from_std(lookback).unwrap_or(chrono::Duration::MAX);
    Utc::now()
        .checked_sub_signed(lookback)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Shared handle used by the runtime.
pub type SharedStorage = Arc<dyn MessageStorage>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statistics_totals_by_category() {
        let mut stats = StorageStatistics::default();
        stats.record(MessageCategory::Published, MessageStatus::Succeeded, 3);
        stats.record(MessageCategory::Published, MessageStatus::Failed, 1);
        stats.record(MessageCategory::Received, MessageStatus::Succeeded, 2);

        assert_eq!(stats.count(MessageCategory::Published, MessageStatus::Succeeded), 3);
        assert_eq!(stats.total(MessageCategory::Published), 4);
        assert_eq!(stats.total(MessageCategory::Received), 2);
        assert_eq!(stats.count(MessageCategory::Received, MessageStatus::Failed), 0);
    }

    #[test]
    fn lookback_cutoff_is_in_the_past() {
        let cutoff = lookback_cutoff(Duration::from_secs(60));
        assert!(cutoff < Utc::now());
        assert!(lookback_cutoff(Duration::MAX) <= cutoff);
    }
}
