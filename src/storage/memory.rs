//! In-memory storage for tests and single-process deployments.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{
    defer_publish_state, enlist_stored_row, lookback_cutoff, LockRecord, MessageStorage,
    StorageStatistics,
};
use crate::error::StorageResult;
use crate::message::{headers, IdGenerator, Message, MessageCategory, MessageStatus};
use crate::transaction::Transaction;

struct Row {
    message: Message,
    /// Written inside a transaction that has not committed yet.
    held: bool,
}

#[derive(Default)]
struct Tables {
    published: BTreeMap<i64, Row>,
    received: BTreeMap<i64, Row>,
    received_index: HashMap<(i64, String), i64>,
    locks: HashMap<String, LockRecord>,
}

impl Tables {
    fn table(&mut self, category: MessageCategory) -> &mut BTreeMap<i64, Row> {
        match category {
            MessageCategory::Published => &mut self.published,
            MessageCategory::Received => &mut self.received,
        }
    }
}

/// Thread-safe in-memory storage.
///
/// Cloning creates another handle to the same tables.
#[derive(Clone)]
pub struct InMemoryStorage {
    tables: Arc<Mutex<Tables>>,
    ids: Arc<IdGenerator>,
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::with_id_generator(Arc::new(IdGenerator::default()))
    }

    pub fn with_id_generator(ids: Arc<IdGenerator>) -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            ids,
        }
    }

    /// Number of rows in a table, held rows included.
    pub fn len(&self, category: MessageCategory) -> usize {
        self.tables.lock().table(category).len()
    }

    pub fn is_empty(&self) -> bool {
        let tables = self.tables.lock();
        tables.published.is_empty() && tables.received.is_empty()
    }

    /// All rows of a table, oldest first.
    pub fn messages(&self, category: MessageCategory) -> Vec<Message> {
        let mut tables = self.tables.lock();
        let mut rows: Vec<Message> = tables
            .table(category)
            .values()
            .map(|row| row.message.clone())
            .collect();
        sort_oldest_first(&mut rows);
        rows
    }

    fn needing_retry(
        &self,
        category: MessageCategory,
        lookback: Duration,
        limit: usize,
    ) -> Vec<Message> {
        let cutoff = lookback_cutoff(lookback);
        let mut tables = self.tables.lock();
        let mut rows: Vec<Message> = tables
            .table(category)
            .values()
            .filter(|row| {
                !row.held
                    && row.message.status.is_retryable()
                    && row.message.can_retry()
                    && row.message.updated_at < cutoff
            })
            .map(|row| row.message.clone())
            .collect();
        sort_oldest_first(&mut rows);
        rows.truncate(limit);
        rows
    }

    fn write_state(&self, category: MessageCategory, message: &Message, status: MessageStatus) {
        let mut tables = self.tables.lock();
        if let Some(row) = tables.table(category).get_mut(&message.id) {
            row.message.status = status;
            row.message.retries = message.retries;
            row.message.expires_at = message.expires_at;
            row.message.headers = message.headers.clone();
            row.message.updated_at = Utc::now();
        }
    }
}

fn sort_oldest_first(rows: &mut [Message]) {
    rows.sort_by(|a, b| a.added.cmp(&b.added).then(a.id.cmp(&b.id)));
}

#[async_trait]
impl MessageStorage for InMemoryStorage {
    async fn store_message(
        &self,
        message: Message,
        tx: Option<&Transaction>,
    ) -> StorageResult<Message> {
        let held = enlist_stored_row(self, tx, message.id)?;
        self.tables.lock().published.insert(
            message.id,
            Row {
                message: message.clone(),
                held,
            },
        );
        Ok(message)
    }

    async fn store_received_message(
        &self,
        delivered: &Message,
        group: &str,
    ) -> StorageResult<Message> {
        let origin = delivered.origin_id();
        let mut tables = self.tables.lock();
        let key = (origin, group.to_string());
        if let Some(existing) = tables.received_index.get(&key).copied() {
            if let Some(row) = tables.received.get(&existing) {
                return Ok(row.message.clone());
            }
        }

        let now = Utc::now();
        let mut row = delivered.clone();
        row.id = self.ids.next_id();
        row.group = group.to_string();
        row.status = MessageStatus::Scheduled;
        row.retries = 0;
        row.expires_at = None;
        row.created_at = now;
        row.updated_at = now;
        row.added = now;
        row.headers
            .insert(headers::MESSAGE_ID.to_string(), origin.to_string());

        tables.received_index.insert(key, row.id);
        tables.received.insert(
            row.id,
            Row {
                message: row.clone(),
                held: false,
            },
        );
        Ok(row)
    }

    async fn change_publish_state(
        &self,
        message: &Message,
        status: MessageStatus,
        tx: Option<&Transaction>,
    ) -> StorageResult<()> {
        if defer_publish_state(self, tx, message, status)? {
            return Ok(());
        }
        self.write_state(MessageCategory::Published, message, status);
        Ok(())
    }

    async fn change_receive_state(
        &self,
        message: &Message,
        status: MessageStatus,
    ) -> StorageResult<()> {
        self.write_state(MessageCategory::Received, message, status);
        Ok(())
    }

    async fn try_change_publish_state(
        &self,
        id: i64,
        expected: &[MessageStatus],
        status: MessageStatus,
    ) -> StorageResult<bool> {
        let mut tables = self.tables.lock();
        match tables.published.get_mut(&id) {
            Some(row) if !row.held && expected.contains(&row.message.status) => {
                row.message.transition(status);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn try_change_receive_state(
        &self,
        id: i64,
        expected: &[MessageStatus],
        status: MessageStatus,
    ) -> StorageResult<bool> {
        let mut tables = self.tables.lock();
        match tables.received.get_mut(&id) {
            Some(row) if expected.contains(&row.message.status) => {
                row.message.transition(status);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn claim_publish_backlog(
        &self,
        retry_backoff: Duration,
        limit: usize,
    ) -> StorageResult<Vec<Message>> {
        let quiet_before = lookback_cutoff(retry_backoff);
        let mut tables = self.tables.lock();
        let mut pending: Vec<&mut Row> = tables
            .published
            .values_mut()
            .filter(|row| {
                !row.held
                    && row.message.status == MessageStatus::Pending
                    && (row.message.retries == 0 || row.message.updated_at < quiet_before)
            })
            .collect();
        pending.sort_by(|a, b| {
            a.message
                .added
                .cmp(&b.message.added)
                .then(a.message.id.cmp(&b.message.id))
        });

        Ok(pending
            .into_iter()
            .take(limit)
            .map(|row| {
                row.message.transition(MessageStatus::Queued);
                row.message.clone()
            })
            .collect())
    }

    async fn get_published_messages_needing_retry(
        &self,
        lookback: Duration,
        limit: usize,
    ) -> StorageResult<Vec<Message>> {
        Ok(self.needing_retry(MessageCategory::Published, lookback, limit))
    }

    async fn get_received_messages_needing_retry(
        &self,
        lookback: Duration,
        limit: usize,
    ) -> StorageResult<Vec<Message>> {
        Ok(self.needing_retry(MessageCategory::Received, lookback, limit))
    }

    async fn get_expired_delayed_messages(&self, limit: usize) -> StorageResult<Vec<Message>> {
        let now = Utc::now();
        let tables = self.tables.lock();
        let mut due: Vec<Message> = tables
            .published
            .values()
            .filter(|row| {
                !row.held && row.message.status == MessageStatus::Delayed && row.message.is_due(now)
            })
            .map(|row| row.message.clone())
            .collect();
        due.sort_by_key(|message| (message.expires_at, message.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn delete_expired(
        &self,
        category: MessageCategory,
        status: MessageStatus,
        cutoff: DateTime<Utc>,
        batch_limit: usize,
    ) -> StorageResult<u64> {
        let mut tables = self.tables.lock();
        let doomed: Vec<(i64, i64, String)> = tables
            .table(category)
            .values()
            .filter(|row| row.message.status == status && row.message.updated_at < cutoff)
            .take(batch_limit)
            .map(|row| (row.message.id, row.message.origin_id(), row.message.group.clone()))
            .collect();

        for (id, origin, group) in &doomed {
            tables.table(category).remove(id);
            if category == MessageCategory::Received {
                tables.received_index.remove(&(*origin, group.clone()));
            }
        }
        Ok(doomed.len() as u64)
    }

    async fn get_message(
        &self,
        category: MessageCategory,
        id: i64,
    ) -> StorageResult<Option<Message>> {
        let mut tables = self.tables.lock();
        Ok(tables.table(category).get(&id).map(|row| row.message.clone()))
    }

    async fn delete_message(&self, category: MessageCategory, id: i64) -> StorageResult<bool> {
        let mut tables = self.tables.lock();
        let removed = tables.table(category).remove(&id);
        if let (Some(row), MessageCategory::Received) = (&removed, category) {
            tables
                .received_index
                .remove(&(row.message.origin_id(), row.message.group.clone()));
        }
        Ok(removed.is_some())
    }

    async fn release_hold(&self, id: i64) -> StorageResult<()> {
        if let Some(row) = self.tables.lock().published.get_mut(&id) {
            row.held = false;
        }
        Ok(())
    }

    async fn acquire_lock(&self, key: &str, ttl: Duration, holder: &str) -> StorageResult<bool> {
        let now = Utc::now();
        let mut tables = self.tables.lock();
        if let Some(existing) = tables.locks.get(key) {
            if !existing.is_expired(now) {
                return Ok(false);
            }
        }
        tables.locks.insert(
            key.to_string(),
            LockRecord {
                key: key.to_string(),
                holder: holder.to_string(),
                expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            },
        );
        Ok(true)
    }

    async fn release_lock(&self, key: &str, holder: &str) -> StorageResult<()> {
        let mut tables = self.tables.lock();
        if tables.locks.get(key).is_some_and(|lock| lock.holder == holder) {
            tables.locks.remove(key);
        }
        Ok(())
    }

    async fn renew_lock(&self, key: &str, ttl: Duration, holder: &str) -> StorageResult<bool> {
        let now = Utc::now();
        let mut tables = self.tables.lock();
        match tables.locks.get_mut(key) {
            Some(lock) if lock.holder == holder && !lock.is_expired(now) => {
                lock.expires_at =
                    now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn statistics(&self) -> StorageResult<StorageStatistics> {
        let tables = self.tables.lock();
        let mut stats = StorageStatistics::default();
        for row in tables.published.values() {
            stats.record(MessageCategory::Published, row.message.status, 1);
        }
        for row in tables.received.values() {
            stats.record(MessageCategory::Received, row.message.status, 1);
        }
        Ok(stats)
    }
}
