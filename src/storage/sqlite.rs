//! SQLite storage.
//!
//! One connection guarded by a mutex; every call runs on the blocking pool
//! so the async runtime never waits on disk. Timestamps are stored as
//! nanoseconds since the Unix epoch, which keeps them exact and sortable.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;

use super::{
    defer_publish_state, enlist_stored_row, lookback_cutoff, MessageStorage, StorageStatistics,
};
use crate::error::{StorageError, StorageResult};
use crate::message::{headers, IdGenerator, Message, MessageCategory, MessageStatus};
use crate::transaction::Transaction;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS published (
    id INTEGER PRIMARY KEY,
    version TEXT NOT NULL,
    name TEXT NOT NULL,
    grp TEXT NOT NULL,
    content TEXT NOT NULL,
    headers TEXT NOT NULL,
    status TEXT NOT NULL,
    retries INTEGER NOT NULL,
    max_retries INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    expires_at INTEGER,
    added INTEGER NOT NULL,
    held INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_published_status ON published(version, status, updated_at);
CREATE INDEX IF NOT EXISTS idx_published_expires ON published(status, expires_at);

CREATE TABLE IF NOT EXISTS received (
    id INTEGER PRIMARY KEY,
    origin_id INTEGER NOT NULL,
    version TEXT NOT NULL,
    name TEXT NOT NULL,
    grp TEXT NOT NULL,
    content TEXT NOT NULL,
    headers TEXT NOT NULL,
    status TEXT NOT NULL,
    retries INTEGER NOT NULL,
    max_retries INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    expires_at INTEGER,
    added INTEGER NOT NULL,
    held INTEGER NOT NULL DEFAULT 0,
    UNIQUE (origin_id, grp, version)
);

CREATE INDEX IF NOT EXISTS idx_received_status ON received(version, status, updated_at);

CREATE TABLE IF NOT EXISTS locks (
    key TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
"#;

const COLUMNS: &str = "id, name, grp, content, headers, status, retries, max_retries, \
                       created_at, updated_at, expires_at, added, version";

/// SQLite-backed [`MessageStorage`]. Rows are scoped to one `version`.
#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
    ids: Arc<IdGenerator>,
    version: Arc<str>,
}

impl SqliteStorage {
    /// Open (or create) a database file and bootstrap the schema.
    pub fn open(
        path: impl AsRef<Path>,
        version: impl Into<String>,
        ids: Arc<IdGenerator>,
    ) -> StorageResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| StorageError::Unavailable(err.to_string()))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        info!(path = %path.display(), "Opened sqlite outbox storage");
        Self::bootstrap(conn, version.into(), ids)
    }

    /// Private in-memory database, mostly for tests.
    pub fn in_memory(version: impl Into<String>, ids: Arc<IdGenerator>) -> StorageResult<Self> {
        Self::bootstrap(Connection::open_in_memory()?, version.into(), ids)
    }

    fn bootstrap(conn: Connection, version: String, ids: Arc<IdGenerator>) -> StorageResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            ids,
            version: version.into(),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn call<T, F>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&mut Connection, &str) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let version = Arc::clone(&self.version);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn, &version)
        })
        .await
        .map_err(|err| StorageError::Task(err.to_string()))?
    }

    async fn needing_retry(
        &self,
        category: MessageCategory,
        lookback: Duration,
        limit: usize,
    ) -> StorageResult<Vec<Message>> {
        let cutoff = to_nanos(lookback_cutoff(lookback));
        self.call(move |conn, version| {
            let sql = format!(
                "SELECT {COLUMNS} FROM {table}
                 WHERE version = ?1 AND held = 0
                   AND status IN ('SCHEDULED', 'QUEUED', 'PENDING', 'RETRYING')
                   AND retries < max_retries
                   AND updated_at < ?2
                 ORDER BY added, id
                 LIMIT ?3",
                table = table(category)
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![version, cutoff, sql_limit(limit)], read_message)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn write_state(
        &self,
        category: MessageCategory,
        message: &Message,
        status: MessageStatus,
    ) -> StorageResult<()> {
        let id = message.id;
        let retries = message.retries;
        let expires_at = message.expires_at.map(to_nanos);
        let headers = serde_json::to_string(&message.headers)?;
        self.call(move |conn, _| {
            let sql = format!(
                "UPDATE {table}
                 SET status = ?1, retries = ?2, expires_at = ?3, headers = ?4, updated_at = ?5
                 WHERE id = ?6",
                table = table(category)
            );
            conn.execute(
                &sql,
                params![status.as_str(), retries, expires_at, headers, now_nanos(), id],
            )?;
            Ok(())
        })
        .await
    }
}

impl SqliteStorage {
    /// Single-statement status CAS. Held outbox rows never match.
    async fn compare_and_set(
        &self,
        category: MessageCategory,
        id: i64,
        expected: &[MessageStatus],
        status: MessageStatus,
    ) -> StorageResult<bool> {
        if expected.is_empty() {
            return Ok(false);
        }
        let states = expected
            .iter()
            .map(|state| format!("'{}'", state.as_str()))
            .collect::<Vec<_>>()
            .join(", ");
        self.call(move |conn, _| {
            let sql = format!(
                "UPDATE {table} SET status = ?1, updated_at = ?2
                 WHERE id = ?3 AND held = 0 AND status IN ({states})",
                table = table(category)
            );
            let changed = conn.execute(&sql, params![status.as_str(), now_nanos(), id])?;
            Ok(changed > 0)
        })
        .await
    }
}

fn table(category: MessageCategory) -> &'static str {
    match category {
        MessageCategory::Published => "published",
        MessageCategory::Received => "received",
    }
}

fn to_nanos(at: DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt()
        .unwrap_or(if at.timestamp() < 0 { i64::MIN } else { i64::MAX })
}

fn from_nanos(nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(nanos)
}

fn now_nanos() -> i64 {
    to_nanos(Utc::now())
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn read_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let raw_headers: String = row.get(4)?;
    let headers = serde_json::from_str(&raw_headers)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(err)))?;
    let raw_status: String = row.get(5)?;
    let status = raw_status
        .parse::<MessageStatus>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, err.into()))?;

    Ok(Message {
        id: row.get(0)?,
        name: row.get(1)?,
        group: row.get(2)?,
        content: row.get(3)?,
        headers,
        status,
        retries: row.get(6)?,
        max_retries: row.get(7)?,
        created_at: from_nanos(row.get(8)?),
        updated_at: from_nanos(row.get(9)?),
        expires_at: row.get::<_, Option<i64>>(10)?.map(from_nanos),
        added: from_nanos(row.get(11)?),
        version: row.get(12)?,
    })
}

fn insert_published(conn: &Connection, message: &Message, held: bool) -> StorageResult<()> {
    conn.execute(
        "INSERT INTO published (id, version, name, grp, content, headers, status, retries,
                                max_retries, created_at, updated_at, expires_at, added, held)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            message.id,
            message.version,
            message.name,
            message.group,
            message.content,
            serde_json::to_string(&message.headers)?,
            message.status.as_str(),
            message.retries,
            message.max_retries,
            to_nanos(message.created_at),
            to_nanos(message.updated_at),
            message.expires_at.map(to_nanos),
            to_nanos(message.added),
            held,
        ],
    )?;
    Ok(())
}

#[async_trait]
impl MessageStorage for SqliteStorage {
    async fn store_message(
        &self,
        message: Message,
        tx: Option<&Transaction>,
    ) -> StorageResult<Message> {
        let held = enlist_stored_row(self, tx, message.id)?;
        let mut message = message;
        message.version = self.version.to_string();
        self.call(move |conn, _| {
            insert_published(conn, &message, held)?;
            Ok(message)
        })
        .await
    }

    async fn store_received_message(
        &self,
        delivered: &Message,
        group: &str,
    ) -> StorageResult<Message> {
        let origin = delivered.origin_id();
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
        row.version = self.version.to_string();
        row.headers
            .insert(headers::MESSAGE_ID.to_string(), origin.to_string());

        self.call(move |conn, version| {
            conn.execute(
                "INSERT OR IGNORE INTO received (id, origin_id, version, name, grp, content,
                                                 headers, status, retries, max_retries,
                                                 created_at, updated_at, expires_at, added)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, NULL, ?13)",
                params![
                    row.id,
                    origin,
                    version,
                    row.name,
                    row.group,
                    row.content,
                    serde_json::to_string(&row.headers)?,
                    row.status.as_str(),
                    row.retries,
                    row.max_retries,
                    to_nanos(row.created_at),
                    to_nanos(row.updated_at),
                    to_nanos(row.added),
                ],
            )?;
            let sql = format!(
                "SELECT {COLUMNS} FROM received WHERE origin_id = ?1 AND grp = ?2 AND version = ?3"
            );
            let stored = conn.query_row(&sql, params![origin, row.group, version], read_message)?;
            Ok(stored)
        })
        .await
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
        self.write_state(MessageCategory::Published, message, status)
            .await
    }

    async fn change_receive_state(
        &self,
        message: &Message,
        status: MessageStatus,
    ) -> StorageResult<()> {
        self.write_state(MessageCategory::Received, message, status)
            .await
    }

    async fn try_change_publish_state(
        &self,
        id: i64,
        expected: &[MessageStatus],
        status: MessageStatus,
    ) -> StorageResult<bool> {
        self.compare_and_set(MessageCategory::Published, id, expected, status)
            .await
    }

    async fn try_change_receive_state(
        &self,
        id: i64,
        expected: &[MessageStatus],
        status: MessageStatus,
    ) -> StorageResult<bool> {
        self.compare_and_set(MessageCategory::Received, id, expected, status)
            .await
    }

    async fn claim_publish_backlog(
        &self,
        retry_backoff: Duration,
        limit: usize,
    ) -> StorageResult<Vec<Message>> {
        let quiet_before = to_nanos(lookback_cutoff(retry_backoff));
        self.call(move |conn, version| {
            let tx = conn.transaction()?;
            let mut claimed = {
                let sql = format!(
                    "SELECT {COLUMNS} FROM published
                     WHERE version = ?1 AND held = 0 AND status = 'PENDING'
                       AND (retries = 0 OR updated_at < ?2)
                     ORDER BY added, id
                     LIMIT ?3"
                );
                let mut stmt = tx.prepare(&sql)?;
                let rows = stmt.query_map(
                    params![version, quiet_before, sql_limit(limit)],
                    read_message,
                )?;
                rows.collect::<Result<Vec<_>, _>>()?
            };
            for message in &mut claimed {
                message.transition(MessageStatus::Queued);
                tx.execute(
                    "UPDATE published SET status = 'QUEUED', updated_at = ?1 WHERE id = ?2",
                    params![to_nanos(message.updated_at), message.id],
                )?;
            }
            tx.commit()?;
            Ok(claimed)
        })
        .await
    }

    async fn get_published_messages_needing_retry(
        &self,
        lookback: Duration,
        limit: usize,
    ) -> StorageResult<Vec<Message>> {
        self.needing_retry(MessageCategory::Published, lookback, limit)
            .await
    }

    async fn get_received_messages_needing_retry(
        &self,
        lookback: Duration,
        limit: usize,
    ) -> StorageResult<Vec<Message>> {
        self.needing_retry(MessageCategory::Received, lookback, limit)
            .await
    }

    async fn get_expired_delayed_messages(&self, limit: usize) -> StorageResult<Vec<Message>> {
        self.call(move |conn, version| {
            let sql = format!(
                "SELECT {COLUMNS} FROM published
                 WHERE version = ?1 AND held = 0 AND status = 'DELAYED' AND expires_at <= ?2
                 ORDER BY expires_at, id
                 LIMIT ?3"
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows =
                stmt.query_map(params![version, now_nanos(), sql_limit(limit)], read_message)?;
            Ok(rows.collect::<Result<Vec<_>, _>>()?)
        })
        .await
    }

    async fn delete_expired(
        &self,
        category: MessageCategory,
        status: MessageStatus,
        cutoff: DateTime<Utc>,
        batch_limit: usize,
    ) -> StorageResult<u64> {
        let cutoff = to_nanos(cutoff);
        self.call(move |conn, version| {
            let sql = format!(
                "DELETE FROM {table} WHERE id IN (
                     SELECT id FROM {table}
                     WHERE version = ?1 AND status = ?2 AND updated_at < ?3
                     LIMIT ?4
                 )",
                table = table(category)
            );
            let deleted = conn.execute(
                &sql,
                params![version, status.as_str(), cutoff, sql_limit(batch_limit)],
            )?;
            Ok(deleted as u64)
        })
        .await
    }

    async fn get_message(
        &self,
        category: MessageCategory,
        id: i64,
    ) -> StorageResult<Option<Message>> {
        self.call(move |conn, _| {
            let sql = format!("SELECT {COLUMNS} FROM {} WHERE id = ?1", table(category));
            Ok(conn.query_row(&sql, params![id], read_message).optional()?)
        })
        .await
    }

    async fn delete_message(&self, category: MessageCategory, id: i64) -> StorageResult<bool> {
        self.call(move |conn, _| {
            let sql = format!("DELETE FROM {} WHERE id = ?1", table(category));
            Ok(conn.execute(&sql, params![id])? > 0)
        })
        .await
    }

    async fn release_hold(&self, id: i64) -> StorageResult<()> {
        self.call(move |conn, _| {
            conn.execute("UPDATE published SET held = 0 WHERE id = ?1", params![id])?;
            Ok(())
        })
        .await
    }

    async fn acquire_lock(&self, key: &str, ttl: Duration, holder: &str) -> StorageResult<bool> {
        let key = key.to_string();
        let holder = holder.to_string();
        self.call(move |conn, _| {
            let now = now_nanos();
            let expires_at = now.saturating_add(i64::try_from(ttl.as_nanos()).unwrap_or(i64::MAX));
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM locks WHERE key = ?1 AND expires_at <= ?2",
                params![key, now],
            )?;
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO locks (key, holder, expires_at) VALUES (?1, ?2, ?3)",
                params![key, holder, expires_at],
            )?;
            tx.commit()?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn release_lock(&self, key: &str, holder: &str) -> StorageResult<()> {
        let key = key.to_string();
        let holder = holder.to_string();
        self.call(move |conn, _| {
            conn.execute(
                "DELETE FROM locks WHERE key = ?1 AND holder = ?2",
                params![key, holder],
            )?;
            Ok(())
        })
        .await
    }

    async fn renew_lock(&self, key: &str, ttl: Duration, holder: &str) -> StorageResult<bool> {
        let key = key.to_string();
        let holder = holder.to_string();
        self.call(move |conn, _| {
            let now = now_nanos();
            let expires_at = now.saturating_add(i64::try_from(ttl.as_nanos()).unwrap_or(i64::MAX));
            let changed = conn.execute(
                "UPDATE locks SET expires_at = ?1
                 WHERE key = ?2 AND holder = ?3 AND expires_at > ?4",
                params![expires_at, key, holder, now],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn statistics(&self) -> StorageResult<StorageStatistics> {
        self.call(move |conn, version| {
            let mut stats = StorageStatistics::default();
            for category in MessageCategory::ALL {
                let sql = format!(
                    "SELECT status, COUNT(*) FROM {} WHERE version = ?1 GROUP BY status",
                    table(category)
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params![version])?;
                while let Some(row) = rows.next()? {
                    let raw: String = row.get(0)?;
                    let count: i64 = row.get(1)?;
                    if let Ok(status) = raw.parse::<MessageStatus>() {
                        stats.record(category, status, u64::try_from(count).unwrap_or(0));
                    }
                }
            }
            Ok(stats)
        })
        .await
    }
}
