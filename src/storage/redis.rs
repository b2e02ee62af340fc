//! Redis key-value storage.
//!
//! Layout under `{prefix}:{version}`:
//!
//! - `published:{id}` / `received:{id}`: hash with `body` (JSON envelope),
//!   `status` and `updated_at` (nanoseconds). The two loose fields are the
//!   source of truth so status changes can be compare-and-set in Lua.
//! - `published:status:{STATUS}` / `received:status:{STATUS}`: sorted set of
//!   ids per status, scored by `updated_at` in milliseconds. Every sweep is a
//!   `ZRANGEBYSCORE ... LIMIT` over one of these.
//! - `published:delayed`: `DELAYED` ids scored by their due time.
//! - `published:held`: ids of rows written inside an open transaction.
//! - `received:origin:{origin}:{group}`: inbox idempotency key.
//!
//! Status and index move together inside one Lua script, so a row is always
//! in exactly the index of its current status.
//!
//! Locks live at `{prefix}:lock:{key}` and use `SET NX PX`. Terminal rows can
//! be given a TTL so Redis expires them on its own; their index entries are
//! pruned when the collector next reaches them, and are counted by
//! [`MessageStorage::statistics`] until then.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisResult, Script};
use tracing::{debug, info};

use super::{
    defer_publish_state, enlist_stored_row, lookback_cutoff, MessageStorage, StorageStatistics,
};
use crate::error::{StorageError, StorageResult};
use crate::message::{headers, IdGenerator, Message, MessageCategory, MessageStatus};
use crate::transaction::Transaction;

const RANGE_PAGE: usize = 256;

/// KEYS: row, held set, delayed index.
/// ARGV: id, new status, updated_at ns, updated_at ms, status index prefix,
/// check held ("1"/"0"), expected statuses...
const CAS_SCRIPT: &str = r#"
if ARGV[6] == '1' and redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 1 then return 0 end
local current = redis.call('HGET', KEYS[1], 'status')
if not current then return 0 end
for i = 7, #ARGV do
  if ARGV[i] == current then
    redis.call('HSET', KEYS[1], 'status', ARGV[2], 'updated_at', ARGV[3])
    redis.call('ZREM', ARGV[5] .. current, ARGV[1])
    redis.call('ZADD', ARGV[5] .. ARGV[2], ARGV[4], ARGV[1])
    if ARGV[2] ~= 'DELAYED' then redis.call('ZREM', KEYS[3], ARGV[1]) end
    return 1
  end
end
return 0
"#;

/// KEYS: row, delayed index.
/// ARGV: id, new status, updated_at ns, updated_at ms, status index prefix,
/// body, due ms ("" when not delayed), terminal ttl ms ("0" for none).
const WRITE_STATE_SCRIPT: &str = r#"
local current = redis.call('HGET', KEYS[1], 'status')
if not current then return 0 end
redis.call('HSET', KEYS[1], 'body', ARGV[6], 'status', ARGV[2], 'updated_at', ARGV[3])
redis.call('ZREM', ARGV[5] .. current, ARGV[1])
redis.call('ZADD', ARGV[5] .. ARGV[2], ARGV[4], ARGV[1])
if ARGV[2] == 'DELAYED' and ARGV[7] ~= '' then
  redis.call('ZADD', KEYS[2], ARGV[7], ARGV[1])
else
  redis.call('ZREM', KEYS[2], ARGV[1])
end
if tonumber(ARGV[8]) > 0 then redis.call('PEXPIRE', KEYS[1], ARGV[8]) end
return 1
"#;

const RELEASE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// Redis-backed [`MessageStorage`].
#[derive(Clone)]
pub struct RedisStorage {
    conn: MultiplexedConnection,
    ids: Arc<IdGenerator>,
    namespace: String,
    lock_namespace: String,
    version: String,
    terminal_ttl: Option<Duration>,
}

impl RedisStorage {
    pub async fn connect(
        url: &str,
        key_prefix: &str,
        version: impl Into<String>,
        ids: Arc<IdGenerator>,
    ) -> StorageResult<Self> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        let version = version.into();
        info!(prefix = %key_prefix, version = %version, "Connected redis outbox storage");
        Ok(Self {
            conn,
            ids,
            namespace: format!("{key_prefix}:{version}"),
            lock_namespace: format!("{key_prefix}:lock"),
            version,
            terminal_ttl: None,
        })
    }

    /// Let Redis expire `SUCCEEDED`/`FAILED` rows after `ttl`.
    pub fn with_terminal_ttl(mut self, ttl: Duration) -> Self {
        self.terminal_ttl = Some(ttl);
        self
    }

    fn row_key(&self, category: MessageCategory, id: i64) -> String {
        format!("{}:{}:{id}", self.namespace, category.as_str())
    }

    fn status_prefix(&self, category: MessageCategory) -> String {
        format!("{}:{}:status:", self.namespace, category.as_str())
    }

    fn status_key(&self, category: MessageCategory, status: MessageStatus) -> String {
        format!("{}{}", self.status_prefix(category), status.as_str())
    }

    /// Only published rows are ever delayed; the received key stays empty.
    fn delayed_key(&self, category: MessageCategory) -> String {
        format!("{}:{}:delayed", self.namespace, category.as_str())
    }

    fn held_key(&self) -> String {
        format!("{}:published:held", self.namespace)
    }

    fn origin_key(&self, origin: i64, group: &str) -> String {
        format!("{}:received:origin:{origin}:{group}", self.namespace)
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}:{key}", self.lock_namespace)
    }

    async fn read_row(&self, category: MessageCategory, id: i64) -> StorageResult<Option<Message>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(self.row_key(category, id))
            .query_async(&mut conn)
            .await?;
        decode_row(fields)
    }

    /// Fetch several rows in one round trip. Missing rows come back as `None`.
    async fn read_rows(
        &self,
        category: MessageCategory,
        ids: &[i64],
    ) -> StorageResult<Vec<(i64, Option<Message>)>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for id in ids {
            pipe.cmd("HGETALL").arg(self.row_key(category, *id));
        }
        let replies: Vec<HashMap<String, String>> = pipe.query_async(&mut conn).await?;
        ids.iter()
            .copied()
            .zip(replies)
            .map(|(id, fields)| Ok((id, decode_row(fields)?)))
            .collect()
    }

    async fn held_ids(&self) -> StorageResult<HashSet<i64>> {
        let mut conn = self.conn.clone();
        let held: Vec<i64> = redis::cmd("SMEMBERS")
            .arg(self.held_key())
            .query_async(&mut conn)
            .await?;
        Ok(held.into_iter().collect())
    }

    async fn write_row(
        &self,
        category: MessageCategory,
        message: &Message,
        held: bool,
    ) -> StorageResult<()> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(self.row_key(category, message.id))
            .arg("body")
            .arg(serde_json::to_string(message)?)
            .arg("status")
            .arg(message.status.as_str())
            .arg("updated_at")
            .arg(to_nanos(message.updated_at))
            .ignore()
            .cmd("ZADD")
            .arg(self.status_key(category, message.status))
            .arg(to_millis(message.updated_at))
            .arg(message.id)
            .ignore();
        if message.status == MessageStatus::Delayed {
            pipe.cmd("ZADD")
                .arg(self.delayed_key(category))
                .arg(due_millis(message))
                .arg(message.id)
                .ignore();
        }
        if held {
            pipe.cmd("SADD").arg(self.held_key()).arg(message.id).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn write_state(
        &self,
        category: MessageCategory,
        message: &Message,
        status: MessageStatus,
    ) -> StorageResult<()> {
        let Some(mut row) = self.read_row(category, message.id).await? else {
            return Ok(());
        };
        row.status = status;
        row.retries = message.retries;
        row.expires_at = message.expires_at;
        row.headers = message.headers.clone();
        row.updated_at = Utc::now();

        let due = if status == MessageStatus::Delayed {
            due_millis(&row).to_string()
        } else {
            String::new()
        };
        let ttl = match (status.is_terminal(), self.terminal_ttl) {
            (true, Some(ttl)) => ttl_millis(ttl),
            _ => 0,
        };

        let mut conn = self.conn.clone();
        let _: i64 = Script::new(WRITE_STATE_SCRIPT)
            .key(self.row_key(category, row.id))
            .key(self.delayed_key(category))
            .arg(row.id)
            .arg(status.as_str())
            .arg(to_nanos(row.updated_at))
            .arg(to_millis(row.updated_at))
            .arg(self.status_prefix(category))
            .arg(serde_json::to_string(&row)?)
            .arg(due)
            .arg(ttl)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Page through `index` from the lowest score up to `max_score`, handing
    /// each live row to `keep` until `limit` rows are kept. Ids whose row has
    /// expired are removed from the index on the way.
    async fn range<F>(
        &self,
        category: MessageCategory,
        index: &str,
        max_score: String,
        limit: usize,
        mut keep: F,
    ) -> StorageResult<Vec<Message>>
    where
        F: FnMut(&Message) -> bool + Send,
    {
        let mut kept = Vec::new();
        let mut offset = 0usize;
        while kept.len() < limit {
            let mut conn = self.conn.clone();
            let ids: Vec<i64> = redis::cmd("ZRANGEBYSCORE")
                .arg(index)
                .arg("-inf")
                .arg(&max_score)
                .arg("LIMIT")
                .arg(offset)
                .arg(RANGE_PAGE)
                .query_async(&mut conn)
                .await?;
            let page_len = ids.len();

            let mut stale = Vec::new();
            for (id, row) in self.read_rows(category, &ids).await? {
                match row {
                    Some(message) if kept.len() < limit => {
                        if keep(&message) {
                            kept.push(message);
                        }
                    }
                    Some(_) => {}
                    None => stale.push(id),
                }
            }

            if !stale.is_empty() {
                let _: () = redis::cmd("ZREM")
                    .arg(index)
                    .arg(&stale)
                    .query_async(&mut conn)
                    .await?;
                debug!(category = %category, removed = stale.len(), "Pruned expired rows from index");
            }
            if page_len < RANGE_PAGE {
                break;
            }
            offset += page_len - stale.len();
        }
        Ok(kept)
    }

    async fn needing_retry(
        &self,
        category: MessageCategory,
        lookback: Duration,
        limit: usize,
    ) -> StorageResult<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let cutoff = format!("({}", to_millis(lookback_cutoff(lookback)));
        let held = match category {
            MessageCategory::Published => self.held_ids().await?,
            MessageCategory::Received => HashSet::new(),
        };

        let mut due = Vec::new();
        for status in MessageStatus::RETRYABLE {
            let index = self.status_key(category, status);
            let rows = self
                .range(category, &index, cutoff.clone(), limit, |message| {
                    !held.contains(&message.id) && message.can_retry()
                })
                .await?;
            due.extend(rows);
        }
        due.sort_by(|a, b| a.added.cmp(&b.added).then(a.id.cmp(&b.id)));
        due.truncate(limit);
        Ok(due)
    }

    async fn cas(
        &self,
        category: MessageCategory,
        id: i64,
        expected: &[MessageStatus],
        status: MessageStatus,
    ) -> StorageResult<bool> {
        if expected.is_empty() {
            return Ok(false);
        }
        let now = Utc::now();
        let mut conn = self.conn.clone();
        let script = Script::new(CAS_SCRIPT);
        let mut invocation = script.key(self.row_key(category, id));
        invocation
            .key(self.held_key())
            .key(self.delayed_key(category))
            .arg(id)
            .arg(status.as_str())
            .arg(to_nanos(now))
            .arg(to_millis(now))
            .arg(self.status_prefix(category))
            .arg(if category == MessageCategory::Published { "1" } else { "0" });
        for state in expected {
            invocation.arg(state.as_str());
        }
        let changed: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(changed == 1)
    }

    async fn remove_rows(&self, category: MessageCategory, rows: &[Message]) -> StorageResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for row in rows {
            pipe.cmd("DEL").arg(self.row_key(category, row.id)).ignore();
            for status in MessageStatus::ALL {
                pipe.cmd("ZREM")
                    .arg(self.status_key(category, status))
                    .arg(row.id)
                    .ignore();
            }
            pipe.cmd("ZREM").arg(self.delayed_key(category)).arg(row.id).ignore();
            match category {
                MessageCategory::Published => {
                    pipe.cmd("SREM").arg(self.held_key()).arg(row.id).ignore();
                }
                MessageCategory::Received => {
                    pipe.cmd("DEL")
                        .arg(self.origin_key(row.origin_id(), &row.group))
                        .ignore();
                }
            }
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }
}

fn to_nanos(at: DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt()
        .unwrap_or(if at.timestamp() < 0 { i64::MIN } else { i64::MAX })
}

/// Index scores are doubles; milliseconds stay exact where nanoseconds would not.
fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// A delayed row without a due time is due at once.
fn due_millis(message: &Message) -> i64 {
    message.expires_at.map_or(0, to_millis)
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1)
}

fn decode_row(mut fields: HashMap<String, String>) -> StorageResult<Option<Message>> {
    let Some(body) = fields.remove("body") else {
        return Ok(None);
    };
    let mut message: Message = serde_json::from_str(&body)?;
    if let Some(status) = fields.get("status") {
        message.status = status.parse().map_err(StorageError::Rejected)?;
    }
    if let Some(updated_at) = fields.get("updated_at").and_then(|raw| raw.parse::<i64>().ok()) {
        message.updated_at = DateTime::from_timestamp_nanos(updated_at);
    }
    Ok(Some(message))
}

#[async_trait]
impl MessageStorage for RedisStorage {
    async fn store_message(
        &self,
        message: Message,
        tx: Option<&Transaction>,
    ) -> StorageResult<Message> {
        let held = enlist_stored_row(self, tx, message.id)?;
        let mut message = message;
        message.version = self.version.clone();
        self.write_row(MessageCategory::Published, &message, held)
            .await?;
        Ok(message)
    }

    async fn store_received_message(
        &self,
        delivered: &Message,
        group: &str,
    ) -> StorageResult<Message> {
        let origin = delivered.origin_id();
        let origin_key = self.origin_key(origin, group);
        let mut conn = self.conn.clone();

        let existing: Option<i64> = redis::cmd("GET")
            .arg(&origin_key)
            .query_async(&mut conn)
            .await?;
        if let Some(id) = existing {
            if let Some(row) = self.read_row(MessageCategory::Received, id).await? {
                return Ok(row);
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
        row.version = self.version.clone();
        row.headers
            .insert(headers::MESSAGE_ID.to_string(), origin.to_string());
        self.write_row(MessageCategory::Received, &row, false).await?;

        let claimed: RedisResult<Option<String>> = redis::cmd("SET")
            .arg(&origin_key)
            .arg(row.id)
            .arg("NX")
            .query_async(&mut conn)
            .await;
        if claimed?.is_some() {
            return Ok(row);
        }

        // Lost the race against a concurrent delivery of the same message.
        self.remove_rows(MessageCategory::Received, std::slice::from_ref(&row))
            .await?;
        let winner: Option<i64> = redis::cmd("GET")
            .arg(&origin_key)
            .query_async(&mut conn)
            .await?;
        match winner {
            Some(id) => self
                .read_row(MessageCategory::Received, id)
                .await?
                .ok_or_else(|| StorageError::Rejected(format!("inbox row {id} vanished"))),
            None => Err(StorageError::Rejected(format!(
                "inbox key for origin {origin} vanished"
            ))),
        }
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
        self.cas(MessageCategory::Published, id, expected, status)
            .await
    }

    async fn try_change_receive_state(
        &self,
        id: i64,
        expected: &[MessageStatus],
        status: MessageStatus,
    ) -> StorageResult<bool> {
        self.cas(MessageCategory::Received, id, expected, status)
            .await
    }

    async fn claim_publish_backlog(
        &self,
        retry_backoff: Duration,
        limit: usize,
    ) -> StorageResult<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let quiet_before = lookback_cutoff(retry_backoff);
        let held = self.held_ids().await?;
        let index = self.status_key(MessageCategory::Published, MessageStatus::Pending);
        let mut candidates = self
            .range(
                MessageCategory::Published,
                &index,
                "+inf".to_string(),
                limit,
                |message| {
                    !held.contains(&message.id)
                        && (message.retries == 0 || message.updated_at < quiet_before)
                },
            )
            .await?;
        candidates.sort_by(|a, b| a.added.cmp(&b.added).then(a.id.cmp(&b.id)));

        let mut claimed = Vec::with_capacity(candidates.len());
        for mut message in candidates {
            if self
                .cas(
                    MessageCategory::Published,
                    message.id,
                    &[MessageStatus::Pending],
                    MessageStatus::Queued,
                )
                .await?
            {
                message.transition(MessageStatus::Queued);
                claimed.push(message);
            }
        }
        Ok(claimed)
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
        if limit == 0 {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        let held = self.held_ids().await?;
        let index = self.delayed_key(MessageCategory::Published);
        self.range(
            MessageCategory::Published,
            &index,
            to_millis(now).to_string(),
            limit,
            |message| {
                !held.contains(&message.id)
                    && message.status == MessageStatus::Delayed
                    && message.is_due(now)
            },
        )
        .await
    }

    async fn delete_expired(
        &self,
        category: MessageCategory,
        status: MessageStatus,
        cutoff: DateTime<Utc>,
        batch_limit: usize,
    ) -> StorageResult<u64> {
        if batch_limit == 0 {
            return Ok(0);
        }
        let index = self.status_key(category, status);
        let doomed = self
            .range(
                category,
                &index,
                format!("({}", to_millis(cutoff)),
                batch_limit,
                |message| message.status == status && message.updated_at < cutoff,
            )
            .await?;
        self.remove_rows(category, &doomed).await?;
        Ok(doomed.len() as u64)
    }

    async fn get_message(
        &self,
        category: MessageCategory,
        id: i64,
    ) -> StorageResult<Option<Message>> {
        self.read_row(category, id).await
    }

    async fn delete_message(&self, category: MessageCategory, id: i64) -> StorageResult<bool> {
        match self.read_row(category, id).await? {
            Some(row) => {
                self.remove_rows(category, std::slice::from_ref(&row))
                    .await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn release_hold(&self, id: i64) -> StorageResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SREM")
            .arg(self.held_key())
            .arg(id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn acquire_lock(&self, key: &str, ttl: Duration, holder: &str) -> StorageResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.lock_key(key))
            .arg(holder)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn release_lock(&self, key: &str, holder: &str) -> StorageResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = Script::new(RELEASE_SCRIPT)
            .key(self.lock_key(key))
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn renew_lock(&self, key: &str, ttl: Duration, holder: &str) -> StorageResult<bool> {
        let mut conn = self.conn.clone();
        let renewed: i64 = Script::new(RENEW_SCRIPT)
            .key(self.lock_key(key))
            .arg(holder)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    async fn statistics(&self) -> StorageResult<StorageStatistics> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        let mut slots = Vec::new();
        for category in MessageCategory::ALL {
            for status in MessageStatus::ALL {
                pipe.cmd("ZCARD").arg(self.status_key(category, status));
                slots.push((category, status));
            }
        }
        let counts: Vec<u64> = pipe.query_async(&mut conn).await?;

        let mut stats = StorageStatistics::default();
        for ((category, status), count) in slots.into_iter().zip(counts) {
            if count > 0 {
                stats.record(category, status, count);
            }
        }
        Ok(stats)
    }
}
