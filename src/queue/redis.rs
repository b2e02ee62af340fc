//! Redis Streams transport.
//!
//! Each destination is a stream `{prefix}:{destination}` read through one
//! consumer group. Delayed sends wait in a sorted set scored by due time
//! and are moved onto their stream by whichever receiver sees them first.
//!
//! An entry read but never acknowledged (its consumer died mid-delivery)
//! stays in the group's pending list. Once it has been idle for the
//! visibility timeout, the next receive claims it with `XAUTOCLAIM` and
//! delivers it again.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client, RedisResult, Value};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{decode_envelope, encode_envelope, Delivery, MessageQueue};
use crate::error::{TransportError, TransportResult};
use crate::message::Message;

const ENVELOPE_FIELD: &str = "envelope";
const PROMOTE_BATCH: isize = 100;
const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);

/// A delayed send parked in the sorted set.
#[derive(Serialize, Deserialize)]
struct DelayedFrame {
    destination: String,
    envelope: Vec<u8>,
    nonce: i64,
}

#[derive(Clone)]
pub struct RedisStreamQueue {
    conn: MultiplexedConnection,
    prefix: String,
    consumer_group: String,
    consumer_name: String,
    visibility_timeout: Duration,
    ready_groups: Arc<Mutex<HashSet<String>>>,
}

impl RedisStreamQueue {
    pub async fn connect(
        url: &str,
        prefix: impl Into<String>,
        consumer_group: impl Into<String>,
        consumer_name: impl Into<String>,
    ) -> TransportResult<Self> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        let queue = Self {
            conn,
            prefix: prefix.into(),
            consumer_group: consumer_group.into(),
            consumer_name: consumer_name.into(),
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            ready_groups: Arc::new(Mutex::new(HashSet::new())),
        };
        info!(
            prefix = %queue.prefix,
            group = %queue.consumer_group,
            consumer = %queue.consumer_name,
            "Connected redis stream transport"
        );
        Ok(queue)
    }

    /// How long a delivered entry may stay unacknowledged before another
    /// receiver claims it.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    fn stream_key(&self, destination: &str) -> String {
        format!("{}:{destination}", self.prefix)
    }

    fn delayed_key(&self) -> String {
        format!("{}:delayed", self.prefix)
    }

    /// Create the consumer group once per stream.
    async fn ensure_group(&self, stream: &str) -> TransportResult<()> {
        if self.ready_groups.lock().contains(stream) {
            return Ok(());
        }

        let mut conn = self.conn.clone();
        let result: RedisResult<()> = conn
            .xgroup_create_mkstream(stream, &self.consumer_group, "0")
            .await;
        match result {
            Ok(()) => {
                info!(stream, group = %self.consumer_group, "Created consumer group");
            }
            Err(err) if err.to_string().contains("BUSYGROUP") => {
                debug!(stream, group = %self.consumer_group, "Consumer group already exists");
            }
            Err(err) => return Err(err.into()),
        }
        self.ready_groups.lock().insert(stream.to_string());
        Ok(())
    }

    async fn append(&self, destination: &str, envelope: &[u8]) -> TransportResult<String> {
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd(self.stream_key(destination), "*", &[(ENVELOPE_FIELD, envelope)])
            .await?;
        Ok(id)
    }

    /// Move due delayed frames onto their streams. ZREM decides the winner
    /// when several receivers race for the same frame.
    async fn promote_delayed(&self) -> TransportResult<()> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp_millis();
        let due: Vec<Vec<u8>> = conn
            .zrangebyscore_limit(self.delayed_key(), "-inf", now, 0, PROMOTE_BATCH)
            .await?;

        for member in due {
            let removed: i64 = conn.zrem(self.delayed_key(), &member).await?;
            if removed == 0 {
                continue;
            }
            match bitcode::deserialize::<DelayedFrame>(&member) {
                Ok(frame) => {
                    self.append(&frame.destination, &frame.envelope).await?;
                }
                Err(err) => {
                    warn!(error = %err, "Dropping undecodable delayed frame");
                }
            }
        }
        Ok(())
    }

    /// Claim up to `count` entries idle past the visibility timeout for this
    /// consumer.
    async fn reclaim_idle(&self, stream: &str, count: usize) -> TransportResult<Vec<StreamId>> {
        let mut conn = self.conn.clone();
        let min_idle = u64::try_from(self.visibility_timeout.as_millis()).unwrap_or(u64::MAX);
        // Reply: [next cursor, [entries], [deleted ids]] (the last from Redis 7).
        let reply: Vec<Value> = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(&self.consumer_group)
            .arg(&self.consumer_name)
            .arg(min_idle)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;
        let claimed: StreamRangeReply = match reply.get(1) {
            Some(entries) => redis::from_redis_value(entries)?,
            None => StreamRangeReply::default(),
        };
        if !claimed.ids.is_empty() {
            info!(stream, claimed = claimed.ids.len(), "Reclaimed idle deliveries");
        }
        Ok(claimed.ids)
    }

    /// Turn stream entries into deliveries. Entries that cannot be decoded
    /// are acknowledged and dropped.
    async fn to_deliveries(
        &self,
        stream: &str,
        destination: &str,
        entries: Vec<StreamId>,
    ) -> TransportResult<Vec<Delivery>> {
        let mut deliveries = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(envelope) = envelope_of(&entry) else {
                warn!(stream, stream_id = %entry.id, "Entry without envelope, discarding");
                self.settle(stream, &entry.id).await?;
                continue;
            };
            match decode_envelope(&envelope) {
                Ok(message) => deliveries.push(Delivery {
                    delivery_id: entry.id.clone(),
                    destination: destination.to_string(),
                    message,
                }),
                Err(err) => {
                    warn!(stream, stream_id = %entry.id, error = %err, "Undecodable envelope, discarding");
                    self.settle(stream, &entry.id).await?;
                }
            }
        }
        Ok(deliveries)
    }

    async fn fetch_envelope(&self, stream: &str, delivery_id: &str) -> TransportResult<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn.xrange(stream, delivery_id, delivery_id).await?;
        Ok(reply.ids.first().and_then(envelope_of))
    }

    async fn settle(&self, stream: &str, delivery_id: &str) -> TransportResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(stream, &self.consumer_group, &[delivery_id])
            .await?;
        let _: i64 = conn.xdel(stream, &[delivery_id]).await?;
        Ok(())
    }
}

fn envelope_of(entry: &StreamId) -> Option<Vec<u8>> {
    entry.get::<Vec<u8>>(ENVELOPE_FIELD)
}

#[async_trait]
impl MessageQueue for RedisStreamQueue {
    async fn send(&self, destination: &str, message: &Message) -> TransportResult<bool> {
        let envelope = encode_envelope(message)?;
        let id = self.append(destination, &envelope).await?;
        debug!(destination, message_id = message.id, stream_id = %id, "Sent message");
        Ok(true)
    }

    async fn send_delay(
        &self,
        destination: &str,
        message: &Message,
        delay: Duration,
    ) -> TransportResult<bool> {
        let frame = DelayedFrame {
            destination: destination.to_string(),
            envelope: encode_envelope(message)?,
            nonce: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
        };
        let member = bitcode::serialize(&frame)?;
        let due = Utc::now().timestamp_millis()
            + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2);
        let mut conn = self.conn.clone();
        let _: i64 = conn.zadd(self.delayed_key(), member, due).await?;
        Ok(true)
    }

    async fn receive_batch(
        &self,
        destination: &str,
        max_count: usize,
        timeout: Duration,
    ) -> TransportResult<Vec<Delivery>> {
        let stream = self.stream_key(destination);
        self.ensure_group(&stream).await?;
        self.promote_delayed().await?;

        let count = max_count.max(1);
        let reclaimed = self.reclaim_idle(&stream, count).await?;
        if !reclaimed.is_empty() {
            return self.to_deliveries(&stream, destination, reclaimed).await;
        }

        let mut options = StreamReadOptions::default()
            .group(&self.consumer_group, &self.consumer_name)
            .count(count);
        let block_ms = usize::try_from(timeout.as_millis()).unwrap_or(usize::MAX);
        if block_ms > 0 {
            options = options.block(block_ms);
        }

        let mut conn = self.conn.clone();
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream.as_str()], &[">"], &options)
            .await?;
        let Some(reply) = reply else {
            return Ok(Vec::new());
        };
        let entries = reply.keys.into_iter().flat_map(|key| key.ids).collect();
        self.to_deliveries(&stream, destination, entries).await
    }

    async fn acknowledge(&self, destination: &str, delivery_id: &str) -> TransportResult<()> {
        self.settle(&self.stream_key(destination), delivery_id).await
    }

    async fn reject(
        &self,
        destination: &str,
        delivery_id: &str,
        requeue: bool,
    ) -> TransportResult<()> {
        let stream = self.stream_key(destination);
        if requeue {
            let envelope = self
                .fetch_envelope(&stream, delivery_id)
                .await?
                .ok_or_else(|| {
                    TransportError::Protocol(format!("stream entry {delivery_id} not found"))
                })?;
            self.append(destination, &envelope).await?;
        }
        self.settle(&stream, delivery_id).await
    }
}
