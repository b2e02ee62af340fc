use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Client;

use super::Deduplicator;
use crate::error::StorageResult;

/// Dedup via `SET key 1 NX PX ttl`.
#[derive(Clone)]
pub struct RedisDeduplicator {
    conn: MultiplexedConnection,
    prefix: String,
}

impl RedisDeduplicator {
    pub async fn connect(url: &str, prefix: impl Into<String>) -> StorageResult<Self> {
        let client = Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            conn,
            prefix: prefix.into(),
        })
    }
}

#[async_trait]
impl Deduplicator for RedisDeduplicator {
    async fn try_mark_processed(&self, key: &str, ttl: Duration) -> StorageResult<bool> {
        let mut conn = self.conn.clone();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);
        let reply: Option<String> = redis::cmd("SET")
            .arg(format!("{}:{key}", self.prefix))
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }
}
