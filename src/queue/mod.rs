//! Queue port - the transport between publishers and consumers.
//!
//! A destination is named `{group}.{version}` so independently deployed
//! processes agree on queue identity without discovery. Messages travel as
//! a bitcode-encoded [`Message`]; consumers get back a [`Delivery`] whose
//! `delivery_id` is the handle for [`MessageQueue::acknowledge`] and
//! [`MessageQueue::reject`].

mod memory;
#[cfg(feature = "redis")]
mod redis;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportResult;
use crate::message::Message;

pub use memory::InMemoryQueue;
#[cfg(feature = "redis")]
pub use self::redis::RedisStreamQueue;

/// Transport name shared by every publisher and subscriber of a group.
pub fn destination(group: &str, version: &str) -> String {
    format!("{group}.{version}")
}

/// Encode a message for the wire.
pub fn encode_envelope(message: &Message) -> TransportResult<Vec<u8>> {
    Ok(bitcode::serialize(message)?)
}

/// Decode a wire frame back into a message.
pub fn decode_envelope(bytes: &[u8]) -> TransportResult<Message> {
    Ok(bitcode::deserialize(bytes)?)
}

/// A message handed to a consumer, pending disposition.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub delivery_id: String,
    pub destination: String,
    pub message: Message,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Best-effort enqueue. `Ok(false)` means the transport refused the
    /// message (e.g. full) and the caller decides whether to retry.
    async fn send(&self, destination: &str, message: &Message) -> TransportResult<bool>;

    /// Deliver no earlier than `delay` from now.
    async fn send_delay(
        &self,
        destination: &str,
        message: &Message,
        delay: Duration,
    ) -> TransportResult<bool>;

    /// Wait up to `timeout` for up to `max_count` deliveries. Returns as soon
    /// as anything is available; an empty batch means the timeout elapsed.
    async fn receive_batch(
        &self,
        destination: &str,
        max_count: usize,
        timeout: Duration,
    ) -> TransportResult<Vec<Delivery>>;

    async fn acknowledge(&self, destination: &str, delivery_id: &str) -> TransportResult<()>;

    /// `requeue = true` makes the message visible again; `false` discards it.
    async fn reject(&self, destination: &str, delivery_id: &str, requeue: bool)
        -> TransportResult<()>;
}

pub type SharedQueue = Arc<dyn MessageQueue>;
