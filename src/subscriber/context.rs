//! Context passed to message handlers.
//!
//! Carries the inbox row being executed and the dedup port. Handlers read
//! the payload and headers through it and use [`Context::once`] to guard
//! side effects against redelivery.

use std::collections::HashMap;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::dedup::SharedDeduplicator;
use crate::error::HandlerError;
use crate::message::Message;

#[derive(Clone)]
pub struct Context {
    message: Message,
    dedup: SharedDeduplicator,
}

impl Context {
    pub(crate) fn new(message: Message, dedup: SharedDeduplicator) -> Self {
        Self { message, dedup }
    }

    /// Deserialize the payload into a typed struct.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(self.message.payload()?)
    }

    /// Get the raw JSON payload.
    pub fn raw_payload(&self) -> &str {
        &self.message.content
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn name(&self) -> &str {
        &self.message.name
    }

    /// The consumer group this execution belongs to.
    pub fn group(&self) -> &str {
        &self.message.group
    }

    /// The id the publisher assigned.
    pub fn origin_id(&self) -> i64 {
        self.message.origin_id()
    }

    /// Failed attempts so far.
    pub fn attempt(&self) -> u32 {
        self.message.retries
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.message.header(key)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.message.headers
    }

    /// `true` the first time `key` is seen by this group within `ttl`.
    ///
    /// ```ignore
    /// if ctx.once(&format!("charge:{}", order.id), Duration::from_secs(3600)).await? {
    ///     payments.charge(&order).await.map_err(HandlerError::failed)?;
    /// }
    /// ```
    pub async fn once(&self, key: &str, ttl: Duration) -> Result<bool, HandlerError> {
        let scoped = format!("{}:{key}", self.message.group);
        Ok(self.dedup.try_mark_processed(&scoped, ttl).await?)
    }
}
