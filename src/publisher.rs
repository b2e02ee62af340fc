//! Publisher - the producer entry point.
//!
//! `publish` returns once the outbox row is durable. Dispatch to the
//! transport happens afterwards: immediately for a plain publish, after
//! commit for a transactional one. A dispatch problem never fails the
//! publish; the row stays in storage and the backlog or retry sweep picks
//! it up.
//!
//! ```ignore
//! let id = publisher
//!     .publish(
//!         "order.created",
//!         &OrderCreated { order_id: "O1".into() },
//!         PublishOptions::new().group("orders").header("tenant", "acme"),
//!     )
//!     .await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::OutboxConfig;
use crate::dispatcher::Dispatcher;
use crate::error::PublishError;
use crate::message::{IdGenerator, Message};
use crate::storage::SharedStorage;
use crate::transaction::Transaction;

/// Per-publish overrides of the configured defaults.
#[derive(Clone, Debug, Default)]
pub struct PublishOptions {
    group: Option<String>,
    headers: Vec<(String, String)>,
    delay: Option<Duration>,
    max_retries: Option<u32>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Add a header. Reserved `msg-*` keys are ignored.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Do not deliver before `delay` from now.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

#[derive(Clone)]
pub struct Publisher {
    storage: SharedStorage,
    dispatcher: Dispatcher,
    ids: Arc<IdGenerator>,
    version: Arc<str>,
    default_group: Arc<str>,
    default_max_retries: u32,
}

impl Publisher {
    pub fn new(
        storage: SharedStorage,
        dispatcher: Dispatcher,
        ids: Arc<IdGenerator>,
        config: &OutboxConfig,
    ) -> Self {
        Self {
            storage,
            dispatcher,
            ids,
            version: config.version.as_str().into(),
            default_group: config.default_group.as_str().into(),
            default_max_retries: config.default_max_retries,
        }
    }

    /// Serialize `payload` as JSON and publish it.
    pub async fn publish<T>(
        &self,
        name: &str,
        payload: &T,
        options: PublishOptions,
    ) -> Result<i64, PublishError>
    where
        T: Serialize + ?Sized,
    {
        let content = serde_json::to_string(payload)?;
        self.publish_raw(name, content, options).await
    }

    /// Publish pre-serialized content.
    pub async fn publish_raw(
        &self,
        name: &str,
        content: impl Into<String>,
        options: PublishOptions,
    ) -> Result<i64, PublishError> {
        let message = self.build(name, content.into(), options);
        let stored = self.storage.store_message(message, None).await?;
        let id = stored.id;
        debug!(message_id = id, name, group = %stored.group, "Message stored");
        self.dispatch(stored).await;
        Ok(id)
    }

    /// Publish inside `tx`. Nothing is dispatched until `tx` commits; on
    /// rollback the stored row is deleted.
    pub async fn publish_in<T>(
        &self,
        tx: &Transaction,
        name: &str,
        payload: &T,
        options: PublishOptions,
    ) -> Result<i64, PublishError>
    where
        T: Serialize + ?Sized,
    {
        if !tx.is_active() {
            return Err(PublishError::TransactionInactive);
        }
        let content = serde_json::to_string(payload)?;
        let message = self.build(name, content, options);
        let stored = self.storage.store_message(message, Some(tx)).await?;
        let id = stored.id;
        debug!(message_id = id, name, transaction_id = tx.id(), "Message stored in transaction");

        let publisher = self.clone();
        tx.after_commit(move || async move {
            publisher.dispatch(stored).await;
            Ok(())
        })
        .map_err(|_| PublishError::TransactionInactive)?;
        Ok(id)
    }

    fn build(&self, name: &str, content: String, options: PublishOptions) -> Message {
        let group = options
            .group
            .unwrap_or_else(|| self.default_group.to_string());
        let max_retries = options.max_retries.unwrap_or(self.default_max_retries);
        let mut message = Message::new(
            self.ids.next_id(),
            name,
            group,
            content,
            self.version.as_ref(),
            max_retries,
        )
        .with_headers(options.headers);

        if let Some(delay) = options.delay.filter(|delay| !delay.is_zero()) {
            let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
            let due = Utc::now().checked_add_signed(delay).unwrap_or(chrono::DateTime::<Utc>::MAX_UTC);
            message = message.delay_until(due);
        }
        message
    }

    async fn dispatch(&self, message: Message) {
        let id = message.id;
        if let Err(err) = self.dispatcher.enqueue_to_publish(message).await {
            warn!(message_id = id, error = %err, "Dispatch skipped, message left for the sweeps");
        }
    }
}
