//! Executes registered handlers for inbox rows and writes back the result.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tracing::{debug, error, info, warn};

use super::{Context, DeliveryHandle, ExecuteItem, HandlerDescriptor, HandlerRegistry, OperateResult};
use crate::dedup::SharedDeduplicator;
use crate::error::{HandlerError, HandlerResult};
use crate::message::{headers, Message, MessageStatus};
use crate::queue::SharedQueue;
use crate::storage::SharedStorage;

/// Runs one inbox row through its handler.
///
/// Success writes `SUCCEEDED` and acknowledges. A failure writes `FAILED`,
/// counts the attempt, then either parks the row (permanent error or
/// ceiling reached, reject without requeue) or moves it back to `PENDING`
/// and has the transport redeliver it.
#[derive(Clone)]
pub struct SubscribeExecutor {
    storage: SharedStorage,
    queue: SharedQueue,
    registry: Arc<HandlerRegistry>,
    dedup: SharedDeduplicator,
}

impl SubscribeExecutor {
    pub fn new(
        storage: SharedStorage,
        queue: SharedQueue,
        registry: Arc<HandlerRegistry>,
        dedup: SharedDeduplicator,
    ) -> Self {
        Self {
            storage,
            queue,
            registry,
            dedup,
        }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Call the handler registered for the message's `(name, group)`
    /// directly, surfacing its error. No status is written.
    pub async fn invoke(&self, message: &Message) -> HandlerResult {
        let descriptor = self.registry.require(&message.name, &message.group)?;
        self.run(descriptor, message).await
    }

    pub async fn execute(&self, item: ExecuteItem) -> OperateResult {
        let ExecuteItem {
            mut message,
            delivery,
        } = item;

        if message.status == MessageStatus::Succeeded {
            debug!(message_id = message.id, "Already succeeded, acknowledging redelivery");
            self.acknowledge(delivery.as_ref()).await;
            return OperateResult::Succeeded;
        }

        let descriptor = match self.registry.require(&message.name, &message.group) {
            Ok(descriptor) => descriptor.clone(),
            Err(err) => {
                error!(
                    message_id = message.id,
                    name = %message.name,
                    group = %message.group,
                    "No handler registered, parking message"
                );
                return self.park(message, delivery.as_ref(), &err).await;
            }
        };
        if let Some(max_retries) = descriptor.max_retries() {
            message.max_retries = max_retries;
        }

        message.transition(MessageStatus::Retrying);
        self.record(&message).await;

        match self.run(&descriptor, &message).await {
            Ok(result) => {
                message.headers.remove(headers::EXCEPTION);
                message.transition(MessageStatus::Succeeded);
                self.record(&message).await;
                self.acknowledge(delivery.as_ref()).await;
                debug!(message_id = message.id, name = %message.name, ?result, "Handler succeeded");
                OperateResult::Succeeded
            }
            Err(err) => self.fail(message, delivery, &descriptor, err).await,
        }
    }

    async fn run(&self, descriptor: &HandlerDescriptor, message: &Message) -> HandlerResult {
        let ctx = Context::new(message.clone(), Arc::clone(&self.dedup));
        match AssertUnwindSafe(descriptor.call(ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(HandlerError::failed("handler panicked")),
        }
    }

    async fn fail(
        &self,
        mut message: Message,
        delivery: Option<DeliveryHandle>,
        descriptor: &HandlerDescriptor,
        err: HandlerError,
    ) -> OperateResult {
        let exhausted = message.record_failure();
        if !err.is_retryable() || exhausted {
            warn!(
                message_id = message.id,
                name = %message.name,
                retries = message.retries,
                max_retries = message.max_retries,
                error = %err,
                "Handler failed, parking message"
            );
            return self.park(message, delivery.as_ref(), &err).await;
        }

        message
            .headers
            .insert(headers::EXCEPTION.to_string(), err.to_string());
        message.transition(MessageStatus::Failed);
        self.record(&message).await;

        info!(
            message_id = message.id,
            name = %message.name,
            retries = message.retries,
            max_retries = message.max_retries,
            error = %err,
            "Handler failed, scheduling redelivery"
        );
        message.transition(MessageStatus::Pending);
        self.record(&message).await;

        let Some(delivery) = delivery else {
            // Came from the retry sweep; the next sweep picks it up again.
            return OperateResult::Retry;
        };
        match descriptor.retry_interval() {
            Some(interval) => {
                match self
                    .queue
                    .send_delay(&delivery.destination, &message, interval)
                    .await
                {
                    Ok(true) => self.reject(&delivery, false).await,
                    Ok(false) => self.reject(&delivery, true).await,
                    Err(err) => {
                        warn!(message_id = message.id, error = %err, "Delayed redelivery failed, requeueing");
                        self.reject(&delivery, true).await;
                    }
                }
            }
            None => self.reject(&delivery, true).await,
        }
        OperateResult::Retry
    }

    async fn park(
        &self,
        mut message: Message,
        delivery: Option<&DeliveryHandle>,
        err: &HandlerError,
    ) -> OperateResult {
        message
            .headers
            .insert(headers::EXCEPTION.to_string(), err.to_string());
        message.transition(MessageStatus::Failed);
        self.record(&message).await;
        if let Some(delivery) = delivery {
            self.reject(delivery, false).await;
        }
        OperateResult::Failed
    }

    async fn record(&self, message: &Message) {
        if let Err(err) = self
            .storage
            .change_receive_state(message, message.status)
            .await
        {
            warn!(message_id = message.id, status = %message.status, error = %err, "Failed to write receive state");
        }
    }

    async fn acknowledge(&self, delivery: Option<&DeliveryHandle>) {
        let Some(delivery) = delivery else {
            return;
        };
        if let Err(err) = self
            .queue
            .acknowledge(&delivery.destination, &delivery.delivery_id)
            .await
        {
            warn!(delivery_id = %delivery.delivery_id, error = %err, "Acknowledge failed");
        }
    }

    async fn reject(&self, delivery: &DeliveryHandle, requeue: bool) {
        if let Err(err) = self
            .queue
            .reject(&delivery.destination, &delivery.delivery_id, requeue)
            .await
        {
            warn!(delivery_id = %delivery.delivery_id, requeue, error = %err, "Reject failed");
        }
    }
}
