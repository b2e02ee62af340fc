//! Receive loop for one consumer group.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ExecuteItem, HandlerRegistry};
use crate::dispatcher::{stopped, Dispatcher};
use crate::queue::{destination, Delivery, SharedQueue};
use crate::storage::SharedStorage;

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

struct Shared {
    group: String,
    destination: String,
    storage: SharedStorage,
    queue: SharedQueue,
    dispatcher: Dispatcher,
    registry: Arc<HandlerRegistry>,
    batch_size: usize,
    poll_timeout: Duration,
}

/// Pulls deliveries for `{group}.{version}`, records them in the inbox and
/// hands them to the dispatcher's execute queue.
///
/// A delivery whose inbox row is already terminal is acknowledged and
/// skipped. Anything that cannot be recorded or enqueued is rejected with
/// requeue so the transport delivers it again.
pub struct ConsumerLoop {
    shared: Arc<Shared>,
    stop: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ConsumerLoop {
    pub fn new(
        group: &str,
        version: &str,
        storage: SharedStorage,
        queue: SharedQueue,
        dispatcher: Dispatcher,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                group: group.to_string(),
                destination: destination(group, version),
                storage,
                queue,
                dispatcher,
                registry,
                batch_size: 16,
                poll_timeout: Duration::from_secs(1),
            }),
            stop,
            handle: Mutex::new(None),
        }
    }

    /// Receive up to `batch_size` deliveries per poll, waiting at most
    /// `poll_timeout`. Only effective before `start()`.
    pub fn with_batch(mut self, batch_size: usize, poll_timeout: Duration) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.batch_size = batch_size.max(1);
            shared.poll_timeout = poll_timeout;
        }
        self
    }

    pub fn group(&self) -> &str {
        &self.shared.group
    }

    pub fn destination(&self) -> &str {
        &self.shared.destination
    }

    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let stop = self.stop.subscribe();
        *handle = Some(tokio::spawn(run(shared, stop)));
        info!(group = %self.shared.group, destination = %self.shared.destination, "Consumer started");
    }

    /// Finish the batch in hand, then exit. Aborted after `grace`.
    pub async fn stop(&self, grace: Duration) {
        self.stop.send_replace(true);
        let Some(mut handle) = self.handle.lock().take() else {
            return;
        };
        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(group = %self.shared.group, error = %err, "Consumer ended abnormally"),
            Err(_) => {
                handle.abort();
                warn!(group = %self.shared.group, "Consumer overran shutdown grace, aborted");
            }
        }
        info!(group = %self.shared.group, "Consumer stopped");
    }
}

async fn run(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    // Not raced against the stop signal: an abandoned receive could strand
    // deliveries on some transports. The poll timeout bounds the wait.
    while !*stop.borrow() {
        let batch = shared
            .queue
            .receive_batch(&shared.destination, shared.batch_size, shared.poll_timeout)
            .await;
        match batch {
            Ok(deliveries) => {
                for delivery in deliveries {
                    shared.accept(delivery).await;
                }
            }
            Err(err) => {
                warn!(destination = %shared.destination, error = %err, "Receive failed, backing off");
                tokio::select! {
                    _ = stopped(&mut stop) => {}
                    _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                }
            }
        }
    }
}

impl Shared {
    async fn accept(&self, delivery: Delivery) {
        let mut delivered = delivery.message.clone();
        if let Some(max_retries) = self
            .registry
            .get(&delivered.name, &self.group)
            .and_then(|descriptor| descriptor.max_retries())
        {
            delivered.max_retries = max_retries;
        }

        let row = match self
            .storage
            .store_received_message(&delivered, &self.group)
            .await
        {
            Ok(row) => row,
            Err(err) => {
                warn!(origin_id = delivered.origin_id(), error = %err, "Failed to record delivery, requeueing");
                self.reject(&delivery, true).await;
                return;
            }
        };

        if row.is_terminal() {
            debug!(message_id = row.id, status = %row.status, "Redelivery of finished message, acknowledging");
            if let Err(err) = self
                .queue
                .acknowledge(&delivery.destination, &delivery.delivery_id)
                .await
            {
                warn!(delivery_id = %delivery.delivery_id, error = %err, "Acknowledge failed");
            }
            return;
        }

        let item = ExecuteItem::delivered(row, &delivery);
        if let Err(err) = self.dispatcher.enqueue_to_execute(item).await {
            debug!(delivery_id = %delivery.delivery_id, error = %err, "Dispatcher unavailable, requeueing");
            self.reject(&delivery, true).await;
        }
    }

    async fn reject(&self, delivery: &Delivery, requeue: bool) {
        if let Err(err) = self
            .queue
            .reject(&delivery.destination, &delivery.delivery_id, requeue)
            .await
        {
            warn!(delivery_id = %delivery.delivery_id, error = %err, "Reject failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::InMemoryDeduplicator;
    use crate::dispatcher::DispatcherSettings;
    use crate::message::{Message, MessageCategory, MessageStatus};
    use crate::queue::{InMemoryQueue, MessageQueue};
    use crate::storage::{InMemoryStorage, MessageStorage};
    use crate::subscriber::{HandlerDescriptor, SubscribeExecutor};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn wire(
        registry: HandlerRegistry,
    ) -> (InMemoryStorage, InMemoryQueue, Dispatcher, ConsumerLoop) {
        let storage = InMemoryStorage::new();
        let queue = InMemoryQueue::new();
        let shared_storage: SharedStorage = Arc::new(storage.clone());
        let shared_queue: SharedQueue = Arc::new(queue.clone());
        let registry = Arc::new(registry);
        let executor = SubscribeExecutor::new(
            Arc::clone(&shared_storage),
            Arc::clone(&shared_queue),
            Arc::clone(&registry),
            Arc::new(InMemoryDeduplicator::new()),
        );
        let dispatcher = Dispatcher::new(
            Arc::clone(&shared_storage),
            Arc::clone(&shared_queue),
            executor,
            DispatcherSettings::default(),
        );
        let consumer = ConsumerLoop::new(
            "orders",
            "v1",
            shared_storage,
            shared_queue,
            dispatcher.clone(),
            registry,
        )
        .with_batch(8, Duration::from_millis(20));
        (storage, queue, dispatcher, consumer)
    }

    fn received(storage: &InMemoryStorage) -> Vec<Message> {
        storage.messages(MessageCategory::Received)
    }

    #[tokio::test]
    async fn delivery_is_recorded_and_executed() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let (storage, queue, dispatcher, consumer) = wire(HandlerRegistry::new().subscribe(
            "order.created",
            "orders",
            move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(None) }
            },
        ));
        dispatcher.start();
        consumer.start();

        let message = Message::new(77, "order.created", "orders", "{}", "v1", 3);
        queue.send("orders.v1", &message).await.unwrap();

        let mut done = false;
        for _ in 0..200 {
            let rows = received(&storage);
            if rows.len() == 1 && rows[0].status == MessageStatus::Succeeded {
                assert_eq!(rows[0].origin_id(), 77);
                done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(done);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(queue.in_flight("orders.v1"), 0);

        consumer.stop(Duration::from_secs(1)).await;
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn redelivery_of_succeeded_message_is_acknowledged_only() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let (storage, queue, dispatcher, consumer) = wire(HandlerRegistry::new().subscribe(
            "order.created",
            "orders",
            move |_ctx| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(None) }
            },
        ));

        let message = Message::new(77, "order.created", "orders", "{}", "v1", 3);
        let row = storage
            .store_received_message(&message, "orders")
            .await
            .unwrap();
        storage
            .change_receive_state(&row, MessageStatus::Succeeded)
            .await
            .unwrap();

        dispatcher.start();
        consumer.start();
        queue.send("orders.v1", &message).await.unwrap();

        for _ in 0..100 {
            if queue.depth("orders.v1") == 0 && queue.in_flight("orders.v1") == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(queue.in_flight("orders.v1"), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(received(&storage).len(), 1);

        consumer.stop(Duration::from_secs(1)).await;
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn handler_ceiling_is_stored_on_the_inbox_row() {
        let (storage, queue, dispatcher, consumer) = wire(HandlerRegistry::new().register(
            HandlerDescriptor::new("order.created", "orders", |_ctx| async { Ok(None) })
                .with_max_retries(9),
        ));
        consumer.start();

        let message = Message::new(5, "order.created", "orders", "{}", "v1", 3);
        queue.send("orders.v1", &message).await.unwrap();

        let mut stored = None;
        for _ in 0..100 {
            if let Some(row) = received(&storage).pop() {
                stored = Some(row);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(stored.unwrap().max_retries, 9);

        consumer.stop(Duration::from_secs(1)).await;
        dispatcher.stop().await;
    }
}
