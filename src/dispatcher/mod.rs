//! Dispatcher - the in-process queues between storage and transport.
//!
//! ```text
//!  Publisher ──► publish queue ──► publish workers ──► MessageQueue::send
//!       │              ▲    ▲
//!       │ delayed      │    └── backlog task (claim PENDING → QUEUED)
//!       ▼              │
//!  scheduled queue ── scheduler tick (CAS DELAYED → QUEUED)
//!
//!  ConsumerLoop / retry sweep ──► execute queue ──► execute workers ──► SubscribeExecutor
//! ```
//!
//! The in-memory queues are bounded. Anything that overflows is written back
//! to storage as `PENDING` and re-offered by the backlog task.

mod scheduled;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::OutboxConfig;
use crate::error::DispatchError;
use crate::message::{Message, MessageStatus};
use crate::queue::SharedQueue;
use crate::storage::SharedStorage;
use crate::subscriber::{ExecuteItem, SubscribeExecutor};

pub use scheduled::ScheduledQueue;

/// Sizing and timing of the dispatcher's pools and tasks.
#[derive(Clone, Debug)]
pub struct DispatcherSettings {
    pub publish_workers: usize,
    pub execute_workers: usize,
    pub publish_queue_capacity: usize,
    pub execute_queue_capacity: usize,
    /// How long an offer waits on a full queue before falling back to storage.
    pub offer_timeout: Duration,
    pub scheduler_tick: Duration,
    pub scheduler_batch_size: usize,
    pub backlog_interval: Duration,
    pub backlog_batch_size: usize,
    /// Quiet period before a row whose send failed is claimed again.
    pub publish_retry_backoff: Duration,
    pub shutdown_grace: Duration,
}

impl DispatcherSettings {
    pub fn from_config(config: &OutboxConfig) -> Self {
        Self {
            publish_workers: config.publish_workers,
            execute_workers: config.execute_workers,
            publish_queue_capacity: config.publish_queue_capacity,
            execute_queue_capacity: config.execute_queue_capacity,
            offer_timeout: config.offer_timeout(),
            scheduler_tick: config.scheduler_tick(),
            scheduler_batch_size: config.scheduler_batch_size,
            backlog_interval: config.backlog_interval(),
            backlog_batch_size: config.backlog_batch_size,
            publish_retry_backoff: config.publish_retry_backoff(),
            shutdown_grace: config.shutdown_grace(),
        }
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self::from_config(&OutboxConfig::default())
    }
}

/// Snapshot of the dispatcher counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub sent: u64,
    pub send_failures: u64,
    pub executed: u64,
    /// Offers that hit a full queue and fell back to storage.
    pub overflowed: u64,
    /// Delayed messages moved onto the publish queue.
    pub promoted: u64,
    pub backlog_claimed: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    send_failures: AtomicU64,
    executed: AtomicU64,
    overflowed: AtomicU64,
    promoted: AtomicU64,
    backlog_claimed: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatcherStats {
        DispatcherStats {
            sent: self.sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            overflowed: self.overflowed.load(Ordering::Relaxed),
            promoted: self.promoted.load(Ordering::Relaxed),
            backlog_claimed: self.backlog_claimed.load(Ordering::Relaxed),
        }
    }
}

struct Inner {
    storage: SharedStorage,
    queue: SharedQueue,
    executor: SubscribeExecutor,
    settings: DispatcherSettings,
    publish_tx: mpsc::Sender<Message>,
    publish_rx: AsyncMutex<mpsc::Receiver<Message>>,
    execute_tx: mpsc::Sender<ExecuteItem>,
    execute_rx: AsyncMutex<mpsc::Receiver<ExecuteItem>>,
    scheduled: Mutex<ScheduledQueue>,
    running: AtomicBool,
    stopping: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    counters: Counters,
}

/// Owns the publish, execute and scheduled queues and their workers.
///
/// Cloning shares the same queues. Offers are accepted before `start()`;
/// they wait in the bounded queues until the workers come up.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        storage: SharedStorage,
        queue: SharedQueue,
        executor: SubscribeExecutor,
        settings: DispatcherSettings,
    ) -> Self {
        let (publish_tx, publish_rx) = mpsc::channel(settings.publish_queue_capacity.max(1));
        let (execute_tx, execute_rx) = mpsc::channel(settings.execute_queue_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                storage,
                queue,
                executor,
                settings,
                publish_tx,
                publish_rx: AsyncMutex::new(publish_rx),
                execute_tx,
                execute_rx: AsyncMutex::new(execute_rx),
                scheduled: Mutex::new(ScheduledQueue::new()),
                running: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                shutdown,
                tasks: Mutex::new(Vec::new()),
                counters: Counters::default(),
            }),
        }
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.inner.settings
    }

    pub fn stats(&self) -> DispatcherStats {
        self.inner.counters.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst) && !self.is_stopping()
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    /// Delayed messages waiting in memory.
    pub fn scheduled_len(&self) -> usize {
        self.inner.scheduled.lock().len()
    }

    /// Spawn the worker pools, the scheduler tick and the backlog task.
    /// Calling it again while running does nothing.
    pub fn start(&self) {
        if self.is_stopping() {
            warn!("Dispatcher already stopped, ignoring start");
            return;
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let settings = &self.inner.settings;
        let mut tasks = Vec::new();
        for worker in 0..settings.publish_workers {
            let inner = Arc::clone(&self.inner);
            let stop = self.inner.shutdown.subscribe();
            tasks.push(tokio::spawn(publish_worker(inner, stop, worker)));
        }
        for worker in 0..settings.execute_workers {
            let inner = Arc::clone(&self.inner);
            let stop = self.inner.shutdown.subscribe();
            tasks.push(tokio::spawn(execute_worker(inner, stop, worker)));
        }
        tasks.push(tokio::spawn(scheduler_task(
            Arc::clone(&self.inner),
            self.inner.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(backlog_task(
            Arc::clone(&self.inner),
            self.inner.shutdown.subscribe(),
        )));
        self.inner.tasks.lock().extend(tasks);

        info!(
            publish_workers = settings.publish_workers,
            execute_workers = settings.execute_workers,
            "Dispatcher started"
        );
    }

    /// Signal every task to finish its current item, then wait up to the
    /// shutdown grace before aborting what is left.
    pub async fn stop(&self) {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.send_replace(true);

        let handles = std::mem::take(&mut *self.inner.tasks.lock());
        let deadline = Instant::now() + self.inner.settings.shutdown_grace;
        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "Dispatcher task ended abnormally"),
                Err(_) => {
                    handle.abort();
                    warn!("Dispatcher task overran shutdown grace, aborted");
                }
            }
        }
        info!(stats = ?self.stats(), "Dispatcher stopped");
    }

    /// Hand a stored outbox row to the transport. Delayed rows go to the
    /// scheduled queue instead.
    pub async fn enqueue_to_publish(&self, message: Message) -> Result<(), DispatchError> {
        self.ensure_accepting()?;
        if message.status == MessageStatus::Delayed {
            self.inner.scheduled.lock().push(message);
            return Ok(());
        }
        self.inner.offer_publish(message).await;
        Ok(())
    }

    /// Park a delayed row until its due time.
    pub fn enqueue_to_schedule(&self, message: Message) -> Result<(), DispatchError> {
        self.ensure_accepting()?;
        self.inner.scheduled.lock().push(message);
        Ok(())
    }

    /// Hand an inbox row to the execute workers.
    pub async fn enqueue_to_execute(&self, item: ExecuteItem) -> Result<(), DispatchError> {
        self.ensure_accepting()?;
        self.inner.offer_execute(item).await;
        Ok(())
    }

    fn ensure_accepting(&self) -> Result<(), DispatchError> {
        if self.is_stopping() {
            Err(DispatchError::Stopped)
        } else {
            Ok(())
        }
    }
}

impl Inner {
    async fn offer_publish(&self, message: Message) {
        match self
            .publish_tx
            .send_timeout(message, self.settings.offer_timeout)
            .await
        {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(mut message) | SendTimeoutError::Closed(mut message)) => {
                Counters::bump(&self.counters.overflowed, 1);
                debug!(message_id = message.id, "Publish queue full, leaving message to the backlog");
                message.transition(MessageStatus::Pending);
                self.write_publish_state(&message).await;
            }
        }
    }

    async fn offer_execute(&self, item: ExecuteItem) {
        match self
            .execute_tx
            .send_timeout(item, self.settings.offer_timeout)
            .await
        {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(item) | SendTimeoutError::Closed(item)) => {
                Counters::bump(&self.counters.overflowed, 1);
                debug!(message_id = item.message.id, "Execute queue full, requeueing delivery");
                if let Some(delivery) = item.delivery {
                    if let Err(err) = self
                        .queue
                        .reject(&delivery.destination, &delivery.delivery_id, true)
                        .await
                    {
                        warn!(delivery_id = %delivery.delivery_id, error = %err, "Requeue after overflow failed");
                    }
                }
            }
        }
    }

    async fn publish_one(&self, mut message: Message) {
        let destination = message.destination();
        let failure = match self.queue.send(&destination, &message).await {
            Ok(true) => None,
            Ok(false) => Some("transport refused the message".to_string()),
            Err(err) => Some(err.to_string()),
        };

        match failure {
            None => {
                Counters::bump(&self.counters.sent, 1);
                message.transition(MessageStatus::Succeeded);
                self.write_publish_state(&message).await;
                debug!(message_id = message.id, destination = %destination, "Message sent");
            }
            Some(reason) => {
                Counters::bump(&self.counters.send_failures, 1);
                let status = if message.record_failure() {
                    MessageStatus::Failed
                } else {
                    MessageStatus::Pending
                };
                message.transition(status);
                self.write_publish_state(&message).await;
                warn!(
                    message_id = message.id,
                    destination = %destination,
                    retries = message.retries,
                    status = %status,
                    reason = %reason,
                    "Send failed"
                );
            }
        }
    }

    async fn write_publish_state(&self, message: &Message) {
        if let Err(err) = self
            .storage
            .change_publish_state(message, message.status, None)
            .await
        {
            warn!(message_id = message.id, status = %message.status, error = %err, "Failed to write publish state");
        }
    }

    /// Move due delayed rows onto the publish queue. Both the in-memory heap
    /// and the storage sweep feed the same CAS, so each row is promoted once.
    async fn promote_delayed(&self) {
        let batch = self.settings.scheduler_batch_size;
        let due = self.scheduled.lock().pop_due(Utc::now(), batch);
        for message in due {
            self.promote(message).await;
        }

        match self.storage.get_expired_delayed_messages(batch).await {
            Ok(rows) => {
                for message in rows {
                    self.promote(message).await;
                }
            }
            Err(err) => warn!(error = %err, "Delayed message sweep failed"),
        }
    }

    async fn promote(&self, mut message: Message) {
        match self
            .storage
            .try_change_publish_state(message.id, &[MessageStatus::Delayed], MessageStatus::Queued)
            .await
        {
            Ok(true) => {
                Counters::bump(&self.counters.promoted, 1);
                message.transition(MessageStatus::Queued);
                self.offer_publish(message).await;
            }
            Ok(false) => {
                debug!(message_id = message.id, "Delayed message already promoted");
            }
            Err(err) => {
                warn!(message_id = message.id, error = %err, "Delayed promotion failed, storage sweep will retry");
            }
        }
    }

    async fn drain_backlog(&self) {
        match self
            .storage
            .claim_publish_backlog(
                self.settings.publish_retry_backoff,
                self.settings.backlog_batch_size,
            )
            .await
        {
            Ok(rows) if rows.is_empty() => {}
            Ok(rows) => {
                Counters::bump(&self.counters.backlog_claimed, rows.len() as u64);
                debug!(count = rows.len(), "Claimed publish backlog");
                for message in rows {
                    self.offer_publish(message).await;
                }
            }
            Err(err) => warn!(error = %err, "Backlog claim failed"),
        }
    }
}

/// Resolves once the stop flag is raised or its sender is gone. The watch
/// guard is dropped before returning so callers can race it in `select!`.
pub(crate) async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}

async fn publish_worker(inner: Arc<Inner>, mut stop: watch::Receiver<bool>, worker: usize) {
    debug!(worker, "Publish worker started");
    loop {
        let next = tokio::select! {
            _ = stopped(&mut stop) => None,
            message = async { inner.publish_rx.lock().await.recv().await } => message,
        };
        let Some(message) = next else {
            break;
        };
        inner.publish_one(message).await;
    }
    debug!(worker, "Publish worker exited");
}

async fn execute_worker(inner: Arc<Inner>, mut stop: watch::Receiver<bool>, worker: usize) {
    debug!(worker, "Execute worker started");
    loop {
        let next = tokio::select! {
            _ = stopped(&mut stop) => None,
            item = async { inner.execute_rx.lock().await.recv().await } => item,
        };
        let Some(item) = next else {
            break;
        };
        let message_id = item.message.id;
        let result = inner.executor.execute(item).await;
        Counters::bump(&inner.counters.executed, 1);
        debug!(worker, message_id, ?result, "Executed message");
    }
    debug!(worker, "Execute worker exited");
}

async fn scheduler_task(inner: Arc<Inner>, mut stop: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(inner.settings.scheduler_tick);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stopped(&mut stop) => break,
            _ = tick.tick() => inner.promote_delayed().await,
        }
    }
    debug!("Scheduler task exited");
}

async fn backlog_task(inner: Arc<Inner>, mut stop: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(inner.settings.backlog_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stopped(&mut stop) => break,
            _ = tick.tick() => inner.drain_backlog().await,
        }
    }
    debug!("Backlog task exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dedup::InMemoryDeduplicator;
    use crate::error::{TransportError, TransportResult};
    use crate::message::MessageCategory;
    use crate::queue::{Delivery, InMemoryQueue, MessageQueue};
    use crate::storage::{InMemoryStorage, MessageStorage};
    use crate::subscriber::HandlerRegistry;
    use async_trait::async_trait;

    const DEST: &str = "orders.v1";

    fn settings() -> DispatcherSettings {
        DispatcherSettings {
            scheduler_tick: Duration::from_millis(20),
            backlog_interval: Duration::from_millis(20),
            offer_timeout: Duration::from_millis(10),
            publish_retry_backoff: Duration::from_millis(50),
            shutdown_grace: Duration::from_secs(1),
            ..DispatcherSettings::default()
        }
    }

    fn dispatcher_with(
        storage: &InMemoryStorage,
        queue: SharedQueue,
        settings: DispatcherSettings,
    ) -> Dispatcher {
        let storage: SharedStorage = Arc::new(storage.clone());
        let executor = SubscribeExecutor::new(
            Arc::clone(&storage),
            Arc::clone(&queue),
            Arc::new(HandlerRegistry::new()),
            Arc::new(InMemoryDeduplicator::new()),
        );
        Dispatcher::new(storage, queue, executor, settings)
    }

    async fn stored(storage: &InMemoryStorage, id: i64, max_retries: u32) -> Message {
        storage
            .store_message(
                Message::new(id, "order.created", "orders", "{}", "v1", max_retries),
                None,
            )
            .await
            .unwrap()
    }

    async fn status_of(storage: &InMemoryStorage, id: i64) -> MessageStatus {
        storage
            .get_message(MessageCategory::Published, id)
            .await
            .unwrap()
            .unwrap()
            .status
    }

    async fn wait_for_status(storage: &InMemoryStorage, id: i64, status: MessageStatus) -> bool {
        for _ in 0..200 {
            if status_of(storage, id).await == status {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Transport that is always down.
    struct DownQueue;

    #[async_trait]
    impl MessageQueue for DownQueue {
        async fn send(&self, _: &str, _: &Message) -> TransportResult<bool> {
            Err(TransportError::ConnectionFailed("broker offline".into()))
        }

        async fn send_delay(&self, _: &str, _: &Message, _: Duration) -> TransportResult<bool> {
            Err(TransportError::ConnectionFailed("broker offline".into()))
        }

        async fn receive_batch(&self, _: &str, _: usize, _: Duration) -> TransportResult<Vec<Delivery>> {
            Ok(Vec::new())
        }

        async fn acknowledge(&self, _: &str, _: &str) -> TransportResult<()> {
            Ok(())
        }

        async fn reject(&self, _: &str, _: &str, _: bool) -> TransportResult<()> {
            Ok(())
        }
    }

    // ========================================================================
    // Test 1: Publish path
    // ========================================================================

    #[tokio::test]
    async fn offers_before_start_are_sent_once_started() {
        let storage = InMemoryStorage::new();
        let queue = InMemoryQueue::new();
        let dispatcher = dispatcher_with(&storage, Arc::new(queue.clone()), settings());

        let message = stored(&storage, 1, 3).await;
        dispatcher.enqueue_to_publish(message).await.unwrap();
        assert_eq!(queue.depth(DEST), 0);

        dispatcher.start();
        assert!(wait_for_status(&storage, 1, MessageStatus::Succeeded).await);
        assert_eq!(queue.depth(DEST), 1);
        assert_eq!(dispatcher.stats().sent, 1);
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn send_failure_counts_retries_until_failed() {
        let storage = InMemoryStorage::new();
        let dispatcher = dispatcher_with(&storage, Arc::new(DownQueue), settings());
        dispatcher.start();

        let message = stored(&storage, 1, 2).await;
        dispatcher.enqueue_to_publish(message).await.unwrap();

        // First failure goes PENDING, the backlog re-offers it after the
        // backoff, second fails for good.
        assert!(wait_for_status(&storage, 1, MessageStatus::Failed).await);
        let row = storage
            .get_message(MessageCategory::Published, 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.retries, 2);
        assert_eq!(dispatcher.stats().send_failures, 2);
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn failed_send_waits_out_the_backoff() {
        let storage = InMemoryStorage::new();
        let dispatcher = dispatcher_with(
            &storage,
            Arc::new(DownQueue),
            DispatcherSettings {
                publish_retry_backoff: Duration::from_millis(400),
                ..settings()
            },
        );
        dispatcher.start();

        let message = stored(&storage, 1, 5).await;
        dispatcher.enqueue_to_publish(message).await.unwrap();
        assert!(wait_for_status(&storage, 1, MessageStatus::Pending).await);

        // Several backlog ticks pass without a second attempt.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(dispatcher.stats().send_failures, 1);
        assert_eq!(dispatcher.stats().backlog_claimed, 0);

        for _ in 0..100 {
            if dispatcher.stats().send_failures >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(dispatcher.stats().send_failures, 2);
        dispatcher.stop().await;
    }

    // ========================================================================
    // Test 2: Backpressure and backlog
    // ========================================================================

    #[tokio::test]
    async fn overflow_falls_back_to_pending_and_backlog_recovers_it() {
        let storage = InMemoryStorage::new();
        let queue = InMemoryQueue::new();
        let dispatcher = dispatcher_with(
            &storage,
            Arc::new(queue.clone()),
            DispatcherSettings {
                publish_queue_capacity: 1,
                ..settings()
            },
        );

        for id in 1..=2 {
            let message = stored(&storage, id, 3).await;
            dispatcher.enqueue_to_publish(message).await.unwrap();
        }
        assert_eq!(dispatcher.stats().overflowed, 1);
        assert_eq!(status_of(&storage, 2).await, MessageStatus::Pending);

        dispatcher.start();
        assert!(wait_for_status(&storage, 1, MessageStatus::Succeeded).await);
        assert!(wait_for_status(&storage, 2, MessageStatus::Succeeded).await);
        assert_eq!(dispatcher.stats().backlog_claimed, 1);
        assert_eq!(queue.depth(DEST), 2);
        dispatcher.stop().await;
    }

    // ========================================================================
    // Test 3: Delayed messages
    // ========================================================================

    #[tokio::test]
    async fn delayed_message_waits_for_due_time() {
        let storage = InMemoryStorage::new();
        let queue = InMemoryQueue::new();
        let dispatcher = dispatcher_with(&storage, Arc::new(queue.clone()), settings());
        dispatcher.start();

        let due = Utc::now() + chrono::Duration::milliseconds(150);
        let message = storage
            .store_message(
                Message::new(1, "order.created", "orders", "{}", "v1", 3).delay_until(due),
                None,
            )
            .await
            .unwrap();
        dispatcher.enqueue_to_publish(message).await.unwrap();
        assert_eq!(dispatcher.scheduled_len(), 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(queue.depth(DEST), 0);
        assert_eq!(status_of(&storage, 1).await, MessageStatus::Delayed);

        assert!(wait_for_status(&storage, 1, MessageStatus::Succeeded).await);
        assert!(Utc::now() >= due);
        assert_eq!(queue.depth(DEST), 1);
        dispatcher.stop().await;
    }

    #[tokio::test]
    async fn heap_and_storage_sweep_promote_once() {
        let storage = InMemoryStorage::new();
        let queue = InMemoryQueue::new();
        let dispatcher = dispatcher_with(&storage, Arc::new(queue.clone()), settings());

        let due = Utc::now() - chrono::Duration::milliseconds(10);
        let message = storage
            .store_message(
                Message::new(1, "order.created", "orders", "{}", "v1", 3).delay_until(due),
                None,
            )
            .await
            .unwrap();
        // Seen by both the in-memory heap and the storage sweep.
        dispatcher.enqueue_to_schedule(message).unwrap();
        dispatcher.start();

        assert!(wait_for_status(&storage, 1, MessageStatus::Succeeded).await);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(dispatcher.stats().promoted, 1);
        assert_eq!(queue.depth(DEST), 1);
        dispatcher.stop().await;
    }

    // ========================================================================
    // Test 4: Lifecycle
    // ========================================================================

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn worker_futures_are_send() {
        let storage = InMemoryStorage::new();
        let dispatcher = dispatcher_with(&storage, Arc::new(InMemoryQueue::new()), settings());
        let inner = &dispatcher.inner;

        assert_send(&publish_worker(Arc::clone(inner), inner.shutdown.subscribe(), 0));
        assert_send(&execute_worker(Arc::clone(inner), inner.shutdown.subscribe(), 0));
        assert_send(&scheduler_task(Arc::clone(inner), inner.shutdown.subscribe()));
        assert_send(&backlog_task(Arc::clone(inner), inner.shutdown.subscribe()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn stop_is_prompt_on_a_multi_threaded_runtime() {
        let storage = InMemoryStorage::new();
        let queue = InMemoryQueue::new();
        let dispatcher = dispatcher_with(&storage, Arc::new(queue.clone()), settings());
        dispatcher.start();

        let message = stored(&storage, 1, 3).await;
        dispatcher.enqueue_to_publish(message).await.unwrap();
        assert!(wait_for_status(&storage, 1, MessageStatus::Succeeded).await);

        let started = std::time::Instant::now();
        dispatcher.stop().await;
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(dispatcher.inner.tasks.lock().is_empty());
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_rejects_offers() {
        let storage = InMemoryStorage::new();
        let dispatcher = dispatcher_with(&storage, Arc::new(InMemoryQueue::new()), settings());
        dispatcher.start();
        dispatcher.start();
        assert!(dispatcher.is_running());

        dispatcher.stop().await;
        assert!(!dispatcher.is_running());

        let message = stored(&storage, 1, 3).await;
        assert_eq!(
            dispatcher.enqueue_to_publish(message.clone()).await,
            Err(DispatchError::Stopped)
        );
        assert_eq!(
            dispatcher
                .enqueue_to_execute(ExecuteItem::stored(message))
                .await,
            Err(DispatchError::Stopped)
        );
    }
}
