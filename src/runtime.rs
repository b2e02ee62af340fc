//! Runtime facade wiring storage, transport, dispatcher, consumers and the
//! background processors together.
//!
//! ```ignore
//! let handlers = HandlerRegistry::new()
//!     .subscribe_typed("order.created", "orders", |order: OrderCreated, _ctx| async move {
//!         ship(order).await.map_err(HandlerError::failed)?;
//!         Ok(None)
//!     });
//!
//! let outbox = Outbox::builder(OutboxConfig::from_file("outbox.toml")?)
//!     .handlers(handlers)
//!     .build()
//!     .await?;
//! outbox.start();
//!
//! outbox.publisher()
//!     .publish("order.created", &order, PublishOptions::new().group("orders"))
//!     .await?;
//!
//! outbox.shutdown().await;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::info;

use crate::config::{OutboxConfig, QueueConfig, StorageConfig};
use crate::dedup::{SharedDeduplicator, StorageDeduplicator};
use crate::dispatcher::{Dispatcher, DispatcherSettings};
use crate::error::{ConfigError, OutboxResult, StorageResult};
use crate::lock::instance_holder;
use crate::message::{IdGenerator, Message, MessageCategory};
use crate::processor::{CollectorProcessor, ProcessorHandle, RetryProcessor};
use crate::publisher::Publisher;
use crate::queue::{InMemoryQueue, SharedQueue};
use crate::storage::{InMemoryStorage, SharedStorage, StorageStatistics};
use crate::subscriber::{ConsumerLoop, HandlerRegistry, SubscribeExecutor};
use crate::transaction::{AmbientTransaction, Transaction};

/// Collects the optional explicit ports before [`Outbox`] is assembled.
/// Anything not given is built from the configuration.
pub struct OutboxBuilder {
    config: OutboxConfig,
    storage: Option<SharedStorage>,
    queue: Option<SharedQueue>,
    dedup: Option<SharedDeduplicator>,
    handlers: HandlerRegistry,
}

impl OutboxBuilder {
    pub fn storage(mut self, storage: SharedStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn queue(mut self, queue: SharedQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn deduplicator(mut self, dedup: SharedDeduplicator) -> Self {
        self.dedup = Some(dedup);
        self
    }

    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = handlers;
        self
    }

    pub async fn build(self) -> OutboxResult<Outbox> {
        let config = self.config;
        config.validate()?;

        let ids = Arc::new(config.worker_id.map(IdGenerator::new).unwrap_or_default());
        let storage = match self.storage {
            Some(storage) => storage,
            None => open_storage(&config, Arc::clone(&ids)).await?,
        };
        let queue = match self.queue {
            Some(queue) => queue,
            None => open_queue(&config, ids.worker_id()).await?,
        };
        let dedup = self.dedup.unwrap_or_else(|| {
            Arc::new(StorageDeduplicator::new(Arc::clone(&storage))) as SharedDeduplicator
        });
        let registry = Arc::new(self.handlers);

        let executor = SubscribeExecutor::new(
            Arc::clone(&storage),
            Arc::clone(&queue),
            Arc::clone(&registry),
            dedup,
        );
        let dispatcher = Dispatcher::new(
            Arc::clone(&storage),
            Arc::clone(&queue),
            executor,
            DispatcherSettings::from_config(&config),
        );
        let publisher = Publisher::new(
            Arc::clone(&storage),
            dispatcher.clone(),
            Arc::clone(&ids),
            &config,
        );

        let consumers = registry
            .groups()
            .into_iter()
            .map(|group| {
                ConsumerLoop::new(
                    &group,
                    &config.version,
                    Arc::clone(&storage),
                    Arc::clone(&queue),
                    dispatcher.clone(),
                    Arc::clone(&registry),
                )
                .with_batch(config.consumer_batch_size, config.consumer_poll_timeout())
            })
            .collect();

        let mut retry = RetryProcessor::new(
            Arc::clone(&storage),
            dispatcher.clone(),
            config.fallback_lookback(),
            config.scheduler_batch_size,
        );
        if config.lock_enabled {
            retry = retry.with_locks(
                &config.version,
                &instance_holder(ids.worker_id()),
                config.lock_ttl(),
            );
        }
        let collector = CollectorProcessor::new(
            Arc::clone(&storage),
            config.succeeded_retention(),
            config.failed_retention(),
            config.collector_batch_size,
        );

        info!(
            version = %config.version,
            worker_id = ids.worker_id(),
            handlers = registry.len(),
            "Outbox assembled"
        );
        Ok(Outbox {
            config,
            storage,
            dispatcher,
            publisher,
            consumers,
            retry: Arc::new(retry),
            collector: Arc::new(collector),
            processors: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }
}

/// A fully wired outbox: publisher, dispatcher, one consumer per handler
/// group, the retry sweeps and the collector.
pub struct Outbox {
    config: OutboxConfig,
    storage: SharedStorage,
    dispatcher: Dispatcher,
    publisher: Publisher,
    consumers: Vec<ConsumerLoop>,
    retry: Arc<RetryProcessor>,
    collector: Arc<CollectorProcessor>,
    processors: Mutex<Vec<ProcessorHandle>>,
    started: AtomicBool,
}

impl Outbox {
    pub fn builder(config: OutboxConfig) -> OutboxBuilder {
        OutboxBuilder {
            config,
            storage: None,
            queue: None,
            dedup: None,
            handlers: HandlerRegistry::new(),
        }
    }

    /// Start every background task. A second call does nothing.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.dispatcher.start();
        for consumer in &self.consumers {
            consumer.start();
        }
        let mut processors = self.processors.lock();
        processors.push(ProcessorHandle::spawn(
            Arc::clone(&self.retry),
            self.config.retry_interval(),
        ));
        processors.push(ProcessorHandle::spawn(
            Arc::clone(&self.collector),
            self.config.collector_interval(),
        ));
        info!(consumers = self.consumers.len(), "Outbox started");
    }

    /// Stop in reverse start order: processors, consumers, dispatcher.
    pub async fn shutdown(&self) {
        let grace = self.config.shutdown_grace();
        let processors = std::mem::take(&mut *self.processors.lock());
        for processor in processors {
            processor.stop(grace).await;
        }
        for consumer in &self.consumers {
            consumer.stop(grace).await;
        }
        self.dispatcher.stop().await;
        info!("Outbox shut down");
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    /// Groups with a running consumer.
    pub fn consumer_groups(&self) -> Vec<&str> {
        self.consumers.iter().map(ConsumerLoop::group).collect()
    }

    pub fn retry_processor(&self) -> &RetryProcessor {
        &self.retry
    }

    pub fn collector(&self) -> &CollectorProcessor {
        &self.collector
    }

    pub async fn statistics(&self) -> StorageResult<StorageStatistics> {
        self.storage.statistics().await
    }

    pub async fn get_message(
        &self,
        category: MessageCategory,
        id: i64,
    ) -> StorageResult<Option<Message>> {
        self.storage.get_message(category, id).await
    }

    /// A transaction bounded by the configured timeout.
    pub fn begin_transaction(&self) -> Transaction {
        Transaction::begin(None, self.config.transaction_timeout())
    }

    /// A transaction that also commits or rolls back `ambient`.
    pub fn begin_transaction_with(&self, ambient: Box<dyn AmbientTransaction>) -> Transaction {
        Transaction::begin(Some(ambient), self.config.transaction_timeout())
    }
}

async fn open_storage(config: &OutboxConfig, ids: Arc<IdGenerator>) -> OutboxResult<SharedStorage> {
    match &config.storage {
        StorageConfig::Memory => Ok(Arc::new(InMemoryStorage::with_id_generator(ids))),
        StorageConfig::Sqlite { path } => open_sqlite(path, &config.version, ids),
        StorageConfig::Redis { url, key_prefix } => {
            open_redis_storage(url, key_prefix, &config.version, ids).await
        }
    }
}

#[cfg(feature = "sqlite")]
fn open_sqlite(
    path: &std::path::Path,
    version: &str,
    ids: Arc<IdGenerator>,
) -> OutboxResult<SharedStorage> {
    Ok(Arc::new(crate::storage::SqliteStorage::open(path, version, ids)?))
}

#[cfg(not(feature = "sqlite"))]
fn open_sqlite(
    _path: &std::path::Path,
    _version: &str,
    _ids: Arc<IdGenerator>,
) -> OutboxResult<SharedStorage> {
    Err(not_compiled_in("sqlite"))
}

#[cfg(feature = "redis")]
async fn open_redis_storage(
    url: &str,
    key_prefix: &str,
    version: &str,
    ids: Arc<IdGenerator>,
) -> OutboxResult<SharedStorage> {
    let storage = crate::storage::RedisStorage::connect(url, key_prefix, version, ids).await?;
    Ok(Arc::new(storage))
}

#[cfg(not(feature = "redis"))]
async fn open_redis_storage(
    _url: &str,
    _key_prefix: &str,
    _version: &str,
    _ids: Arc<IdGenerator>,
) -> OutboxResult<SharedStorage> {
    Err(not_compiled_in("redis"))
}

async fn open_queue(config: &OutboxConfig, worker_id: u16) -> OutboxResult<SharedQueue> {
    match &config.queue {
        QueueConfig::Memory { capacity } => Ok(Arc::new(InMemoryQueue::with_capacity(*capacity))),
        QueueConfig::Redis {
            url,
            stream_prefix,
            visibility_timeout_ms,
            ..
        } => {
            open_redis_queue(
                url,
                stream_prefix,
                &config.consumer_group(),
                Duration::from_millis(*visibility_timeout_ms),
                worker_id,
            )
            .await
        }
    }
}

#[cfg(feature = "redis")]
async fn open_redis_queue(
    url: &str,
    stream_prefix: &str,
    consumer_group: &str,
    visibility_timeout: Duration,
    worker_id: u16,
) -> OutboxResult<SharedQueue> {
    let queue = crate::queue::RedisStreamQueue::connect(
        url,
        stream_prefix,
        consumer_group,
        instance_holder(worker_id),
    )
    .await?
    .with_visibility_timeout(visibility_timeout);
    Ok(Arc::new(queue))
}

#[cfg(not(feature = "redis"))]
async fn open_redis_queue(
    _url: &str,
    _stream_prefix: &str,
    _consumer_group: &str,
    _visibility_timeout: Duration,
    _worker_id: u16,
) -> OutboxResult<SharedQueue> {
    Err(not_compiled_in("redis"))
}

#[cfg(any(not(feature = "sqlite"), not(feature = "redis")))]
fn not_compiled_in(backend: &str) -> crate::error::OutboxError {
    ConfigError::Invalid(format!("{backend} backend requested but the `{backend}` feature is disabled")).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handlers() -> HandlerRegistry {
        HandlerRegistry::new()
            .subscribe("order.created", "orders", |_ctx| async { Ok(None) })
            .subscribe("invoice.issued", "billing", |_ctx| async { Ok(None) })
            .subscribe("order.created", "billing", |_ctx| async { Ok(None) })
    }

    #[tokio::test]
    async fn one_consumer_per_group() {
        let outbox = Outbox::builder(OutboxConfig::default())
            .handlers(handlers())
            .build()
            .await
            .unwrap();
        assert_eq!(outbox.consumer_groups(), vec!["billing", "orders"]);
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = OutboxConfig {
            publish_workers: 0,
            ..OutboxConfig::default()
        };
        assert!(Outbox::builder(config).build().await.is_err());
    }

    #[tokio::test]
    async fn start_and_shutdown_are_clean() {
        let config = OutboxConfig {
            shutdown_grace_ms: 2_000,
            consumer_poll_timeout_ms: 20,
            ..OutboxConfig::default()
        };
        let outbox = Outbox::builder(config)
            .handlers(handlers())
            .build()
            .await
            .unwrap();
        outbox.start();
        outbox.start();
        assert!(outbox.dispatcher().is_running());

        tokio::time::timeout(Duration::from_secs(5), outbox.shutdown())
            .await
            .unwrap();
        assert!(outbox.dispatcher().is_stopping());
    }

    #[tokio::test]
    async fn transactions_carry_the_configured_timeout() {
        let config = OutboxConfig {
            transaction_timeout_ms: 1,
            fallback_lookback_secs: 240,
            ..OutboxConfig::default()
        };
        let outbox = Outbox::builder(config).build().await.unwrap();
        let tx = outbox.begin_transaction();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(tx.commit().await.is_err());
    }
}
