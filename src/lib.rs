pub mod config;
pub mod dedup;
pub mod dispatcher;
mod error;
pub mod lock;
pub mod message;
pub mod processor;
mod publisher;
pub mod queue;
mod runtime;
pub mod storage;
pub mod subscriber;
pub mod telemetry;
pub mod transaction;

pub use config::{OutboxConfig, QueueConfig, StorageConfig};
pub use dedup::{Deduplicator, InMemoryDeduplicator, SharedDeduplicator, StorageDeduplicator};
pub use dispatcher::{Dispatcher, DispatcherSettings, DispatcherStats};
pub use error::{
    ConfigError, DispatchError, HandlerError, HandlerResult, OutboxError, OutboxResult,
    PublishError, StorageError, StorageResult, TransactionError, TransportError, TransportResult,
};
pub use message::{headers, IdGenerator, Message, MessageCategory, MessageStatus};
pub use publisher::{PublishOptions, Publisher};
pub use queue::{Delivery, InMemoryQueue, MessageQueue, SharedQueue};
pub use runtime::{Outbox, OutboxBuilder};
pub use storage::{InMemoryStorage, MessageStorage, SharedStorage, StorageStatistics};
pub use subscriber::{
    Context, ExecuteItem, HandlerDescriptor, HandlerRegistry, OperateResult, SubscribeExecutor,
};
pub use transaction::{AmbientTransaction, Transaction, TransactionListener, TransactionState};

#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;

#[cfg(feature = "redis")]
pub use dedup::RedisDeduplicator;
#[cfg(feature = "redis")]
pub use queue::RedisStreamQueue;
#[cfg(feature = "redis")]
pub use storage::RedisStorage;
