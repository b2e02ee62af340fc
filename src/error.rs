use thiserror::Error;

/// Durability layer unreachable or a write was rejected.
///
/// Always retryable by the caller's next cycle.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("storage write rejected: {0}")]
    Rejected(String),
    #[error("row serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage task failed: {0}")]
    Task(String),
    #[cfg(feature = "sqlite")]
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// The transport refused or failed a send/receive/disposition.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport connection failed: {0}")]
    ConnectionFailed(String),
    #[error("envelope encoding failed: {0}")]
    Encoding(String),
    #[error("transport protocol error: {0}")]
    Protocol(String),
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

impl From<bitcode::Error> for TransportError {
    fn from(err: bitcode::Error) -> Self {
        TransportError::Encoding(err.to_string())
    }
}

/// Consumer logic failed for a delivered message.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Retryable failure.
    #[error("handler failed: {0}")]
    Failed(String),
    /// Failure that no amount of redelivery can fix.
    #[error("handler failed permanently: {0}")]
    Permanent(String),
    /// The payload could not be decoded into the handler's input type.
    #[error("payload decode failed: {0}")]
    DecodeFailed(String),
    /// No handler registered for the (name, group) pair.
    #[error("no handler registered for {name} in group {group}")]
    NotFound { name: String, group: String },
    #[error("dedup check failed: {0}")]
    Dedup(#[from] StorageError),
}

impl HandlerError {
    /// Create a retryable failure from anything printable.
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        HandlerError::Failed(reason.to_string())
    }

    /// Create a permanent failure from anything printable.
    pub fn permanent(reason: impl std::fmt::Display) -> Self {
        HandlerError::Permanent(reason.to_string())
    }

    /// Whether redelivering the message could ever succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Failed(_) | HandlerError::Dedup(_))
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        HandlerError::DecodeFailed(err.to_string())
    }
}

/// Raised by dispatcher operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// `stop()` has begun; not retryable.
    #[error("dispatcher stopped")]
    Stopped,
}

/// Raised to the caller of `Publisher::publish`.
#[derive(Debug, Error)]
pub enum PublishError {
    /// The durability point was not reached.
    #[error("publish failed: {0}")]
    Storage(#[from] StorageError),
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("transaction is no longer active")]
    TransactionInactive,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("transaction is not active")]
    NotActive,
    #[error("transaction timed out after {elapsed_ms}ms (limit {timeout_ms}ms) and was rolled back")]
    TimedOut { elapsed_ms: u64, timeout_ms: u64 },
    #[error("ambient transaction failed: {0}")]
    Ambient(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("config parse failed: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("config file unreadable: {0}")]
    Io(#[from] std::io::Error),
}

/// Crate-level error for runtime wiring.
#[derive(Debug, Error)]
pub enum OutboxError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

pub type StorageResult<T> = Result<T, StorageError>;
pub type TransportResult<T> = Result<T, TransportError>;
pub type HandlerResult = Result<Option<serde_json::Value>, HandlerError>;
pub type OutboxResult<T> = Result<T, OutboxError>;
