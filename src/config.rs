//! Runtime configuration.
//!
//! Loaded from TOML with every field defaulted, then optionally overridden
//! from `OUTBOX_*` environment variables. Backends are tagged variants:
//!
//! ```toml
//! version = "v1"
//! default_group = "orders"
//! publish_workers = 2
//!
//! [storage]
//! kind = "sqlite"
//! path = "/var/lib/app/outbox.db"
//!
//! [queue]
//! kind = "memory"
//! capacity = 10000
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StorageConfig {
    Memory,
    Sqlite {
        path: PathBuf,
    },
    Redis {
        url: String,
        #[serde(default = "default_key_prefix")]
        key_prefix: String,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Memory
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum QueueConfig {
    Memory {
        #[serde(default = "default_queue_capacity")]
        capacity: usize,
    },
    Redis {
        url: String,
        #[serde(default = "default_key_prefix")]
        stream_prefix: String,
        /// Shared by every instance of one deployment. Defaults to
        /// `{default_group}.{version}`.
        #[serde(default)]
        consumer_group: Option<String>,
        /// Entries delivered but not acknowledged for this long are claimed
        /// by the next receiver. Must exceed the slowest handler run.
        #[serde(default = "default_visibility_timeout_ms")]
        visibility_timeout_ms: u64,
    },
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig::Memory {
            capacity: default_queue_capacity(),
        }
    }
}

fn default_key_prefix() -> String {
    "outbox".to_string()
}

fn default_queue_capacity() -> usize {
    100_000
}

fn default_visibility_timeout_ms() -> u64 {
    60_000
}

/// Everything the outbox runtime reads at startup.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Namespaces destinations and storage rows across deployments.
    pub version: String,
    pub default_group: String,
    pub default_max_retries: u32,

    pub publish_workers: usize,
    pub execute_workers: usize,
    pub publish_queue_capacity: usize,
    pub execute_queue_capacity: usize,
    /// Bounded wait when offering to a full in-memory queue before the
    /// message drops to the storage backlog.
    pub offer_timeout_ms: u64,

    pub scheduler_tick_ms: u64,
    pub scheduler_batch_size: usize,
    pub backlog_interval_ms: u64,
    pub backlog_batch_size: usize,
    /// How long a `PENDING` row whose send failed stays quiet before the
    /// backlog offers it again.
    pub publish_retry_backoff_ms: u64,

    pub consumer_batch_size: usize,
    pub consumer_poll_timeout_ms: u64,

    pub retry_interval_secs: u64,
    /// Must exceed the slowest expected handler run, or in-flight messages
    /// are redelivered.
    pub fallback_lookback_secs: u64,

    pub collector_interval_secs: u64,
    pub succeeded_retention_secs: u64,
    pub failed_retention_secs: u64,
    pub collector_batch_size: usize,

    pub lock_enabled: bool,
    pub lock_ttl_secs: u64,

    pub shutdown_grace_ms: u64,
    pub transaction_timeout_ms: u64,
    /// Snowflake worker id. Derived from the process id when unset.
    pub worker_id: Option<u16>,

    pub storage: StorageConfig,
    pub queue: QueueConfig,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            version: "v1".to_string(),
            default_group: "default".to_string(),
            default_max_retries: 50,
            publish_workers: 1,
            execute_workers: 1,
            publish_queue_capacity: 10_000,
            execute_queue_capacity: 10_000,
            offer_timeout_ms: 100,
            scheduler_tick_ms: 1_000,
            scheduler_batch_size: 1_000,
            backlog_interval_ms: 1_000,
            backlog_batch_size: 200,
            publish_retry_backoff_ms: 5_000,
            consumer_batch_size: 16,
            consumer_poll_timeout_ms: 1_000,
            retry_interval_secs: 60,
            fallback_lookback_secs: 240,
            collector_interval_secs: 300,
            succeeded_retention_secs: 24 * 60 * 60,
            failed_retention_secs: 15 * 24 * 60 * 60,
            collector_batch_size: 1_000,
            lock_enabled: false,
            lock_ttl_secs: 60,
            shutdown_grace_ms: 5_000,
            transaction_timeout_ms: 30_000,
            worker_id: None,
            storage: StorageConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl OutboxConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: OutboxConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_toml_str(&std::fs::read_to_string(path)?)
    }

    /// Apply `OUTBOX_*` environment variables on top of this config.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup. Keys are the upper-cased field
    /// names prefixed with `OUTBOX_`, plus `OUTBOX_STORAGE_KIND`,
    /// `OUTBOX_STORAGE_PATH`, `OUTBOX_STORAGE_URL`, `OUTBOX_QUEUE_KIND`,
    /// `OUTBOX_QUEUE_URL` and `OUTBOX_QUEUE_CONSUMER_GROUP` for the backends.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        macro_rules! override_field {
            ($($field:ident => $key:literal),+ $(,)?) => {
                $(
                    if let Some(raw) = lookup($key) {
                        self.$field = parse_value($key, &raw)?;
                    }
                )+
            };
        }

        if let Some(version) = lookup("OUTBOX_VERSION") {
            self.version = version;
        }
        if let Some(group) = lookup("OUTBOX_DEFAULT_GROUP") {
            self.default_group = group;
        }
        override_field! {
            default_max_retries => "OUTBOX_DEFAULT_MAX_RETRIES",
            publish_workers => "OUTBOX_PUBLISH_WORKERS",
            execute_workers => "OUTBOX_EXECUTE_WORKERS",
            publish_queue_capacity => "OUTBOX_PUBLISH_QUEUE_CAPACITY",
            execute_queue_capacity => "OUTBOX_EXECUTE_QUEUE_CAPACITY",
            offer_timeout_ms => "OUTBOX_OFFER_TIMEOUT_MS",
            scheduler_tick_ms => "OUTBOX_SCHEDULER_TICK_MS",
            scheduler_batch_size => "OUTBOX_SCHEDULER_BATCH_SIZE",
            backlog_interval_ms => "OUTBOX_BACKLOG_INTERVAL_MS",
            backlog_batch_size => "OUTBOX_BACKLOG_BATCH_SIZE",
            publish_retry_backoff_ms => "OUTBOX_PUBLISH_RETRY_BACKOFF_MS",
            consumer_batch_size => "OUTBOX_CONSUMER_BATCH_SIZE",
            consumer_poll_timeout_ms => "OUTBOX_CONSUMER_POLL_TIMEOUT_MS",
            retry_interval_secs => "OUTBOX_RETRY_INTERVAL_SECS",
            fallback_lookback_secs => "OUTBOX_FALLBACK_LOOKBACK_SECS",
            collector_interval_secs => "OUTBOX_COLLECTOR_INTERVAL_SECS",
            succeeded_retention_secs => "OUTBOX_SUCCEEDED_RETENTION_SECS",
            failed_retention_secs => "OUTBOX_FAILED_RETENTION_SECS",
            collector_batch_size => "OUTBOX_COLLECTOR_BATCH_SIZE",
            lock_enabled => "OUTBOX_LOCK_ENABLED",
            lock_ttl_secs => "OUTBOX_LOCK_TTL_SECS",
            shutdown_grace_ms => "OUTBOX_SHUTDOWN_GRACE_MS",
            transaction_timeout_ms => "OUTBOX_TRANSACTION_TIMEOUT_MS",
        }
        if let Some(raw) = lookup("OUTBOX_WORKER_ID") {
            self.worker_id = Some(parse_value("OUTBOX_WORKER_ID", &raw)?);
        }

        if let Some(kind) = lookup("OUTBOX_STORAGE_KIND") {
            self.storage = match kind.as_str() {
                "memory" => StorageConfig::Memory,
                "sqlite" => StorageConfig::Sqlite {
                    path: lookup("OUTBOX_STORAGE_PATH")
                        .map(PathBuf::from)
                        .ok_or_else(|| missing("OUTBOX_STORAGE_PATH"))?,
                },
                "redis" => StorageConfig::Redis {
                    url: lookup("OUTBOX_STORAGE_URL").ok_or_else(|| missing("OUTBOX_STORAGE_URL"))?,
                    key_prefix: default_key_prefix(),
                },
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "OUTBOX_STORAGE_KIND: unknown backend {other:?}"
                    )))
                }
            };
        }
        if let Some(kind) = lookup("OUTBOX_QUEUE_KIND") {
            self.queue = match kind.as_str() {
                "memory" => QueueConfig::default(),
                "redis" => QueueConfig::Redis {
                    url: lookup("OUTBOX_QUEUE_URL").ok_or_else(|| missing("OUTBOX_QUEUE_URL"))?,
                    stream_prefix: default_key_prefix(),
                    consumer_group: lookup("OUTBOX_QUEUE_CONSUMER_GROUP"),
                    visibility_timeout_ms: default_visibility_timeout_ms(),
                },
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "OUTBOX_QUEUE_KIND: unknown backend {other:?}"
                    )))
                }
            };
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("publish_workers", self.publish_workers),
            ("execute_workers", self.execute_workers),
            ("publish_queue_capacity", self.publish_queue_capacity),
            ("execute_queue_capacity", self.execute_queue_capacity),
            ("scheduler_batch_size", self.scheduler_batch_size),
            ("backlog_batch_size", self.backlog_batch_size),
            ("consumer_batch_size", self.consumer_batch_size),
            ("collector_batch_size", self.collector_batch_size),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }
        let intervals = [
            ("scheduler_tick_ms", self.scheduler_tick_ms),
            ("backlog_interval_ms", self.backlog_interval_ms),
            ("retry_interval_secs", self.retry_interval_secs),
            ("collector_interval_secs", self.collector_interval_secs),
            ("lock_ttl_secs", self.lock_ttl_secs),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
            }
        }
        if self.default_max_retries == 0 {
            return Err(ConfigError::Invalid(
                "default_max_retries must be at least 1".into(),
            ));
        }
        if self.version.trim().is_empty() || self.default_group.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "version and default_group must not be empty".into(),
            ));
        }
        if self.fallback_lookback_secs.saturating_mul(1_000) <= self.transaction_timeout_ms {
            return Err(ConfigError::Invalid(format!(
                "fallback_lookback_secs ({}s) must exceed transaction_timeout_ms ({}ms)",
                self.fallback_lookback_secs, self.transaction_timeout_ms
            )));
        }
        match &self.queue {
            QueueConfig::Memory { capacity: 0 } => {
                return Err(ConfigError::Invalid("queue capacity must be greater than zero".into()));
            }
            QueueConfig::Redis {
                visibility_timeout_ms: 0,
                ..
            } => {
                return Err(ConfigError::Invalid(
                    "visibility_timeout_ms must be greater than zero".into(),
                ));
            }
            QueueConfig::Redis {
                consumer_group: Some(group),
                ..
            } if group.trim().is_empty() => {
                return Err(ConfigError::Invalid("consumer_group must not be empty".into()));
            }
            _ => {}
        }
        Ok(())
    }

    pub fn offer_timeout(&self) -> Duration {
        Duration::from_millis(self.offer_timeout_ms)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms)
    }

    pub fn backlog_interval(&self) -> Duration {
        Duration::from_millis(self.backlog_interval_ms)
    }

    pub fn publish_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.publish_retry_backoff_ms)
    }

    /// Consumer group the Redis transport reads through.
    pub fn consumer_group(&self) -> String {
        match &self.queue {
            QueueConfig::Redis {
                consumer_group: Some(group),
                ..
            } => group.clone(),
            _ => format!("{}.{}", self.default_group, self.version),
        }
    }

    pub fn consumer_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.consumer_poll_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn fallback_lookback(&self) -> Duration {
        Duration::from_secs(self.fallback_lookback_secs)
    }

    pub fn collector_interval(&self) -> Duration {
        Duration::from_secs(self.collector_interval_secs)
    }

    pub fn succeeded_retention(&self) -> Duration {
        Duration::from_secs(self.succeeded_retention_secs)
    }

    pub fn failed_retention(&self) -> Duration {
        Duration::from_secs(self.failed_retention_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|err| ConfigError::Invalid(format!("{key}: {err}")))
}

fn missing(key: &str) -> ConfigError {
    ConfigError::Invalid(format!("{key} is required"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let config = OutboxConfig::default();
        config.validate().unwrap();
        assert_eq!(config.storage, StorageConfig::Memory);
        assert_eq!(config.default_max_retries, 50);
        assert_eq!(config.fallback_lookback(), Duration::from_secs(240));
    }

    #[test]
    fn empty_toml_uses_defaults() {
        let config = OutboxConfig::from_toml_str("").unwrap();
        assert_eq!(config, OutboxConfig::default());
    }

    #[test]
    fn toml_selects_backends() {
        let config = OutboxConfig::from_toml_str(
            r#"
            version = "v2"
            default_group = "orders"
            publish_workers = 4

            [storage]
            kind = "sqlite"
            path = "/tmp/outbox.db"

            [queue]
            kind = "redis"
            url = "redis://127.0.0.1:6379"
            "#,
        )
        .unwrap();

        assert_eq!(config.version, "v2");
        assert_eq!(config.publish_workers, 4);
        assert_eq!(
            config.storage,
            StorageConfig::Sqlite {
                path: PathBuf::from("/tmp/outbox.db")
            }
        );
        assert_eq!(
            config.queue,
            QueueConfig::Redis {
                url: "redis://127.0.0.1:6379".into(),
                stream_prefix: "outbox".into(),
                consumer_group: None,
                visibility_timeout_ms: 60_000,
            }
        );
        assert_eq!(config.consumer_group(), "orders.v2");
        // Untouched fields keep their defaults.
        assert_eq!(config.execute_workers, 1);
    }

    #[test]
    fn explicit_consumer_group_wins() {
        let config = OutboxConfig::from_toml_str(
            r#"
            [queue]
            kind = "redis"
            url = "redis://127.0.0.1:6379"
            consumer_group = "billing-service"
            visibility_timeout_ms = 15000
            "#,
        )
        .unwrap();
        assert_eq!(config.consumer_group(), "billing-service");
        assert!(matches!(
            config.queue,
            QueueConfig::Redis {
                visibility_timeout_ms: 15_000,
                ..
            }
        ));
    }

    #[test]
    fn zero_sweep_intervals_and_lock_ttl_rejected() {
        for (field, config) in [
            (
                "retry_interval_secs",
                OutboxConfig {
                    retry_interval_secs: 0,
                    ..OutboxConfig::default()
                },
            ),
            (
                "collector_interval_secs",
                OutboxConfig {
                    collector_interval_secs: 0,
                    ..OutboxConfig::default()
                },
            ),
            (
                "lock_ttl_secs",
                OutboxConfig {
                    lock_ttl_secs: 0,
                    ..OutboxConfig::default()
                },
            ),
        ] {
            let err = config.validate().unwrap_err();
            assert!(err.to_string().contains(field), "{field}: {err}");
        }
    }

    #[test]
    fn zero_visibility_timeout_rejected() {
        let err = OutboxConfig::from_toml_str(
            "[queue]\nkind = \"redis\"\nurl = \"redis://localhost\"\nvisibility_timeout_ms = 0\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("visibility_timeout_ms"));
    }

    #[test]
    fn unknown_backend_is_a_parse_error() {
        let err = OutboxConfig::from_toml_str("[storage]\nkind = \"cassandra\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn zero_workers_rejected() {
        let err = OutboxConfig::from_toml_str("execute_workers = 0").unwrap_err();
        assert!(err.to_string().contains("execute_workers"));
    }

    #[test]
    fn lookback_must_exceed_transaction_timeout() {
        let config = OutboxConfig {
            fallback_lookback_secs: 10,
            transaction_timeout_ms: 10_000,
            ..OutboxConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn overrides_apply_on_top_of_file_values() {
        let vars: HashMap<&str, &str> = [
            ("OUTBOX_PUBLISH_WORKERS", "8"),
            ("OUTBOX_LOCK_ENABLED", "true"),
            ("OUTBOX_WORKER_ID", "17"),
            ("OUTBOX_STORAGE_KIND", "sqlite"),
            ("OUTBOX_STORAGE_PATH", "/data/outbox.db"),
        ]
        .into_iter()
        .collect();

        let config = OutboxConfig::default()
            .with_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.publish_workers, 8);
        assert!(config.lock_enabled);
        assert_eq!(config.worker_id, Some(17));
        assert_eq!(
            config.storage,
            StorageConfig::Sqlite {
                path: PathBuf::from("/data/outbox.db")
            }
        );
    }

    #[test]
    fn malformed_override_names_the_key() {
        let err = OutboxConfig::default()
            .with_overrides(|key| (key == "OUTBOX_OFFER_TIMEOUT_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("OUTBOX_OFFER_TIMEOUT_MS"));
    }
}
