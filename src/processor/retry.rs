//! Reconciliation sweeps for stuck outbox and inbox rows.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::Processor;
use crate::dispatcher::Dispatcher;
use crate::error::StorageResult;
use crate::lock::{LockGuard, SweepLock};
use crate::message::MessageStatus;
use crate::storage::SharedStorage;
use crate::subscriber::ExecuteItem;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Sweep {
    Published,
    Received,
}

impl Sweep {
    fn as_str(self) -> &'static str {
        match self {
            Sweep::Published => "published",
            Sweep::Received => "received",
        }
    }
}

/// Re-offers rows that have been quiet for longer than the lookback window.
///
/// The published sweep claims each row with a CAS to `QUEUED` before
/// offering it, the received sweep stamps the row `QUEUED` the same way, so
/// a row is not picked up again until it has been quiet for another window.
/// With locks enabled each sweep runs on at most one instance at a time.
pub struct RetryProcessor {
    storage: SharedStorage,
    dispatcher: Dispatcher,
    lookback: Duration,
    batch_size: usize,
    published_lock: Option<SweepLock>,
    received_lock: Option<SweepLock>,
}

impl RetryProcessor {
    pub fn new(
        storage: SharedStorage,
        dispatcher: Dispatcher,
        lookback: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            storage,
            dispatcher,
            lookback,
            batch_size: batch_size.max(1),
            published_lock: None,
            received_lock: None,
        }
    }

    /// Guard both sweeps with storage locks keyed `{version}:retry:*`.
    pub fn with_locks(mut self, version: &str, holder: &str, ttl: Duration) -> Self {
        let storage = self.storage.clone();
        let lock = |sweep: Sweep| {
            SweepLock::new(
                storage.clone(),
                format!("{version}:retry:{}", sweep.as_str()),
                holder,
                ttl,
            )
        };
        self.published_lock = Some(lock(Sweep::Published));
        self.received_lock = Some(lock(Sweep::Received));
        self
    }

    /// Re-offer stuck outbox rows. Returns how many were offered.
    pub async fn sweep_published(&self) -> StorageResult<usize> {
        self.published(None).await
    }

    /// Re-offer stuck inbox rows to the execute workers.
    pub async fn sweep_received(&self) -> StorageResult<usize> {
        self.received(None).await
    }

    async fn published(&self, mut guard: Option<&mut LockGuard>) -> StorageResult<usize> {
        let rows = self
            .storage
            .get_published_messages_needing_retry(self.lookback, self.batch_size)
            .await?;
        let mut offered = 0;
        for mut message in rows {
            if !still_held(guard.as_deref_mut(), Sweep::Published).await? {
                break;
            }
            if !self
                .storage
                .try_change_publish_state(message.id, &MessageStatus::RETRYABLE, MessageStatus::Queued)
                .await?
            {
                continue;
            }
            message.transition(MessageStatus::Queued);
            if self.dispatcher.enqueue_to_publish(message).await.is_err() {
                debug!("Dispatcher stopping, ending published sweep");
                break;
            }
            offered += 1;
        }
        Ok(offered)
    }

    async fn received(&self, mut guard: Option<&mut LockGuard>) -> StorageResult<usize> {
        let rows = self
            .storage
            .get_received_messages_needing_retry(self.lookback, self.batch_size)
            .await?;
        let mut offered = 0;
        for mut message in rows {
            if !still_held(guard.as_deref_mut(), Sweep::Received).await? {
                break;
            }
            // A handler may have finished the row since the snapshot.
            if !self
                .storage
                .try_change_receive_state(message.id, &MessageStatus::RETRYABLE, MessageStatus::Queued)
                .await?
            {
                continue;
            }
            message.transition(MessageStatus::Queued);
            if self
                .dispatcher
                .enqueue_to_execute(ExecuteItem::stored(message))
                .await
                .is_err()
            {
                debug!("Dispatcher stopping, ending received sweep");
                break;
            }
            offered += 1;
        }
        Ok(offered)
    }

    async fn run(&self, sweep: Sweep) {
        let lock = match sweep {
            Sweep::Published => self.published_lock.as_ref(),
            Sweep::Received => self.received_lock.as_ref(),
        };

        let mut guard = match lock {
            Some(lock) => match lock.try_acquire().await {
                Ok(Some(guard)) => Some(guard),
                Ok(None) => {
                    debug!(sweep = sweep.as_str(), "Sweep lock held elsewhere, skipping");
                    return;
                }
                Err(err) => {
                    warn!(sweep = sweep.as_str(), error = %err, "Sweep lock unavailable, skipping");
                    return;
                }
            },
            None => None,
        };

        let result = match sweep {
            Sweep::Published => self.published(guard.as_mut()).await,
            Sweep::Received => self.received(guard.as_mut()).await,
        };
        match result {
            Ok(0) => {}
            Ok(offered) => info!(sweep = sweep.as_str(), offered, "Re-offered stuck messages"),
            Err(err) => warn!(sweep = sweep.as_str(), error = %err, "Retry sweep failed"),
        }

        if let Some(guard) = guard {
            if let Err(err) = guard.release().await {
                warn!(sweep = sweep.as_str(), error = %err, "Sweep lock release failed");
            }
        }
    }
}

/// Keep a sweep lock alive between rows. Without a lock there is nothing to
/// lose.
async fn still_held(guard: Option<&mut LockGuard>, sweep: Sweep) -> StorageResult<bool> {
    let Some(guard) = guard else {
        return Ok(true);
    };
    let held = guard.keep_alive().await?;
    if !held {
        warn!(sweep = sweep.as_str(), "Sweep lock lost, ending sweep early");
    }
    Ok(held)
}

#[async_trait]
impl Processor for RetryProcessor {
    fn name(&self) -> &'static str {
        "retry"
    }

    async fn process(&self) {
        self.run(Sweep::Published).await;
        self.run(Sweep::Received).await;
    }
}
