use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{info, warn};

use super::Processor;
use crate::error::StorageResult;
use crate::message::{MessageCategory, MessageStatus};
use crate::storage::SharedStorage;

/// Deletes terminal rows past their retention, in bounded batches.
pub struct CollectorProcessor {
    storage: SharedStorage,
    succeeded_retention: Duration,
    failed_retention: Duration,
    batch_size: usize,
}

impl CollectorProcessor {
    pub fn new(
        storage: SharedStorage,
        succeeded_retention: Duration,
        failed_retention: Duration,
        batch_size: usize,
    ) -> Self {
        Self {
            storage,
            succeeded_retention,
            failed_retention,
            batch_size: batch_size.max(1),
        }
    }

    /// One full pass over both tables. Returns the number of rows deleted.
    pub async fn collect(&self) -> StorageResult<u64> {
        let mut deleted = 0;
        for category in MessageCategory::ALL {
            for (status, retention) in [
                (MessageStatus::Succeeded, self.succeeded_retention),
                (MessageStatus::Failed, self.failed_retention),
            ] {
                deleted += self.collect_status(category, status, retention).await?;
            }
        }
        Ok(deleted)
    }

    async fn collect_status(
        &self,
        category: MessageCategory,
        status: MessageStatus,
        retention: Duration,
    ) -> StorageResult<u64> {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            return Ok(0);
        };

        let mut total = 0;
        loop {
            let deleted = self
                .storage
                .delete_expired(category, status, cutoff, self.batch_size)
                .await?;
            total += deleted;
            if deleted < self.batch_size as u64 {
                break;
            }
        }
        Ok(total)
    }
}

#[async_trait]
impl Processor for CollectorProcessor {
    fn name(&self) -> &'static str {
        "collector"
    }

    async fn process(&self) {
        match self.collect().await {
            Ok(0) => {}
            Ok(deleted) => info!(deleted, "Collected expired messages"),
            Err(err) => warn!(error = %err, "Collector pass failed"),
        }
    }
}
