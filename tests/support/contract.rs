//! Behaviour every storage backend must share, run against each of them.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use sourced_outbox::{
    IdGenerator, Message, MessageCategory, MessageStatus, SharedStorage, Transaction,
};

fn outbox_row(ids: &IdGenerator, name: &str) -> Message {
    Message::new(ids.next_id(), name, "orders", r#"{"orderId":"O1"}"#, "v1", 3)
}

async fn status(storage: &SharedStorage, category: MessageCategory, id: i64) -> MessageStatus {
    storage
        .get_message(category, id)
        .await
        .unwrap()
        .expect("row exists")
        .status
}

pub async fn cas_rejects_a_stale_expected_status(storage: SharedStorage, ids: &IdGenerator) {
    let message = storage
        .store_message(outbox_row(ids, "order.created"), None)
        .await
        .unwrap();

    assert!(storage
        .try_change_publish_state(message.id, &[MessageStatus::Scheduled], MessageStatus::Queued)
        .await
        .unwrap());
    // Still expects SCHEDULED, but the row has moved on.
    assert!(!storage
        .try_change_publish_state(message.id, &[MessageStatus::Scheduled], MessageStatus::Succeeded)
        .await
        .unwrap());
    assert_eq!(
        status(&storage, MessageCategory::Published, message.id).await,
        MessageStatus::Queued
    );

    assert!(!storage
        .try_change_publish_state(message.id, &[], MessageStatus::Succeeded)
        .await
        .unwrap());
    assert!(!storage
        .try_change_publish_state(ids.next_id(), &MessageStatus::RETRYABLE, MessageStatus::Queued)
        .await
        .unwrap());
}

pub async fn concurrent_promotion_has_one_winner(storage: SharedStorage, ids: &IdGenerator) {
    let message = outbox_row(ids, "order.reminder").delay_until(chrono::Utc::now());
    let id = storage.store_message(message, None).await.unwrap().id;

    let attempts: Vec<_> = (0..8)
        .map(|_| {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move {
                storage
                    .try_change_publish_state(id, &[MessageStatus::Delayed], MessageStatus::Queued)
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut winners = 0;
    for attempt in attempts {
        if attempt.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert!(storage
        .get_expired_delayed_messages(10)
        .await
        .unwrap()
        .is_empty());
}

pub async fn backlog_is_claimed_once_across_claimers(storage: SharedStorage, ids: &IdGenerator) {
    let mut stored = HashSet::new();
    for n in 0..24 {
        let mut message = outbox_row(ids, &format!("order.{n}"));
        message.status = MessageStatus::Pending;
        let message = storage.store_message(message, None).await.unwrap();
        stored.insert(message.id);
    }

    let claimers: Vec<_> = (0..4)
        .map(|_| {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let batch = storage
                        .claim_publish_backlog(Duration::ZERO, 5)
                        .await
                        .unwrap();
                    if batch.is_empty() {
                        return mine;
                    }
                    for message in batch {
                        assert_eq!(message.status, MessageStatus::Queued);
                        mine.push(message.id);
                    }
                }
            })
        })
        .collect();

    let mut claimed = Vec::new();
    for claimer in claimers {
        claimed.extend(claimer.await.unwrap());
    }
    let unique: HashSet<i64> = claimed.iter().copied().collect();
    assert_eq!(claimed.len(), unique.len(), "a row was claimed twice");
    assert_eq!(unique, stored);
}

pub async fn failed_send_is_not_reclaimed_before_backoff(storage: SharedStorage, ids: &IdGenerator) {
    let mut message = storage
        .store_message(outbox_row(ids, "order.created"), None)
        .await
        .unwrap();
    message.retries = 1;
    storage
        .change_publish_state(&message, MessageStatus::Pending, None)
        .await
        .unwrap();

    assert!(storage
        .claim_publish_backlog(Duration::from_secs(60), 10)
        .await
        .unwrap()
        .is_empty());

    tokio::time::sleep(Duration::from_millis(30)).await;
    let claimed = storage
        .claim_publish_backlog(Duration::from_millis(10), 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, message.id);
}

pub async fn receive_cas_loses_to_a_terminal_write(storage: SharedStorage, ids: &IdGenerator) {
    let delivered = outbox_row(ids, "order.created");
    let finished = storage
        .store_received_message(&delivered, "orders")
        .await
        .unwrap();
    let stuck = storage
        .store_received_message(&delivered, "billing")
        .await
        .unwrap();

    storage
        .change_receive_state(&finished, MessageStatus::Succeeded)
        .await
        .unwrap();

    assert!(!storage
        .try_change_receive_state(finished.id, &MessageStatus::RETRYABLE, MessageStatus::Queued)
        .await
        .unwrap());
    assert_eq!(
        status(&storage, MessageCategory::Received, finished.id).await,
        MessageStatus::Succeeded
    );

    assert!(storage
        .try_change_receive_state(stuck.id, &MessageStatus::RETRYABLE, MessageStatus::Queued)
        .await
        .unwrap());
    assert_eq!(
        status(&storage, MessageCategory::Received, stuck.id).await,
        MessageStatus::Queued
    );
}

pub async fn held_rows_stay_out_of_reach_until_commit(storage: SharedStorage, ids: &IdGenerator) {
    let tx = Transaction::begin(None, Duration::from_secs(5));
    let mut message = outbox_row(ids, "order.created");
    message.status = MessageStatus::Pending;
    let message = storage.store_message(message, Some(&tx)).await.unwrap();

    assert!(!storage
        .try_change_publish_state(message.id, &[MessageStatus::Pending], MessageStatus::Queued)
        .await
        .unwrap());
    assert!(storage
        .claim_publish_backlog(Duration::ZERO, 10)
        .await
        .unwrap()
        .is_empty());

    tx.commit().await.unwrap();
    let claimed = storage
        .claim_publish_backlog(Duration::ZERO, 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, message.id);
}

pub async fn statistics_follow_status_changes(storage: SharedStorage, ids: &IdGenerator) {
    let first = storage
        .store_message(outbox_row(ids, "order.created"), None)
        .await
        .unwrap();
    storage
        .store_message(outbox_row(ids, "order.created"), None)
        .await
        .unwrap();
    storage
        .change_publish_state(&first, MessageStatus::Succeeded, None)
        .await
        .unwrap();

    let stats = storage.statistics().await.unwrap();
    assert_eq!(stats.count(MessageCategory::Published, MessageStatus::Scheduled), 1);
    assert_eq!(stats.count(MessageCategory::Published, MessageStatus::Succeeded), 1);
    assert_eq!(stats.total(MessageCategory::Published), 2);

    assert!(storage
        .delete_message(MessageCategory::Published, first.id)
        .await
        .unwrap());
    let stats = storage.statistics().await.unwrap();
    assert_eq!(stats.count(MessageCategory::Published, MessageStatus::Succeeded), 0);
}
