//! The storage contract and stream redelivery against a live Redis. Set
//! `OUTBOX_TEST_REDIS_URL` to run; without it every test returns early.

#![cfg(feature = "redis")]

mod support;

use std::sync::Arc;
use std::time::Duration;

use sourced_outbox::{
    IdGenerator, Message, MessageQueue, RedisStorage, RedisStreamQueue, SharedStorage,
};
use support::contract;

fn redis_url() -> Option<String> {
    std::env::var("OUTBOX_TEST_REDIS_URL").ok()
}

/// Each test gets its own keyspace so runs never see each other's rows.
fn unique_prefix(name: &str) -> String {
    format!(
        "outbox-test:{name}:{}",
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    )
}

async fn storage(url: &str, name: &str, ids: &Arc<IdGenerator>) -> SharedStorage {
    Arc::new(
        RedisStorage::connect(url, &unique_prefix(name), "v1", Arc::clone(ids))
            .await
            .unwrap(),
    )
}

// ============================================================================
// Test 1: Storage contract
// ============================================================================

macro_rules! contract_test {
    ($name:ident) => {
        #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
        async fn $name() {
            let Some(url) = redis_url() else { return };
            let ids = Arc::new(IdGenerator::new(12));
            let storage = storage(&url, stringify!($name), &ids).await;
            contract::$name(storage, &ids).await;
        }
    };
}

contract_test!(cas_rejects_a_stale_expected_status);
contract_test!(concurrent_promotion_has_one_winner);
contract_test!(backlog_is_claimed_once_across_claimers);
contract_test!(failed_send_is_not_reclaimed_before_backoff);
contract_test!(receive_cas_loses_to_a_terminal_write);
contract_test!(held_rows_stay_out_of_reach_until_commit);
contract_test!(statistics_follow_status_changes);

// ============================================================================
// Test 2: Stream redelivery
// ============================================================================

#[tokio::test]
async fn unacknowledged_entry_moves_to_another_consumer_after_visibility_timeout() {
    let Some(url) = redis_url() else { return };
    let prefix = unique_prefix("redelivery");
    let visibility = Duration::from_millis(50);

    let first = RedisStreamQueue::connect(&url, prefix.as_str(), "orders.v1", "worker-a")
        .await
        .unwrap()
        .with_visibility_timeout(visibility);
    let second = RedisStreamQueue::connect(&url, prefix.as_str(), "orders.v1", "worker-b")
        .await
        .unwrap()
        .with_visibility_timeout(visibility);

    let ids = IdGenerator::new(13);
    let message = Message::new(ids.next_id(), "order.created", "orders", "{}", "v1", 3);

    assert!(first.send("orders.v1", &message).await.unwrap());

    let taken = first
        .receive_batch("orders.v1", 1, Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(taken.len(), 1);
    assert_eq!(taken[0].message.id, message.id);

    // Still inside the visibility window: nothing for the other consumer.
    assert!(second
        .receive_batch("orders.v1", 1, Duration::from_millis(10))
        .await
        .unwrap()
        .is_empty());

    tokio::time::sleep(Duration::from_millis(100)).await;
    let reclaimed = second
        .receive_batch("orders.v1", 1, Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].message.id, message.id);
    assert_eq!(reclaimed[0].delivery_id, taken[0].delivery_id);

    second
        .acknowledge("orders.v1", &reclaimed[0].delivery_id)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(first
        .receive_batch("orders.v1", 1, Duration::from_millis(10))
        .await
        .unwrap()
        .is_empty());
}
