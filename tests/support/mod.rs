//! Shared fixtures for the outbox integration suites: fast timings, a
//! recording handler and polling helpers.

#![allow(dead_code)]

pub mod contract;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sourced_outbox::{
    Context, HandlerError, HandlerResult, MessageCategory, MessageStatus, Outbox, OutboxConfig,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub order_id: String,
    pub amount: u64,
}

impl OrderCreated {
    pub fn new(order_id: &str, amount: u64) -> Self {
        Self {
            order_id: order_id.to_string(),
            amount,
        }
    }
}

/// Timings short enough for tests. Periodic retry and collection stay far
/// out so that only the delivery path under test moves messages.
pub fn fast_config() -> OutboxConfig {
    OutboxConfig {
        scheduler_tick_ms: 20,
        backlog_interval_ms: 50,
        publish_retry_backoff_ms: 50,
        consumer_poll_timeout_ms: 20,
        offer_timeout_ms: 20,
        retry_interval_secs: 3_600,
        collector_interval_secs: 3_600,
        shutdown_grace_ms: 2_000,
        worker_id: Some(7),
        ..OutboxConfig::default()
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// One observed handler invocation.
#[derive(Debug, Clone)]
pub struct Call {
    pub origin_id: i64,
    pub attempt: u32,
    pub content: String,
    pub at: Instant,
}

/// Records every invocation and fails the first `failures` of them.
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<Call>>>,
    failures: usize,
    permanent: bool,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(failures: usize) -> Self {
        Self {
            failures,
            ..Self::default()
        }
    }

    pub fn always_failing() -> Self {
        Self::failing(usize::MAX)
    }

    pub fn permanently_failing() -> Self {
        Self {
            failures: usize::MAX,
            permanent: true,
            ..Self::default()
        }
    }

    /// A raw handler closure bound to this recorder.
    pub fn handler(&self) -> impl Fn(Context) -> HandlerFuture + Send + Sync + 'static {
        let recorder = self.clone();
        move |ctx: Context| -> HandlerFuture {
            let recorder = recorder.clone();
            Box::pin(async move { recorder.record(&ctx) })
        }
    }

    fn record(&self, ctx: &Context) -> HandlerResult {
        let seen = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(Call {
                origin_id: ctx.origin_id(),
                attempt: ctx.attempt(),
                content: ctx.raw_payload().to_string(),
                at: Instant::now(),
            });
            calls.len()
        };
        if seen <= self.failures {
            if self.permanent {
                return Err(HandlerError::permanent("rejected"));
            }
            return Err(HandlerError::failed(format!("attempt {seen} failed")));
        }
        Ok(None)
    }

    pub fn count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

/// Poll `check` every 10ms until it holds or `within` runs out.
pub async fn eventually<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn count(outbox: &Outbox, category: MessageCategory, status: MessageStatus) -> u64 {
    outbox.statistics().await.unwrap().count(category, status)
}

pub async fn outbox_status(outbox: &Outbox, id: i64) -> Option<MessageStatus> {
    outbox
        .get_message(MessageCategory::Published, id)
        .await
        .unwrap()
        .map(|message| message.status)
}
