//! Explicit transaction context.
//!
//! A [`Transaction`] is passed by reference into the publisher and storage
//! instead of living in thread-local state. It moves from `Active` to either
//! `Committed` or `RolledBack`, optionally drives an [`AmbientTransaction`]
//! (a surrounding database transaction), and fires registered
//! [`TransactionListener`]s around the real commit or rollback.
//!
//! ```ignore
//! let tx = Transaction::begin(None, Duration::from_secs(5));
//! publisher.publish_in(&tx, "order.created", &payload, PublishOptions::default()).await?;
//! tx.commit().await?; // dispatch happens here, never before
//! ```

mod listener;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::error::TransactionError;

pub use listener::{FnListener, ListenerError, ListenerResult, TransactionListener};

static NEXT_TRANSACTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

/// A surrounding database transaction the outbox write piggybacks on.
#[async_trait]
pub trait AmbientTransaction: Send {
    async fn commit(self: Box<Self>) -> Result<(), String>;
    async fn rollback(self: Box<Self>) -> Result<(), String>;
}

#[derive(Clone, Copy, Debug)]
enum Phase {
    BeforeCommit,
    AfterCommit,
    BeforeRollback,
    AfterRollback,
}

pub struct Transaction {
    id: u64,
    state: Mutex<TransactionState>,
    finishing: AtomicBool,
    closed: AtomicBool,
    started: Instant,
    timeout: Duration,
    ambient: Mutex<Option<Box<dyn AmbientTransaction>>>,
    listeners: Mutex<Vec<Arc<dyn TransactionListener>>>,
}

impl Transaction {
    /// Start a transaction, optionally wrapping an ambient one.
    pub fn begin(ambient: Option<Box<dyn AmbientTransaction>>, timeout: Duration) -> Self {
        let id = NEXT_TRANSACTION_ID.fetch_add(1, Ordering::Relaxed);
        debug!(transaction_id = id, timeout_ms = timeout.as_millis() as u64, "Transaction started");
        Self {
            id,
            state: Mutex::new(TransactionState::Active),
            finishing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            started: Instant::now(),
            timeout,
            ambient: Mutex::new(ambient),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active && !self.finishing.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Register a listener. Listeners fire in registration order.
    pub fn add_listener<L>(&self, listener: L) -> Result<(), TransactionError>
    where
        L: TransactionListener + 'static,
    {
        self.add_shared_listener(Arc::new(listener))
    }

    pub fn add_shared_listener(
        &self,
        listener: Arc<dyn TransactionListener>,
    ) -> Result<(), TransactionError> {
        if !self.is_active() {
            return Err(TransactionError::NotActive);
        }
        self.listeners.lock().push(listener);
        Ok(())
    }

    /// Run `action` once the transaction has really committed.
    pub fn after_commit<F, Fut>(&self, action: F) -> Result<(), TransactionError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ListenerResult> + Send + 'static,
    {
        self.add_listener(FnListener::after_commit(action))
    }

    /// Run `action` once the transaction has really rolled back.
    pub fn after_rollback<F, Fut>(&self, action: F) -> Result<(), TransactionError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ListenerResult> + Send + 'static,
    {
        self.add_listener(FnListener::after_rollback(action))
    }

    /// Commit. If the timeout has elapsed the transaction is rolled back
    /// instead and [`TransactionError::TimedOut`] is returned.
    pub async fn commit(&self) -> Result<(), TransactionError> {
        self.begin_finish()?;

        let elapsed = self.elapsed();
        if elapsed > self.timeout {
            warn!(
                transaction_id = self.id,
                elapsed_ms = elapsed.as_millis() as u64,
                timeout_ms = self.timeout.as_millis() as u64,
                "Transaction timed out at commit, rolling back"
            );
            self.finish_rollback().await?;
            return Err(TransactionError::TimedOut {
                elapsed_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            });
        }

        let listeners = self.snapshot_listeners();
        run_phase(self.id, &listeners, Phase::BeforeCommit).await;

        let ambient = self.ambient.lock().take();
        if let Some(ambient) = ambient {
            if let Err(reason) = ambient.commit().await {
                error!(transaction_id = self.id, error = %reason, "Ambient commit failed");
                *self.state.lock() = TransactionState::RolledBack;
                run_phase(self.id, &listeners, Phase::AfterRollback).await;
                return Err(TransactionError::Ambient(reason));
            }
        }

        *self.state.lock() = TransactionState::Committed;
        debug!(transaction_id = self.id, "Transaction committed");
        run_phase(self.id, &listeners, Phase::AfterCommit).await;
        Ok(())
    }

    pub async fn rollback(&self) -> Result<(), TransactionError> {
        self.begin_finish()?;
        self.finish_rollback().await
    }

    /// End the resource scope. A still-active transaction is rolled back.
    pub async fn close(&self) {
        if self.is_active() {
            if let Err(err) = self.rollback().await {
                warn!(transaction_id = self.id, error = %err, "Rollback on close failed");
            }
        }
        self.closed.store(true, Ordering::Release);
    }

    fn begin_finish(&self) -> Result<(), TransactionError> {
        if self.state() != TransactionState::Active || self.finishing.swap(true, Ordering::AcqRel) {
            return Err(TransactionError::NotActive);
        }
        Ok(())
    }

    async fn finish_rollback(&self) -> Result<(), TransactionError> {
        let listeners = self.snapshot_listeners();
        run_phase(self.id, &listeners, Phase::BeforeRollback).await;

        let ambient = self.ambient.lock().take();
        let outcome = match ambient {
            Some(ambient) => ambient.rollback().await.map_err(TransactionError::Ambient),
            None => Ok(()),
        };
        if let Err(err) = &outcome {
            error!(transaction_id = self.id, error = %err, "Ambient rollback failed");
        }

        *self.state.lock() = TransactionState::RolledBack;
        debug!(transaction_id = self.id, "Transaction rolled back");
        run_phase(self.id, &listeners, Phase::AfterRollback).await;
        outcome
    }

    fn snapshot_listeners(&self) -> Vec<Arc<dyn TransactionListener>> {
        self.listeners.lock().clone()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
        if self.state() != TransactionState::Active || self.finishing.load(Ordering::Acquire) {
            return;
        }

        warn!(transaction_id = self.id, "Active transaction dropped, rolling back");
        let id = self.id;
        let listeners = std::mem::take(&mut *self.listeners.lock());
        let ambient = self.ambient.lock().take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    run_phase(id, &listeners, Phase::BeforeRollback).await;
                    if let Some(ambient) = ambient {
                        if let Err(reason) = ambient.rollback().await {
                            error!(transaction_id = id, error = %reason, "Ambient rollback failed");
                        }
                    }
                    run_phase(id, &listeners, Phase::AfterRollback).await;
                });
            }
            Err(_) => {
                error!(transaction_id = id, "No runtime available to run rollback listeners");
            }
        }
    }
}

async fn run_phase(transaction_id: u64, listeners: &[Arc<dyn TransactionListener>], phase: Phase) {
    for (index, listener) in listeners.iter().enumerate() {
        let call = async {
            match phase {
                Phase::BeforeCommit => listener.before_commit().await,
                Phase::AfterCommit => listener.after_commit().await,
                Phase::BeforeRollback => listener.before_rollback().await,
                Phase::AfterRollback => listener.after_rollback().await,
            }
        };

        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(transaction_id, listener = index, ?phase, error = %err, "Transaction listener failed");
            }
            Err(_) => {
                error!(transaction_id, listener = index, ?phase, "Transaction listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(counter: &Arc<AtomicUsize>) -> impl FnOnce() -> futures::future::Ready<ListenerResult> {
        let counter = Arc::clone(counter);
        move || {
            counter.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn commit_fires_after_commit_only() {
        let commits = Arc::new(AtomicUsize::new(0));
        let rollbacks = Arc::new(AtomicUsize::new(0));
        let tx = Transaction::begin(None, Duration::from_secs(5));
        tx.after_commit(counting(&commits)).unwrap();
        tx.after_rollback(counting(&rollbacks)).unwrap();

        tx.commit().await.unwrap();

        assert_eq!(tx.state(), TransactionState::Committed);
        assert_eq!(commits.load(Ordering::SeqCst), 1);
        assert_eq!(rollbacks.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rollback_fires_after_rollback_only() {
        let commits = Arc::new(AtomicUsize::new(0));
        let rollbacks = Arc::new(AtomicUsize::new(0));
        let tx = Transaction::begin(None, Duration::from_secs(5));
        tx.after_commit(counting(&commits)).unwrap();
        tx.after_rollback(counting(&rollbacks)).unwrap();

        tx.rollback().await.unwrap();

        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert_eq!(commits.load(Ordering::SeqCst), 0);
        assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_commit_is_rejected() {
        let tx = Transaction::begin(None, Duration::from_secs(5));
        tx.commit().await.unwrap();
        assert_eq!(tx.commit().await, Err(TransactionError::NotActive));
        assert_eq!(tx.rollback().await, Err(TransactionError::NotActive));
        assert!(tx.after_commit(|| futures::future::ready(Ok(()))).is_err());
    }

    #[tokio::test]
    async fn expired_transaction_rolls_back_on_commit() {
        let commits = Arc::new(AtomicUsize::new(0));
        let rollbacks = Arc::new(AtomicUsize::new(0));
        let tx = Transaction::begin(None, Duration::from_millis(10));
        tx.after_commit(counting(&commits)).unwrap();
        tx.after_rollback(counting(&rollbacks)).unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let result = tx.commit().await;

        assert!(matches!(result, Err(TransactionError::TimedOut { .. })));
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert_eq!(commits.load(Ordering::SeqCst), 0);
        assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_listener_does_not_block_later_listeners() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let tx = Transaction::begin(None, Duration::from_secs(5));

        let first = Arc::clone(&order);
        tx.after_commit(move || async move {
            first.lock().push(1);
            Err::<(), ListenerError>("first listener broke".into())
        })
        .unwrap();
        tx.after_commit(|| async move {
            if should_panic_now() {
                panic!("second listener panicked");
            }
            Ok(())
        })
        .unwrap();
        let third = Arc::clone(&order);
        tx.after_commit(move || async move {
            third.lock().push(3);
            Ok(())
        })
        .unwrap();

        tx.commit().await.unwrap();
        assert_eq!(*order.lock(), vec![1, 3]);
    }

    fn should_panic_now() -> bool {
        true
    }

    struct RecordingAmbient {
        log: Arc<Mutex<Vec<&'static str>>>,
        fail_commit: bool,
    }

    #[async_trait]
    impl AmbientTransaction for RecordingAmbient {
        async fn commit(self: Box<Self>) -> Result<(), String> {
            self.log.lock().push("ambient-commit");
            if self.fail_commit {
                Err("constraint violation".into())
            } else {
                Ok(())
            }
        }

        async fn rollback(self: Box<Self>) -> Result<(), String> {
            self.log.lock().push("ambient-rollback");
            Ok(())
        }
    }

    #[tokio::test]
    async fn ambient_commit_happens_before_after_commit_listeners() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let tx = Transaction::begin(
            Some(Box::new(RecordingAmbient {
                log: Arc::clone(&log),
                fail_commit: false,
            })),
            Duration::from_secs(5),
        );
        let listener_log = Arc::clone(&log);
        tx.after_commit(move || async move {
            listener_log.lock().push("listener");
            Ok(())
        })
        .unwrap();

        tx.commit().await.unwrap();
        assert_eq!(*log.lock(), vec!["ambient-commit", "listener"]);
    }

    #[tokio::test]
    async fn failed_ambient_commit_runs_rollback_listeners() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let commits = Arc::new(AtomicUsize::new(0));
        let rollbacks = Arc::new(AtomicUsize::new(0));
        let tx = Transaction::begin(
            Some(Box::new(RecordingAmbient {
                log: Arc::clone(&log),
                fail_commit: true,
            })),
            Duration::from_secs(5),
        );
        tx.after_commit(counting(&commits)).unwrap();
        tx.after_rollback(counting(&rollbacks)).unwrap();

        let result = tx.commit().await;
        assert!(matches!(result, Err(TransactionError::Ambient(_))));
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert_eq!(commits.load(Ordering::SeqCst), 0);
        assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropping_active_transaction_rolls_back() {
        let rollbacks = Arc::new(AtomicUsize::new(0));
        {
            let tx = Transaction::begin(None, Duration::from_secs(5));
            tx.after_rollback(counting(&rollbacks)).unwrap();
        }
        for _ in 0..50 {
            if rollbacks.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_rolls_back_active_transaction() {
        let tx = Transaction::begin(None, Duration::from_secs(5));
        tx.close().await;
        assert!(tx.is_closed());
        assert_eq!(tx.state(), TransactionState::RolledBack);
    }
}
