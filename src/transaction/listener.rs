use std::future::Future;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;

pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;
pub type ListenerResult = Result<(), ListenerError>;

/// Hooks fired around a transaction's real commit or rollback.
///
/// Every hook defaults to a no-op so implementors only override what they
/// need. Errors are logged by the transaction and never stop the remaining
/// listeners from running.
#[async_trait]
pub trait TransactionListener: Send + Sync {
    async fn before_commit(&self) -> ListenerResult {
        Ok(())
    }

    async fn after_commit(&self) -> ListenerResult {
        Ok(())
    }

    async fn before_rollback(&self) -> ListenerResult {
        Ok(())
    }

    async fn after_rollback(&self) -> ListenerResult {
        Ok(())
    }
}

type Action = Box<dyn FnOnce() -> BoxFuture<'static, ListenerResult> + Send>;

enum Hook {
    AfterCommit,
    AfterRollback,
}

/// Single-shot closure listener for one hook.
pub struct FnListener {
    hook: Hook,
    action: Mutex<Option<Action>>,
}

impl FnListener {
    pub fn after_commit<F, Fut>(action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ListenerResult> + Send + 'static,
    {
        Self::new(Hook::AfterCommit, action)
    }

    pub fn after_rollback<F, Fut>(action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ListenerResult> + Send + 'static,
    {
        Self::new(Hook::AfterRollback, action)
    }

    fn new<F, Fut>(hook: Hook, action: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ListenerResult> + Send + 'static,
    {
        let boxed: Action = Box::new(move || Box::pin(action()));
        Self {
            hook,
            action: Mutex::new(Some(boxed)),
        }
    }

    async fn fire(&self) -> ListenerResult {
        let action = self.action.lock().take();
        match action {
            Some(action) => action().await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TransactionListener for FnListener {
    async fn after_commit(&self) -> ListenerResult {
        match self.hook {
            Hook::AfterCommit => self.fire().await,
            Hook::AfterRollback => Ok(()),
        }
    }

    async fn after_rollback(&self) -> ListenerResult {
        match self.hook {
            Hook::AfterRollback => self.fire().await,
            Hook::AfterCommit => Ok(()),
        }
    }
}
