//! Handler registry.
//!
//! Handlers are registered explicitly per `(name, group)` pair, either raw
//! (receiving the [`Context`]) or typed (the payload is deserialized first).
//!
//! ```ignore
//! let registry = HandlerRegistry::new()
//!     .subscribe_typed("order.created", "orders", |order: OrderCreated, _ctx| async move {
//!         reserve_stock(&order).await.map_err(HandlerError::failed)?;
//!         Ok(None)
//!     })
//!     .register(
//!         HandlerDescriptor::new("order.cancelled", "orders", |ctx| async move {
//!             let raw = ctx.raw_payload().to_string();
//!             Ok(Some(serde_json::json!({ "seen": raw })))
//!         })
//!         .with_max_retries(10)
//!         .with_retry_interval(Duration::from_secs(30)),
//!     );
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;

use super::context::Context;
use crate::error::{HandlerError, HandlerResult};

type HandlerFn = Arc<dyn Fn(Context) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// One registered handler plus its retry overrides.
#[derive(Clone)]
pub struct HandlerDescriptor {
    name: String,
    group: String,
    max_retries: Option<u32>,
    retry_interval: Option<Duration>,
    handler: HandlerFn,
}

impl HandlerDescriptor {
    /// A handler that receives the raw message through its context.
    pub fn new<F, Fut>(name: impl Into<String>, group: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            group: group.into(),
            max_retries: None,
            retry_interval: None,
            handler: Arc::new(move |ctx| handler(ctx).boxed()),
        }
    }

    /// A handler whose payload is decoded into `T` before the call. A payload
    /// that does not decode fails permanently.
    pub fn typed<T, F, Fut>(name: impl Into<String>, group: impl Into<String>, handler: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler = Arc::new(handler);
        Self::new(name, group, move |ctx: Context| {
            let handler = Arc::clone(&handler);
            async move {
                let payload = ctx.payload::<T>()?;
                handler(payload, ctx).await
            }
        })
    }

    /// Override the message's retry ceiling for this handler.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Redeliver failures after `interval` instead of immediately.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = Some(interval);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    pub fn retry_interval(&self) -> Option<Duration> {
        self.retry_interval
    }

    pub(crate) fn call(&self, ctx: Context) -> BoxFuture<'static, HandlerResult> {
        (self.handler)(ctx)
    }
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("name", &self.name)
            .field("group", &self.group)
            .field("max_retries", &self.max_retries)
            .field("retry_interval", &self.retry_interval)
            .finish_non_exhaustive()
    }
}

/// All handlers known to this process, keyed by `(name, group)`.
#[derive(Clone, Default, Debug)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, String), HandlerDescriptor>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a raw handler. A later registration for the same pair wins.
    pub fn subscribe<F, Fut>(self, name: &str, group: &str, handler: F) -> Self
    where
        F: Fn(Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(HandlerDescriptor::new(name, group, handler))
    }

    /// Register a typed handler.
    pub fn subscribe_typed<T, F, Fut>(self, name: &str, group: &str, handler: F) -> Self
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register(HandlerDescriptor::typed(name, group, handler))
    }

    pub fn register(mut self, descriptor: HandlerDescriptor) -> Self {
        self.handlers.insert(
            (descriptor.name.clone(), descriptor.group.clone()),
            descriptor,
        );
        self
    }

    pub fn get(&self, name: &str, group: &str) -> Option<&HandlerDescriptor> {
        self.handlers.get(&(name.to_string(), group.to_string()))
    }

    /// Look up a handler, failing with [`HandlerError::NotFound`].
    pub fn require(&self, name: &str, group: &str) -> Result<&HandlerDescriptor, HandlerError> {
        self.get(name, group).ok_or_else(|| HandlerError::NotFound {
            name: name.to_string(),
            group: group.to_string(),
        })
    }

    /// Distinct groups, one consumer loop each.
    pub fn groups(&self) -> BTreeSet<String> {
        self.handlers.keys().map(|(_, group)| group.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
