//! Periodic background processors.
//!
//! Each processor runs on its own task at a fixed interval. A failing cycle
//! is logged by the processor and the next tick runs as usual; nothing here
//! ends the loop except [`ProcessorHandle::stop`].

mod collector;
mod retry;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::dispatcher;

pub use collector::CollectorProcessor;
pub use retry::RetryProcessor;

#[async_trait]
pub trait Processor: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Run one cycle. Errors are handled inside.
    async fn process(&self);
}

/// A running processor loop.
pub struct ProcessorHandle {
    name: &'static str,
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ProcessorHandle {
    /// Run `processor` every `interval`, starting immediately.
    pub fn spawn<P: Processor>(processor: Arc<P>, interval: Duration) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let name = processor.name();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval.max(Duration::from_millis(1)));
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = dispatcher::stopped(&mut stopped) => break,
                    _ = tick.tick() => {
                        debug!(processor = name, "Processor cycle");
                        processor.process().await;
                    }
                }
            }
        });
        info!(processor = name, interval_ms = interval.as_millis() as u64, "Processor started");
        Self { name, stop, handle }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stop after the cycle in progress, aborting it after `grace`.
    pub async fn stop(mut self, grace: Duration) {
        self.stop.send_replace(true);
        match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!(processor = self.name, error = %err, "Processor ended abnormally"),
            Err(_) => {
                self.handle.abort();
                warn!(processor = self.name, "Processor overran shutdown grace, aborted");
            }
        }
        info!(processor = self.name, "Processor stopped");
    }
}
