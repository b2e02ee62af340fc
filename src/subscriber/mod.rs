//! Consumer side: handler registration, execution and the receive loop.
//!
//! ```text
//! MessageQueue::receive_batch ──► ConsumerLoop ──► store_received_message
//!                                                         │
//!                                  Dispatcher execute queue ◄──┘
//!                                                         │
//!                                  SubscribeExecutor ──► handler(Context)
//!                                         │
//!                          status write + acknowledge / reject
//! ```

mod consumer;
mod context;
mod executor;
mod registry;

pub use consumer::ConsumerLoop;
pub use context::Context;
pub use executor::SubscribeExecutor;
pub use registry::{HandlerDescriptor, HandlerRegistry};

use crate::message::Message;
use crate::queue::Delivery;

/// Where an inbox row came from on the transport, for acknowledge/reject.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryHandle {
    pub destination: String,
    pub delivery_id: String,
}

impl From<&Delivery> for DeliveryHandle {
    fn from(delivery: &Delivery) -> Self {
        Self {
            destination: delivery.destination.clone(),
            delivery_id: delivery.delivery_id.clone(),
        }
    }
}

/// One unit of work on the execute queue.
///
/// Rows re-offered by the retry sweep have no delivery: there is nothing
/// to acknowledge on the transport.
#[derive(Clone, Debug)]
pub struct ExecuteItem {
    pub message: Message,
    pub delivery: Option<DeliveryHandle>,
}

impl ExecuteItem {
    pub fn delivered(message: Message, delivery: &Delivery) -> Self {
        Self {
            message,
            delivery: Some(DeliveryHandle::from(delivery)),
        }
    }

    pub fn stored(message: Message) -> Self {
        Self {
            message,
            delivery: None,
        }
    }
}

/// Outcome of one execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperateResult {
    Succeeded,
    /// Failed but still under the retry ceiling; it will be redelivered.
    Retry,
    /// Parked in `FAILED`.
    Failed,
}
