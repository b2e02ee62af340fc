//! In-memory broker for tests and single-process deployments.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{decode_envelope, encode_envelope, Delivery, MessageQueue};
use crate::error::TransportResult;
use crate::message::Message;

struct Frame {
    delivery_id: u64,
    bytes: Vec<u8>,
}

#[derive(Default)]
struct Lane {
    ready: VecDeque<Frame>,
    unacked: HashMap<u64, Vec<u8>>,
    delayed: BinaryHeap<Reverse<(Instant, u64)>>,
    delayed_frames: HashMap<u64, Vec<u8>>,
}

impl Lane {
    /// Move every due delayed frame to the back of `ready`.
    fn promote_due(&mut self, now: Instant) {
        while let Some(Reverse((due, id))) = self.delayed.peek().copied() {
            if due > now {
                break;
            }
            self.delayed.pop();
            if let Some(bytes) = self.delayed_frames.remove(&id) {
                self.ready.push_back(Frame {
                    delivery_id: id,
                    bytes,
                });
            }
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.peek().map(|Reverse((due, _))| *due)
    }
}

#[derive(Default)]
struct Broker {
    lanes: HashMap<String, Lane>,
    next_delivery: u64,
}

impl Broker {
    fn lane(&mut self, destination: &str) -> &mut Lane {
        self.lanes.entry(destination.to_string()).or_default()
    }

    fn next_id(&mut self) -> u64 {
        self.next_delivery += 1;
        self.next_delivery
    }
}

/// Thread-safe in-memory queue.
///
/// Each destination keeps a FIFO of ready frames, the frames handed out but
/// not yet acknowledged, and a due-time heap for delayed sends. `capacity`
/// bounds the ready FIFO; a full lane refuses sends with `Ok(false)`.
/// Cloning shares the broker.
#[derive(Clone)]
pub struct InMemoryQueue {
    broker: Arc<Mutex<Broker>>,
    notify: Arc<Notify>,
    capacity: usize,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::with_capacity(usize::MAX)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            broker: Arc::new(Mutex::new(Broker::default())),
            notify: Arc::new(Notify::new()),
            capacity,
        }
    }

    /// Frames ready for delivery on `destination`.
    pub fn depth(&self, destination: &str) -> usize {
        self.broker
            .lock()
            .lanes
            .get(destination)
            .map_or(0, |lane| lane.ready.len())
    }

    /// Frames delivered but not yet acknowledged or rejected.
    pub fn in_flight(&self, destination: &str) -> usize {
        self.broker
            .lock()
            .lanes
            .get(destination)
            .map_or(0, |lane| lane.unacked.len())
    }

    /// Frames still waiting out their delay.
    pub fn delayed(&self, destination: &str) -> usize {
        self.broker
            .lock()
            .lanes
            .get(destination)
            .map_or(0, |lane| lane.delayed_frames.len())
    }

    /// Hand out up to `max_count` ready frames. Each frame is decoded before
    /// it moves to `unacked`; an undecodable frame is dropped on the spot.
    fn take_ready(&self, destination: &str, max_count: usize) -> (Vec<Delivery>, Option<Instant>) {
        let mut broker = self.broker.lock();
        let lane = broker.lane(destination);
        lane.promote_due(Instant::now());

        let mut taken = Vec::new();
        while taken.len() < max_count {
            let Some(frame) = lane.ready.pop_front() else {
                break;
            };
            match decode_envelope(&frame.bytes) {
                Ok(message) => {
                    lane.unacked.insert(frame.delivery_id, frame.bytes);
                    taken.push(Delivery {
                        delivery_id: frame.delivery_id.to_string(),
                        destination: destination.to_string(),
                        message,
                    });
                }
                Err(err) => {
                    warn!(destination, delivery_id = frame.delivery_id, error = %err, "Undecodable frame, discarding");
                }
            }
        }
        (taken, lane.next_due())
    }
}

fn parse_delivery_id(delivery_id: &str) -> Option<u64> {
    delivery_id.parse().ok()
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn send(&self, destination: &str, message: &Message) -> TransportResult<bool> {
        let bytes = encode_envelope(message)?;
        {
            let mut broker = self.broker.lock();
            let delivery_id = broker.next_id();
            let lane = broker.lane(destination);
            if lane.ready.len() >= self.capacity {
                debug!(destination, message_id = message.id, "Queue full, refusing send");
                return Ok(false);
            }
            lane.ready.push_back(Frame { delivery_id, bytes });
        }
        self.notify.notify_waiters();
        Ok(true)
    }

    async fn send_delay(
        &self,
        destination: &str,
        message: &Message,
        delay: Duration,
    ) -> TransportResult<bool> {
        let bytes = encode_envelope(message)?;
        let due = Instant::now() + delay;
        {
            let mut broker = self.broker.lock();
            let delivery_id = broker.next_id();
            let lane = broker.lane(destination);
            lane.delayed.push(Reverse((due, delivery_id)));
            lane.delayed_frames.insert(delivery_id, bytes);
        }
        self.notify.notify_waiters();
        Ok(true)
    }

    async fn receive_batch(
        &self,
        destination: &str,
        max_count: usize,
        timeout: Duration,
    ) -> TransportResult<Vec<Delivery>> {
        let deadline = Instant::now() + timeout;
        loop {
            // Registered before the check so a send in between still wakes us.
            let notified = self.notify.notified();
            let (taken, next_due) = self.take_ready(destination, max_count.max(1));

            if !taken.is_empty() {
                return Ok(taken);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let wake_at = next_due.map_or(deadline, |due| due.min(deadline));
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn acknowledge(&self, destination: &str, delivery_id: &str) -> TransportResult<()> {
        if let Some(id) = parse_delivery_id(delivery_id) {
            self.broker.lock().lane(destination).unacked.remove(&id);
        }
        Ok(())
    }

    async fn reject(
        &self,
        destination: &str,
        delivery_id: &str,
        requeue: bool,
    ) -> TransportResult<()> {
        let Some(id) = parse_delivery_id(delivery_id) else {
            return Ok(());
        };
        let requeued = {
            let mut broker = self.broker.lock();
            let redelivery_id = broker.next_id();
            let lane = broker.lane(destination);
            match lane.unacked.remove(&id) {
                Some(bytes) if requeue => {
                    lane.ready.push_back(Frame {
                        delivery_id: redelivery_id,
                        bytes,
                    });
                    true
                }
                _ => false,
            }
        };
        if requeued {
            self.notify.notify_waiters();
        }
        Ok(())
    }
}
