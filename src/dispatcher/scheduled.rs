use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};

use crate::message::Message;

struct Entry {
    due: DateTime<Utc>,
    seq: u64,
    message: Message,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.due.cmp(&other.due).then(self.seq.cmp(&other.seq))
    }
}

/// Delayed messages ordered by due time, ties by insertion order.
#[derive(Default)]
pub struct ScheduledQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
}

impl ScheduledQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park `message` until its `expires_at`; a message without one is due
    /// immediately.
    pub fn push(&mut self, message: Message) {
        let due = message.expires_at.unwrap_or_else(Utc::now);
        self.next_seq += 1;
        self.heap.push(Reverse(Entry {
            due,
            seq: self.next_seq,
            message,
        }));
    }

    /// Pop up to `limit` entries due at `now`, earliest first. Entries not
    /// yet due stay queued.
    pub fn pop_due(&mut self, now: DateTime<Utc>, limit: usize) -> Vec<Message> {
        let mut due = Vec::new();
        while due.len() < limit {
            match self.heap.peek() {
                Some(Reverse(entry)) if entry.due <= now => {}
                _ => break,
            }
            if let Some(Reverse(entry)) = self.heap.pop() {
                due.push(entry.message);
            }
        }
        due
    }

    /// Earliest due time still queued.
    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.heap.peek().map(|Reverse(entry)| entry.due)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn delayed(id: i64, due: DateTime<Utc>) -> Message {
        Message::new(id, "order.created", "orders", "{}", "v1", 3).delay_until(due)
    }

    #[test]
    fn pops_only_due_entries_in_due_order() {
        let now = Utc::now();
        let mut queue = ScheduledQueue::new();
        queue.push(delayed(1, now + Duration::seconds(30)));
        queue.push(delayed(2, now - Duration::seconds(5)));
        queue.push(delayed(3, now - Duration::seconds(10)));

        let ids: Vec<i64> = queue.pop_due(now, 10).iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![3, 2]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_due(), Some(now + Duration::seconds(30)));
    }

    #[test]
    fn equal_due_times_keep_insertion_order() {
        let due = Utc::now() - Duration::seconds(1);
        let mut queue = ScheduledQueue::new();
        for id in [5, 1, 9] {
            queue.push(delayed(id, due));
        }

        let ids: Vec<i64> = queue.pop_due(Utc::now(), 10).iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![5, 1, 9]);
    }

    #[test]
    fn pop_respects_limit() {
        let due = Utc::now() - Duration::seconds(1);
        let mut queue = ScheduledQueue::new();
        for id in 1..=4 {
            queue.push(delayed(id, due));
        }
        assert_eq!(queue.pop_due(Utc::now(), 3).len(), 3);
        assert_eq!(queue.len(), 1);
        assert!(!queue.is_empty());
    }
}
