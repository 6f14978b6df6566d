//! Bounded FIFO of outbound messages awaiting an open link.

use std::collections::VecDeque;

use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub id:          String,
    /// Encoded frame, ready for the transport.
    pub payload:     String,
    pub enqueued_at: Instant,
}

/// Drop-oldest queue: when full, the oldest entry makes room for the newest.
#[derive(Debug)]
pub struct OutboundQueue {
    capacity: usize,
    items:    VecDeque<QueuedMessage>,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        OutboundQueue { capacity, items: VecDeque::with_capacity(capacity) }
    }

    /// Append `msg`; returns the evicted entry when the queue was full.
    pub fn enqueue(&mut self, msg: QueuedMessage) -> Option<QueuedMessage> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(msg);
        evicted
    }

    /// Put unsent messages back at the head, ahead of anything queued since.
    /// Returns whatever no longer fits, newest-queued first out.
    pub fn requeue_front(&mut self, msgs: Vec<QueuedMessage>) -> Vec<QueuedMessage> {
        for msg in msgs.into_iter().rev() {
            self.items.push_front(msg);
        }
        let mut overflow = Vec::new();
        while self.items.len() > self.capacity {
            if let Some(m) = self.items.pop_front() {
                overflow.push(m);
            }
        }
        overflow
    }

    /// Take every queued message in FIFO order, leaving the queue empty.
    pub fn drain_all(&mut self) -> Vec<QueuedMessage> {
        self.items.drain(..).collect()
    }

    pub fn size(&self) -> usize { self.items.len() }

    pub fn capacity(&self) -> usize { self.capacity }

    pub fn is_empty(&self) -> bool { self.items.is_empty() }
}
