//! Bounded outbound queue used while the socket is down.

use std::collections::VecDeque;

use crate::infrastructure::dto::websocket::OutboundEvent;

/// FIFO of events awaiting a connected socket. When full, the oldest event is
/// dropped to make room.
#[derive(Debug)]
pub struct OutboundQueue {
    events: VecDeque<OutboundEvent>,
    capacity: usize,
}

impl OutboundQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `event`, returning the event evicted to make room, if any.
    pub fn push(&mut self, event: OutboundEvent) -> Option<OutboundEvent> {
        let evicted = if self.events.len() >= self.capacity {
            self.events.pop_front()
        } else {
            None
        };
        self.events.push_back(event);
        evicted
    }

    /// Put back an event whose write failed so it is flushed first next time.
    pub fn requeue(&mut self, event: OutboundEvent) {
        self.events.push_front(event);
        if self.events.len() > self.capacity {
            self.events.pop_back();
        }
    }

    pub fn pop(&mut self) -> Option<OutboundEvent> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn clear(&mut self) -> usize {
        let count = self.events.len();
        self.events.clear();
        count
    }
}
