//! Bounded FIFO for frames attempted while the socket is down.
//!
//! Bounded memory takes priority over guaranteed delivery: overflowing the
//! queue drops the *oldest* frame and logs a warning, so after any burst the
//! newest `capacity` frames survive.  On reconnection the loop drains the
//! queue in FIFO order before accepting new sends.

use std::collections::VecDeque;

use tracing::warn;

pub struct OutboundQueue {
    frames: VecDeque<String>,
    capacity: usize,
}

impl OutboundQueue {
    /// `capacity` must be at least 1 (enforced by config validation).
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    /// Enqueue `frame`, evicting the oldest entry when full.
    pub fn push(&mut self, frame: String) {
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
            warn!(
                capacity = self.capacity,
                "outbound queue full; dropping oldest frame"
            );
        }
        self.frames.push_back(frame);
    }

    /// Dequeue the oldest frame, if any.
    pub fn pop(&mut self) -> Option<String> {
        self.frames.pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let mut queue = OutboundQueue::new(4);
        queue.push("a".to_string());
        queue.push("b".to_string());
        queue.push("c".to_string());
        assert_eq!(queue.pop().as_deref(), Some("a"));
        assert_eq!(queue.pop().as_deref(), Some("b"));
        assert_eq!(queue.pop().as_deref(), Some("c"));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn overflow_drops_oldest_keeps_newest_capacity() {
        let mut queue = OutboundQueue::new(3);
        for label in ["a", "b", "c", "d", "e"] {
            queue.push(label.to_string());
        }
        assert_eq!(queue.len(), 3);
        // The newest N survive, oldest were evicted first.
        assert_eq!(queue.pop().as_deref(), Some("c"));
        assert_eq!(queue.pop().as_deref(), Some("d"));
        assert_eq!(queue.pop().as_deref(), Some("e"));
    }

    #[test]
    fn capacity_one_keeps_latest() {
        let mut queue = OutboundQueue::new(1);
        queue.push("old".to_string());
        queue.push("new".to_string());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().as_deref(), Some("new"));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut queue = OutboundQueue::new(0);
        queue.push("only".to_string());
        assert_eq!(queue.pop().as_deref(), Some("only"));
    }
}
