//! Bounded FIFO of packets waiting to be sent
//!
//! When the queue is full new packets are rejected rather than evicting older
//! ones, so already queued work keeps its order. Producers treat the rejection
//! as backpressure and decide themselves whether to retry or drop.

use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("packet queue is full ({capacity} entries)")]
pub struct QueueFull {
    pub capacity: usize,
}

#[derive(Debug)]
pub struct PacketQueue<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> PacketQueue<T> {
    /// Creates an empty queue that never holds more than `capacity` entries
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends `packet`, or drops it if the queue is at capacity
    pub fn push(&mut self, packet: T) -> Result<(), QueueFull> {
        if self.is_full() {
            return Err(QueueFull {
                capacity: self.capacity,
            });
        }
        self.entries.push_back(packet);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<T> {
        self.entries.pop_front()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_creation() {
        let queue: PacketQueue<u32> = PacketQueue::new(4);
        assert_eq!(queue.capacity(), 4);
        assert_eq!(queue.len(), 0);
        assert!(queue.is_empty());
        assert!(!queue.is_full());
    }

    #[test]
    fn test_push_until_full() {
        let mut queue = PacketQueue::new(3);

        assert!(queue.push(1).is_ok());
        assert!(queue.push(2).is_ok());
        assert!(queue.push(3).is_ok());
        assert!(queue.is_full());

        assert_eq!(queue.push(4), Err(QueueFull { capacity: 3 }));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_pop_in_push_order() {
        let mut queue = PacketQueue::new(3);
        for value in ["a", "b", "c", "d"] {
            let _ = queue.push(value);
        }

        assert_eq!(queue.pop(), Some("a"));
        assert_eq!(queue.pop(), Some("b"));
        assert_eq!(queue.pop(), Some("c"));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_pop_frees_space() {
        let mut queue = PacketQueue::new(2);
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        assert!(queue.push(3).is_err());

        assert_eq!(queue.pop(), Some(1));
        assert!(queue.push(3).is_ok());
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
    }

    #[test]
    fn test_clear_discards_entries() {
        let mut queue = PacketQueue::new(4);
        queue.push(10).unwrap();
        queue.push(20).unwrap();

        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);
        assert_eq!(queue.capacity(), 4);
    }

    #[test]
    fn test_zero_capacity_rejects_everything() {
        let mut queue = PacketQueue::new(0);
        assert!(queue.is_full());
        assert!(queue.push(1).is_err());
        assert!(queue.is_empty());
    }
}
