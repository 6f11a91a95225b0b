//! Outbound message queue.
//!
//! Wire strings waiting for the outbound gate to open. Insertion order is
//! delivery order; an entry only leaves the queue by being sent.

use std::collections::VecDeque;

#[derive(Debug, Default)]
pub struct OutboundQueue {
    entries: VecDeque<String>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, entry: String) {
        self.entries.push_back(entry);
    }

    /// Remove and return every pending entry, oldest first.
    pub fn drain_all(&mut self) -> Vec<String> {
        self.entries.drain(..).collect()
    }

    /// Put unsent entries back ahead of anything queued since they were drained.
    pub fn restore_front(&mut self, entries: Vec<String>) {
        for entry in entries.into_iter().rev() {
            self.entries.push_front(entry);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_preserves_enqueue_order() {
        let mut queue = OutboundQueue::new();
        for i in 0..5 {
            queue.enqueue(format!("msg-{i}"));
        }

        assert_eq!(queue.len(), 5);
        assert_eq!(
            queue.drain_all(),
            vec!["msg-0", "msg-1", "msg-2", "msg-3", "msg-4"]
        );
        assert!(queue.is_empty());
        assert!(queue.drain_all().is_empty());
    }

    #[test]
    fn test_restore_front_keeps_unsent_ahead_of_new_entries() {
        let mut queue = OutboundQueue::new();
        queue.enqueue("a".into());
        queue.enqueue("b".into());
        queue.enqueue("c".into());

        let mut drained = queue.drain_all();
        queue.enqueue("d".into());
        let unsent = drained.split_off(1);
        queue.restore_front(unsent);

        assert_eq!(queue.drain_all(), vec!["b", "c", "d"]);
    }
}
