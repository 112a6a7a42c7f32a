use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;
use switchyard_core::Message;

/// Ordering key: higher priority first, then earlier arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    priority: Reverse<i32>,
    seq: u64,
}

/// Bounded priority queue of published messages.
///
/// Not synchronized; the bus guards it with a mutex.
pub(crate) struct MessageQueue {
    entries: BTreeMap<QueueKey, Arc<Message>>,
    capacity: usize,
}

impl MessageQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity,
        }
    }

    /// Insert a message; returns the evicted message if capacity was exceeded.
    pub(crate) fn push(&mut self, seq: u64, message: Arc<Message>) -> Option<Arc<Message>> {
        let key = QueueKey {
            priority: Reverse(message.priority),
            seq,
        };
        self.entries.insert(key, message);
        if self.entries.len() > self.capacity {
            self.evict()
        } else {
            None
        }
    }

    /// Remove the next message to deliver.
    pub(crate) fn pop(&mut self) -> Option<(u64, Arc<Message>)> {
        self.entries.pop_first().map(|(k, m)| (k.seq, m))
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queued messages in delivery order.
    pub(crate) fn snapshot(&self) -> Vec<Arc<Message>> {
        self.entries.values().cloned().collect()
    }

    /// Drop the oldest message among those with the lowest priority.
    fn evict(&mut self) -> Option<Arc<Message>> {
        let lowest = self.entries.keys().next_back()?.priority;
        let key = *self
            .entries
            .range(QueueKey {
                priority: lowest,
                seq: 0,
            }..)
            .next()?
            .0;
        self.entries.remove(&key)
    }
}
