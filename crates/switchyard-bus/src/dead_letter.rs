use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use switchyard_core::Message;
use tracing::warn;

/// Why a message ended up in the dead-letter log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// No handler was subscribed to the topic at dispatch time.
    NoSubscribers,
    /// The message's TTL elapsed before dispatch.
    Expired,
    /// The queue overflowed and this message was the lowest-priority oldest.
    Evicted,
}

/// A message that could not be delivered, kept for inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: Message,
    pub reason: DeadLetterReason,
    pub recorded_at: DateTime<Utc>,
}

/// Bounded FIFO of dead letters; the oldest entry is dropped when full.
pub(crate) struct DeadLetterLog {
    entries: VecDeque<DeadLetter>,
    capacity: usize,
    dropped: u64,
}

impl DeadLetterLog {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity,
            dropped: 0,
        }
    }

    pub(crate) fn record(&mut self, message: Message, reason: DeadLetterReason) {
        if self.capacity == 0 {
            self.dropped += 1;
            warn!(message_id = %message.id, ?reason, "Dead-letter log disabled, message discarded");
            return;
        }
        if self.entries.len() >= self.capacity {
            if let Some(old) = self.entries.pop_front() {
                self.dropped += 1;
                warn!(
                    message_id = %old.message.id,
                    "Dead-letter log full, dropping oldest entry"
                );
            }
        }
        self.entries.push_back(DeadLetter {
            message,
            reason,
            recorded_at: Utc::now(),
        });
    }

    /// Append previously recorded letters, keeping their original timestamps.
    pub(crate) fn restore(&mut self, letters: Vec<DeadLetter>) {
        if self.capacity == 0 {
            self.dropped += letters.len() as u64;
            return;
        }
        for letter in letters {
            if self.entries.len() >= self.capacity {
                self.entries.pop_front();
                self.dropped += 1;
            }
            self.entries.push_back(letter);
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<DeadLetter> {
        self.entries.iter().cloned().collect()
    }

    pub(crate) fn take(&mut self, limit: Option<usize>) -> Vec<DeadLetter> {
        let n = limit.unwrap_or(self.entries.len()).min(self.entries.len());
        self.entries.drain(..n).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn dropped(&self) -> u64 {
        self.dropped
    }
}
