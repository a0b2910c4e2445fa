use std::collections::VecDeque;

use log::debug;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuedLine {
    pub line: String,
    pub enqueued_at: u64,
}

/// Bounded FIFO of lines waiting for a connected socket. When full the
/// oldest line is evicted to admit the new one.
#[derive(Debug)]
pub struct OutgoingQueue {
    lines: VecDeque<QueuedLine>,
    capacity: usize,
    dropped: u32,
    sent: u32,
}

impl OutgoingQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
            sent: 0,
        }
    }

    pub fn push(&mut self, line: String, now: u64) {
        if self.lines.len() >= self.capacity {
            if let Some(evicted) = self.lines.pop_front() {
                self.dropped = self.dropped.wrapping_add(1);
                debug!(
                    "transport: queue full, dropped {:?} ({} dropped so far)",
                    evicted.line, self.dropped
                );
            }
        }
        self.lines.push_back(QueuedLine {
            line,
            enqueued_at: now,
        });
    }

    pub fn front(&self) -> Option<&QueuedLine> {
        self.lines.front()
    }

    /// Remove the front line once it has been handed to the socket
    pub fn pop_sent(&mut self) -> Option<QueuedLine> {
        let line = self.lines.pop_front()?;
        self.sent = self.sent.wrapping_add(1);
        Some(line)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    pub fn sent(&self) -> u32 {
        self.sent
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedLine> {
        self.lines.iter()
    }
}
