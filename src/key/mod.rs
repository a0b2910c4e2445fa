//! Key edge ingress.
//!
//! Whatever watches the key (a GPIO interrupt, the terminal) pushes plain
//! [`KeyEdge`] records into a [`KeyEdgeQueue`]; the main loop drains it.

use core::cell::RefCell;

use critical_section::Mutex;
use heapless::Deque;

#[cfg(feature = "pi")]
pub mod gpio;
pub mod keyboard;

pub const KEY_QUEUE_CAPACITY: usize = 64;

/// A single transition of the key line
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyEdge {
    pub down: bool,
    pub timestamp_us: u64,
}

impl KeyEdge {
    pub fn down(timestamp_us: u64) -> Self {
        Self {
            down: true,
            timestamp_us,
        }
    }

    pub fn up(timestamp_us: u64) -> Self {
        Self {
            down: false,
            timestamp_us,
        }
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_us / 1000
    }
}

struct Inner {
    edges: Deque<KeyEdge, KEY_QUEUE_CAPACITY>,
    dropped: u32,
}

/// Fixed capacity FIFO between one producer and one consumer. Both ends only
/// touch it inside a critical section. When full the oldest edge is lost.
pub struct KeyEdgeQueue {
    inner: Mutex<RefCell<Inner>>,
}

impl KeyEdgeQueue {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Inner {
                edges: Deque::new(),
                dropped: 0,
            })),
        }
    }

    /// Never blocks. Safe to call from interrupt context.
    pub fn push(&self, edge: KeyEdge) {
        critical_section::with(|cs| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if inner.edges.is_full() {
                inner.edges.pop_front();
                inner.dropped = inner.dropped.wrapping_add(1);
            }
            // Cannot fail, a slot was just freed
            let _ = inner.edges.push_back(edge);
        });
    }

    pub fn pop(&self) -> Option<KeyEdge> {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).edges.pop_front())
    }

    pub fn len(&self) -> usize {
        critical_section::with(|cs| self.inner.borrow_ref(cs).edges.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Edges evicted because the consumer fell behind
    pub fn dropped(&self) -> u32 {
        critical_section::with(|cs| self.inner.borrow_ref(cs).dropped)
    }
}

impl Default for KeyEdgeQueue {
    fn default() -> Self {
        Self::new()
    }
}
