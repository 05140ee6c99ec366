//! Unbounded multi-producer, single-consumer queue.
//!
//! Producers never wait. The consumer side is shared rather than owned
//! because the consumer role moves between tasks: when a call acknowledges,
//! a new task takes over receiving while the old one finishes its call.
//! Callers keep at most one task receiving at a time.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

pub struct CallQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Notify,
}

impl<T> CallQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Notify::new(),
        }
    }

    /// Append an item and wake the consumer.
    pub fn send(&self, item: T) {
        self.items.lock().push_back(item);
        self.available.notify_one();
    }

    /// Pop the oldest item without waiting.
    pub fn try_recv(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Wait for the oldest item. Returns `None` once `cancel` fires, even if
    /// items remain; those are left for [`try_recv`](Self::try_recv).
    pub async fn recv(&self, cancel: &CancellationToken) -> Option<T> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            // Register interest before checking so a send in between is not missed.
            let available = self.available.notified();
            if let Some(item) = self.try_recv() {
                return Some(item);
            }
            tokio::select! {
                _ = available => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

impl<T> Default for CallQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
