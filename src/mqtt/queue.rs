//! Bounded in-memory publish queue feeding the MQTT publisher task.
//!
//! Unlike a plain channel this queue supports the two operations the
//! pipeline needs beyond push/pop: dropping the oldest entry when saturated
//! (the caller spools the casualty) and re-inserting at the head when a
//! publish fails mid-flight.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use super::messages::QueuedPublish;

/// FIFO of publish envelopes with a hard capacity.
#[derive(Debug)]
pub struct PublishQueue {
    limit: usize,
    inner: Mutex<VecDeque<QueuedPublish>>,
    notify: Notify,
}

impl PublishQueue {
    /// Create a queue holding at most `limit` envelopes (0 = unbounded).
    pub fn new(limit: usize) -> Self {
        Self { limit, inner: Mutex::new(VecDeque::new()), notify: Notify::new() }
    }

    /// Configured capacity.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Queued envelope count.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("publish queue lock poisoned").len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append at the tail. When saturated, the oldest envelope is evicted
    /// and returned so the caller can spool it.
    pub fn push(&self, message: QueuedPublish) -> Option<QueuedPublish> {
        let dropped = {
            let mut queue = self.inner.lock().expect("publish queue lock poisoned");
            let dropped = if self.limit > 0 && queue.len() >= self.limit {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(message);
            dropped
        };
        self.notify.notify_one();
        dropped
    }

    /// Re-insert at the head (failed delivery). Never evicts.
    pub fn push_front(&self, message: QueuedPublish) {
        self.inner.lock().expect("publish queue lock poisoned").push_front(message);
        self.notify.notify_one();
    }

    /// Pop the oldest envelope without waiting.
    pub fn try_pop(&self) -> Option<QueuedPublish> {
        self.inner.lock().expect("publish queue lock poisoned").pop_front()
    }

    /// Pop the oldest envelope, waiting until one is available.
    pub async fn pop(&self) -> QueuedPublish {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.try_pop() {
                return message;
            }
            notified.await;
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
