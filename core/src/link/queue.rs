// Outbound queue: unbounded FIFO with front re-insertion for retries

use crate::message::Envelope;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

/// Unbounded, thread-safe outbound queue with a single async consumer.
///
/// `push_back` and `push_front` never block and never fail. `pop` waits
/// indefinitely for an item and is cancel-safe: an item is only removed
/// once `pop` completes.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    items: Mutex<VecDeque<Envelope>>,
    available: Notify,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append in FIFO order
    pub fn push_back(&self, envelope: Envelope) {
        self.items.lock().push_back(envelope);
        self.available.notify_one();
    }

    /// Re-insert at the head so it is the next one out
    pub fn push_front(&self, envelope: Envelope) {
        self.items.lock().push_front(envelope);
        self.available.notify_one();
    }

    /// Wait for the head of the queue
    pub async fn pop(&self) -> Envelope {
        loop {
            let notified = self.available.notified();
            if let Some(envelope) = self.items.lock().pop_front() {
                return envelope;
            }
            notified.await;
        }
    }

    #[cfg(test)]
    fn try_pop(&self) -> Option<Envelope> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Ids currently queued, head first
    pub fn ids(&self) -> Vec<String> {
        self.items.lock().iter().map(|e| e.id().to_string()).collect()
    }
}
