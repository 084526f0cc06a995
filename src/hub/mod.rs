//! Lossy publish-subscribe fan-out.
//!
//! A [`Hub`] connects one producer to any number of subscribers without ever
//! blocking the producer. Each subscriber has a bounded view of the stream:
//! if it falls behind, the oldest undelivered messages are dropped and
//! delivery resumes in order with a gap. Subscribers that keep up see every
//! message in publish order.

use std::sync::Mutex;
use tokio::sync::broadcast;

/// Single-producer, multi-subscriber message hub.
pub struct Hub<M> {
    sender: Mutex<Option<broadcast::Sender<M>>>,
}

impl<M: Clone> Hub<M> {
    /// Create a hub whose subscribers each buffer up to `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Deliver a message to every current subscriber. Never blocks; messages
    /// published to a closed hub (or one with no subscribers) are dropped.
    pub fn publish(&self, message: M) {
        if let Some(sender) = self.sender.lock().unwrap().as_ref() {
            let _ = sender.send(message);
        }
    }

    /// Register a new subscriber. Subscribing to a closed hub returns an
    /// already-terminal subscription.
    pub fn subscribe(&self) -> Subscription<M> {
        let receiver = self
            .sender
            .lock()
            .unwrap()
            .as_ref()
            .map(|sender| sender.subscribe());
        Subscription { receiver }
    }

    /// Mark the hub terminal. Subscribers drain whatever is buffered, then
    /// their `next()` returns `None`.
    pub fn close(&self) {
        self.sender.lock().unwrap().take();
    }
}

/// A subscriber's handle onto a hub's message stream.
pub struct Subscription<M> {
    receiver: Option<broadcast::Receiver<M>>,
}

impl<M: Clone> Subscription<M> {
    /// Wait for the next message. Returns `None` once the hub is closed and
    /// drained, or after `cancel()`. Messages missed while lagging are
    /// skipped; the remaining stream stays in publish order.
    pub async fn next(&mut self) -> Option<M> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }

    /// Stop receiving. All further `next()` calls return `None`.
    pub fn cancel(&mut self) {
        self.receiver = None;
    }
}
