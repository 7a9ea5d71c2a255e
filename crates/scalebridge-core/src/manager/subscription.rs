//! Broadcast subscriptions handed out by the manager.

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::warn;

/// Capacity of each event stream. Slow subscribers skip the oldest events.
pub(crate) const SUBSCRIPTION_CAPACITY: usize = 64;

/// A handle on one event stream.
///
/// Dropping the handle (or calling [`Subscription::unsubscribe`]) detaches it;
/// other subscribers and the manager are unaffected.
#[derive(Debug)]
pub struct Subscription<T> {
    receiver: broadcast::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
    pub(crate) const fn new(receiver: broadcast::Receiver<T>) -> Self {
        Self { receiver }
    }

    /// Wait for the next event. Returns `None` once the manager has stopped.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.recv().await {
                Ok(value) => return Some(value),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscriber lagging, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.try_recv() {
                Ok(value) => return Some(value),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscriber lagging, events dropped");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }

    /// Detach from the stream.
    pub fn unsubscribe(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_each_subscriber_sees_every_event() {
        let (tx, _) = broadcast::channel(4);
        let mut first = Subscription::new(tx.subscribe());
        let mut second = Subscription::new(tx.subscribe());

        tx.send(1).unwrap();
        tx.send(2).unwrap();

        assert_eq!(first.recv().await, Some(1));
        assert_eq!(first.recv().await, Some(2));
        assert_eq!(second.try_recv(), Some(1));
    }

    #[tokio::test]
    async fn test_unsubscribe_leaves_others_attached() {
        let (tx, _) = broadcast::channel(4);
        let first = Subscription::new(tx.subscribe());
        let mut second = Subscription::new(tx.subscribe());

        first.unsubscribe();
        assert_eq!(tx.receiver_count(), 1);
        tx.send("event").unwrap();
        assert_eq!(second.recv().await, Some("event"));
    }

    #[tokio::test]
    async fn test_lagging_subscriber_skips_oldest() {
        let (tx, _) = broadcast::channel(2);
        let mut sub = Subscription::new(tx.subscribe());
        for n in 0..5 {
            tx.send(n).unwrap();
        }
        assert_eq!(sub.recv().await, Some(3));
        assert_eq!(sub.try_recv(), Some(4));
        assert_eq!(sub.try_recv(), None);
    }

    #[tokio::test]
    async fn test_closed_stream_returns_none() {
        let (tx, _) = broadcast::channel::<u8>(2);
        let mut sub = Subscription::new(tx.subscribe());
        drop(tx);
        assert_eq!(sub.recv().await, None);
    }
}
