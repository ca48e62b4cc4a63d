//! Typed publish/subscribe for component events.
//!
//! Every component owns one [`EventBus`] over its own event enum, so each
//! event name maps to exactly one payload shape. Subscribing returns a
//! [`Subscription`]; dropping it (or calling
//! [`unsubscribe`](Subscription::unsubscribe)) detaches the listener.
//!
//! Subscriptions ride a tokio broadcast channel: emitting is O(1) regardless
//! of the number of subscribers, and a subscriber that falls more than
//! `capacity` events behind skips the oldest ones instead of blocking the
//! emitter. They are for observers.
//!
//! The component that drives the next stage claims the bus's single lossless
//! feed with [`take_event_rx`](EventBus::take_event_rx) instead, an unbounded
//! mpsc channel that sees every event in emit order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::mpsc;

const DEFAULT_CAPACITY: usize = 256;

/// A typed fan-out channel for one component's events.
#[derive(Debug)]
pub struct EventBus<E> {
    sender: broadcast::Sender<E>,
    feed: Arc<Mutex<Feed<E>>>,
    emitted: Arc<AtomicU64>,
}

#[derive(Debug)]
enum Feed<E> {
    Unclaimed,
    Claimed(mpsc::UnboundedSender<E>),
    /// Receiver dropped; never reopened.
    Closed,
}

impl<E: Clone> EventBus<E> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            feed: Arc::new(Mutex::new(Feed::Unclaimed)),
            emitted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event to the feed and every live subscriber. Returns how
    /// many subscribers received it.
    pub fn emit(&self, event: E) -> usize {
        self.emitted.fetch_add(1, Ordering::Relaxed);
        {
            let mut feed = self.feed.lock();
            if let Feed::Claimed(tx) = &*feed {
                if tx.send(event.clone()).is_err() {
                    *feed = Feed::Closed;
                }
            }
        }
        self.sender.send(event).unwrap_or(0)
    }

    /// Claim the lossless feed. Events emitted before the claim are not
    /// replayed. Returns `None` once claimed.
    pub fn take_event_rx(&self) -> Option<mpsc::UnboundedReceiver<E>> {
        let mut feed = self.feed.lock();
        if !matches!(*feed, Feed::Unclaimed) {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *feed = Feed::Claimed(tx);
        Some(rx)
    }

    pub fn subscribe(&self) -> Subscription<E> {
        Subscription {
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Total events emitted since creation, delivered or not.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            feed: self.feed.clone(),
            emitted: self.emitted.clone(),
        }
    }
}

/// A live subscription handle. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription<E> {
    receiver: broadcast::Receiver<E>,
}

impl<E: Clone> Subscription<E> {
    /// Wait for the next event. `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<E> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("event subscriber lagged, skipped {skipped} events");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next already-emitted event without waiting.
    pub fn try_recv(&mut self) -> Option<E> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drain every event emitted so far.
    pub fn drain(&mut self) -> Vec<E> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    pub fn unsubscribe(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    enum Ping {
        A(u32),
        B,
    }

    #[test]
    fn test_emit_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut s1 = bus.subscribe();
        let mut s2 = bus.subscribe();

        assert_eq!(bus.emit(Ping::A(1)), 2);
        assert_eq!(s1.try_recv(), Some(Ping::A(1)));
        assert_eq!(s2.try_recv(), Some(Ping::A(1)));
        assert_eq!(s1.try_recv(), None);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus: EventBus<Ping> = EventBus::new();
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        sub.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.emit(Ping::B), 0);
        assert_eq!(bus.emitted(), 1);
    }

    #[test]
    fn test_lagging_subscriber_skips_oldest() {
        let bus = EventBus::with_capacity(2);
        let mut sub = bus.subscribe();
        for i in 0..5 {
            bus.emit(Ping::A(i));
        }
        assert_eq!(sub.drain(), vec![Ping::A(3), Ping::A(4)]);
    }

    #[test]
    fn test_feed_keeps_every_event_past_capacity() {
        let bus = EventBus::with_capacity(2);
        let mut feed = bus.take_event_rx().unwrap();
        assert!(bus.take_event_rx().is_none());
        for i in 0..500 {
            bus.emit(Ping::A(i));
        }

        let received: Vec<Ping> = std::iter::from_fn(|| feed.try_recv().ok()).collect();
        assert_eq!(received, (0..500).map(Ping::A).collect::<Vec<_>>());
    }

    #[test]
    fn test_dropped_feed_closes_for_good() {
        let bus = EventBus::new();
        drop(bus.take_event_rx());
        bus.emit(Ping::B);
        assert!(bus.take_event_rx().is_none());
        assert_eq!(bus.emitted(), 1);
    }

    #[tokio::test]
    async fn test_async_recv() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe();
        let emitter = bus.clone();
        tokio::spawn(async move {
            emitter.emit(Ping::B);
        });
        assert_eq!(sub.recv().await, Some(Ping::B));
    }
}
