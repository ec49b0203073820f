//! Fan-out of events to long-lived subscribers.
//!
//! Delivery is best-effort: a subscriber whose queue is full or whose
//! receiving side is gone simply misses the event. Nothing is removed on a
//! failed delivery; a subscriber leaves the set when its [`Subscription`] is
//! dropped, which is what the transport does when the client disconnects.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tokio::sync::mpsc;

/// Per-subscriber queue depth.
const SUBSCRIBER_CAPACITY: usize = 64;

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub failed: usize,
}

struct Inner<E> {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<E>>>,
    next_id: AtomicU64,
}

impl<E> Inner<E> {
    fn remove(&self, id: u64) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }
}

pub struct Notifier<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for Notifier<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E: Clone + Send + 'static> Default for Notifier<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: Clone + Send + 'static> Notifier<E> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a subscriber. `snapshot` is queued ahead of any later broadcast.
    pub fn subscribe(&self, snapshot: E) -> Subscription<E> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let _ = tx.try_send(snapshot);
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        Subscription {
            id,
            rx,
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn broadcast(&self, event: E) -> Delivery {
        let subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut delivery = Delivery::default();
        for tx in subscribers.values() {
            match tx.try_send(event.clone()) {
                Ok(()) => delivery.delivered += 1,
                Err(_) => delivery.failed += 1,
            }
        }
        delivery
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription<E> {
    id: u64,
    rx: mpsc::Receiver<E>,
    inner: Weak<Inner<E>>,
}

impl<E> Subscription<E> {
    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            inner.remove(self.id);
        }
    }
}
