//! Async FIFO queues for pending deposits and bundles
//!
//! Multi-writer/multi-reader, unbounded. Reads suspend until an item is
//! written; writes never block. Every queue is fed from the store's write
//! events, so each entry mirrors one non-terminal record in the store.

use async_channel::{Receiver, Sender, TryRecvError};
use tracing::warn;

/// Unbounded async FIFO
pub struct AsyncQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Clone for AsyncQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T> Default for AsyncQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> AsyncQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self { tx, rx }
    }

    /// Append an item
    pub fn push(&self, item: T) {
        // Both ends live in self, so the channel only closes on explicit close()
        if self.tx.try_send(item).is_err() {
            warn!("Dropped item pushed to a closed queue");
        }
    }

    /// Append several items in order
    pub fn extend(&self, items: impl IntoIterator<Item = T>) {
        for item in items {
            self.push(item);
        }
    }

    /// Take the oldest item, waiting until one is available
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn pop(&self) -> Option<T> {
        self.rx.recv().await.ok()
    }

    /// Take the oldest item without waiting
    pub fn try_pop(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// Number of items waiting to be read
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Close the queue, waking pending readers
    pub fn close(&self) {
        self.tx.close();
    }
}
