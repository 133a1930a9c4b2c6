//! A bounded multi-producer multi-consumer work queue.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

/// Bounded queue drained by many workers. Cloning shares the queue.
#[derive(Debug)]
pub struct SharedQueue<T> {
    tx: mpsc::Sender<T>,
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for SharedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: Arc::clone(&self.rx),
        }
    }
}

/// Why a non-blocking push failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// The queue is at capacity.
    Full,
    /// Every receiver is gone.
    Closed,
}

impl<T: Send> SharedQueue<T> {
    /// Creates a queue holding at most `capacity` items (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Enqueues without waiting. The item is handed back on failure.
    pub fn try_push(&self, item: T) -> Result<(), (PushError, T)> {
        self.tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(item) => (PushError::Full, item),
            mpsc::error::TrySendError::Closed(item) => (PushError::Closed, item),
        })
    }

    /// Enqueues, waiting for room. Returns false if the queue is closed.
    pub async fn push(&self, item: T) -> bool {
        self.tx.send(item).await.is_ok()
    }

    /// Takes the next item, waiting until one is available.
    ///
    /// Cancel-safe: dropping the future never loses an item.
    pub async fn pop(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }

    /// Takes an item if one is ready.
    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }

    /// Items currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// True if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn items_are_shared_between_consumers() {
        let queue = SharedQueue::new(4);
        let consumer = queue.clone();
        assert!(queue.push(1u32).await);
        assert!(queue.push(2u32).await);
        assert_eq!(queue.len(), 2);
        assert_eq!(consumer.pop().await, Some(1));
        assert_eq!(queue.pop().await, Some(2));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn try_push_reports_full() {
        let queue = SharedQueue::new(1);
        assert!(queue.try_push("a").is_ok());
        let Err((reason, item)) = queue.try_push("b") else {
            panic!("second push should fail");
        };
        assert_eq!(reason, PushError::Full);
        assert_eq!(item, "b");
        assert_eq!(queue.try_pop(), Some("a"));
        assert_eq!(queue.try_pop(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_pop_keeps_later_items() {
        let queue: SharedQueue<u8> = SharedQueue::new(2);
        let waited = tokio::time::timeout(Duration::from_millis(10), queue.pop()).await;
        assert!(waited.is_err());
        assert!(queue.push(5).await);
        assert_eq!(queue.pop().await, Some(5));
    }
}
