//! Bounded FIFO job queue with backpressure.
//!
//! Backed by a bounded `tokio::sync::mpsc` channel. The receiver sits behind
//! an async mutex so any number of workers can consume from it; items are
//! handed out in submission order.
//!
//! Closing drops the queue's sender and fires the `closed` token. Blocked
//! producers wake up with [`QueueError::Closed`] and release their sender
//! clones, after which consumers drain whatever is still buffered and then
//! observe `None`.

use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Job queue is closed")]
    Closed,
    #[error("Queue operation cancelled")]
    Cancelled,
}

pub struct JobQueue<T> {
    sender: StdMutex<Option<mpsc::Sender<T>>>,
    receiver: Mutex<mpsc::Receiver<T>>,
    closed: CancellationToken,
    len: AtomicUsize,
    capacity: usize,
}

impl<T: Send> JobQueue<T> {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            sender: StdMutex::new(Some(tx)),
            receiver: Mutex::new(rx),
            closed: CancellationToken::new(),
            len: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Add an item, waiting while the queue is full.
    ///
    /// Fails with `Closed` if the queue is (or becomes) closed, or `Cancelled`
    /// if `cancel` fires first. On failure the item is dropped and the queue
    /// is left unchanged.
    pub async fn enqueue(&self, item: T, cancel: &CancellationToken) -> Result<(), QueueError> {
        let sender = self.sender().ok_or(QueueError::Closed)?;

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(QueueError::Closed),
            _ = cancel.cancelled() => Err(QueueError::Cancelled),
            permit = sender.reserve() => match permit {
                Ok(permit) => {
                    self.len.fetch_add(1, Ordering::AcqRel);
                    permit.send(item);
                    Ok(())
                }
                Err(_) => Err(QueueError::Closed),
            },
        }
    }

    /// Take the next item, waiting while the queue is empty.
    ///
    /// Returns `Ok(None)` once the queue is closed and fully drained.
    pub async fn dequeue(&self, cancel: &CancellationToken) -> Result<Option<T>, QueueError> {
        let mut rx = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            guard = self.receiver.lock() => guard,
        };

        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(QueueError::Cancelled),
            item = rx.recv() => item,
        };

        if item.is_some() {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(item)
    }

    /// Remove everything still buffered.
    ///
    /// On a closed queue this also waits for producers that were mid-enqueue
    /// to finish, so nothing is left behind.
    pub async fn drain(&self) -> Vec<T> {
        let mut rx = self.receiver.lock().await;
        let mut items = Vec::new();

        if self.is_closed() {
            while let Some(item) = rx.recv().await {
                items.push(item);
            }
        } else {
            while let Ok(item) = rx.try_recv() {
                items.push(item);
            }
        }

        self.len.fetch_sub(items.len(), Ordering::AcqRel);
        items
    }

    /// Stop accepting items. Idempotent.
    pub fn close(&self) {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        self.closed.cancel();

        if sender.is_some() {
            tracing::info!(backlog = self.len(), "Job queue closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Current backlog. Approximate under concurrency.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn sender(&self) -> Option<mpsc::Sender<T>> {
        match self.sender.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}
