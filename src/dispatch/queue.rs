//! Bounded FIFO hand-off between the connection engine and workers.
//!
//! # Responsibilities
//! - Non-blocking enqueue that fails fast when full (backpressure)
//! - Suspending dequeue shared by many workers
//! - Close for enqueue on shutdown and wake every waiting worker
//!
//! # Design Decisions
//! - Built on a bounded `mpsc` channel; capacity is restored as soon as an
//!   entry is received
//! - The receiver sits behind an async mutex so many workers can wait in
//!   turn without losing or duplicating an entry

use std::time::Instant;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// A queued item with the moment it was accepted.
#[derive(Debug)]
pub struct Entry<T> {
    pub item: T,
    pub enqueued_at: Instant,
}

/// Enqueue failure. The rejected item is handed back so the caller can answer it.
#[derive(Debug, Error)]
pub enum QueueError<T> {
    #[error("request queue is full")]
    Full(T),

    #[error("request queue is closed")]
    Closed(T),
}

impl<T> QueueError<T> {
    pub fn into_inner(self) -> T {
        match self {
            QueueError::Full(item) | QueueError::Closed(item) => item,
        }
    }

    /// Metric label for the rejection.
    pub fn reason(&self) -> &'static str {
        match self {
            QueueError::Full(_) => "full",
            QueueError::Closed(_) => "closed",
        }
    }
}

/// Multi-producer, multi-consumer bounded FIFO.
#[derive(Debug)]
pub struct RequestQueue<T> {
    tx: mpsc::Sender<Entry<T>>,
    rx: Mutex<mpsc::Receiver<Entry<T>>>,
    closed: CancellationToken,
    capacity: usize,
}

impl<T> RequestQueue<T> {
    /// Create a queue holding at most `capacity` outstanding entries.
    ///
    /// `capacity` must be non-zero; the server validates this through
    /// `max_connections`.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Mutex::new(rx),
            closed: CancellationToken::new(),
            capacity,
        }
    }

    /// Add an item without waiting.
    pub fn enqueue(&self, item: T) -> Result<(), QueueError<T>> {
        if self.closed.is_cancelled() {
            return Err(QueueError::Closed(item));
        }
        let entry = Entry {
            item,
            enqueued_at: Instant::now(),
        };
        self.tx.try_send(entry).map_err(|err| match err {
            mpsc::error::TrySendError::Full(entry) => QueueError::Full(entry.item),
            mpsc::error::TrySendError::Closed(entry) => QueueError::Closed(entry.item),
        })
    }

    /// Wait for the next item. `None` means the queue was closed.
    pub async fn dequeue(&self) -> Option<T> {
        let entry = self.dequeue_entry().await?;
        tracing::trace!(
            waited_us = entry.enqueued_at.elapsed().as_micros() as u64,
            "Dequeued request"
        );
        Some(entry.item)
    }

    /// Like [`dequeue`](Self::dequeue) but keeps the enqueue timestamp.
    pub async fn dequeue_entry(&self) -> Option<Entry<T>> {
        let mut rx = tokio::select! {
            rx = self.rx.lock() => rx,
            _ = self.closed.cancelled() => return None,
        };
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            entry = rx.recv() => entry,
        }
    }

    /// Refuse further enqueues and release every waiting consumer.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Take every item still waiting. Intended for use after [`close`](Self::close).
    pub async fn drain(&self) -> Vec<T> {
        let mut rx = self.rx.lock().await;
        let mut items = Vec::new();
        while let Ok(entry) = rx.try_recv() {
            items.push(entry.item);
        }
        items
    }

    /// Number of items waiting.
    pub fn len(&self) -> usize {
        self.capacity - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most entries that can wait at once.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
