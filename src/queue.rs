//! Bounded outgoing-message queue shared between application threads and
//! the I/O thread.
//!
//! Producers push under a mutex and signal the I/O thread through a
//! [`Notify`]; the I/O thread drains the whole queue on each wakeup, so
//! bursts coalesce into one flush. Capacity is fixed; overflow fails the
//! submission instead of dropping or blocking. A Close item is terminal:
//! nothing may be enqueued after it.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;

use crate::config::SEND_QUEUE_CAPACITY;
use crate::error::{Error, Result};

/// One queued outgoing item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Outgoing {
    /// A text message.
    Text(String),
    /// A binary message.
    Binary(Vec<u8>),
    /// A close request; always the last item the queue accepts.
    Close {
        /// Close status code to send.
        code: u16,
        /// Close reason to send.
        reason: String,
    },
}

struct Inner {
    items: VecDeque<Outgoing>,
    close_requested: bool,
}

/// Bounded FIFO with a wakeup signal for the I/O thread.
pub(crate) struct SendQueue {
    inner: Mutex<Inner>,
    wakeup: Notify,
    capacity: usize,
}

impl SendQueue {
    pub(crate) fn new() -> Self {
        Self::with_capacity(SEND_QUEUE_CAPACITY)
    }

    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                close_requested: false,
            }),
            wakeup: Notify::new(),
            capacity,
        }
    }

    /// Enqueue an item and wake the I/O thread.
    ///
    /// # Errors
    ///
    /// - [`Error::NotConnected`] once a Close has been enqueued; later
    ///   submissions are rejected, never silently dropped.
    /// - [`Error::SendQueueFull`] when the queue is at capacity; the queue
    ///   is left untouched.
    pub(crate) fn push(&self, item: Outgoing) -> Result<()> {
        let mut inner = self.lock();
        if inner.close_requested {
            return Err(Error::NotConnected);
        }
        if inner.items.len() >= self.capacity {
            return Err(Error::SendQueueFull {
                capacity: self.capacity,
            });
        }
        if matches!(item, Outgoing::Close { .. }) {
            inner.close_requested = true;
        }
        inner.items.push_back(item);
        drop(inner);

        self.wakeup.notify_one();
        Ok(())
    }

    /// Take every queued item in submission order.
    pub(crate) fn drain(&self) -> Vec<Outgoing> {
        self.lock().items.drain(..).collect()
    }

    /// Whether a Close item has been accepted.
    pub(crate) fn close_requested(&self) -> bool {
        self.lock().close_requested
    }

    /// Wait until a producer signals new items. A signal that arrived before
    /// the call is not lost.
    pub(crate) async fn notified(&self) {
        self.wakeup.notified().await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
