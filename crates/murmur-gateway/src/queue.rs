//! Offline send queue: parks senders while the socket is down.

use std::collections::VecDeque;

use tokio::sync::{Mutex, oneshot};
use tracing::trace;

use crate::error::ShardError;

/// FIFO of parked senders with a front lane for high priority.
///
/// Waiters are never released on close; they persist across reconnect
/// attempts and are drained exactly once when the shard reaches
/// `Connected` through either `READY` or `RESUMED`.
#[derive(Default)]
pub struct OfflineQueue {
    waiting: Mutex<VecDeque<oneshot::Sender<Result<(), ShardError>>>>,
}

impl OfflineQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Park the caller until the next drain.
    ///
    /// High-priority callers are unshifted to the front, so among
    /// themselves they release in LIFO order, all ahead of the lows.
    ///
    /// # Errors
    ///
    /// [`ShardError::Shutdown`] when the queue is aborted while the
    /// caller is parked.
    pub async fn park(&self, high_priority: bool) -> Result<(), ShardError> {
        let rx = {
            let mut waiting = self.waiting.lock().await;
            let (tx, rx) = oneshot::channel();
            if high_priority {
                waiting.push_front(tx);
            } else {
                waiting.push_back(tx);
            }
            trace!(parked = waiting.len(), high_priority, "sender parked offline");
            rx
        };
        rx.await.unwrap_or(Err(ShardError::Shutdown))
    }

    /// Release every parked sender in queue order.
    pub async fn drain(&self) {
        let mut waiting = self.waiting.lock().await;
        if waiting.is_empty() {
            return;
        }
        trace!(released = waiting.len(), "draining offline queue");
        for tx in waiting.drain(..) {
            let _ = tx.send(Ok(()));
        }
    }

    /// Wake every parked sender with a cancellation outcome.
    pub async fn abort_all(&self) {
        let mut waiting = self.waiting.lock().await;
        for tx in waiting.drain(..) {
            let _ = tx.send(Err(ShardError::Shutdown));
        }
    }

    /// Number of parked senders.
    pub async fn len(&self) -> usize {
        self.waiting.lock().await.len()
    }

    /// Whether the queue is empty.
    pub async fn is_empty(&self) -> bool {
        self.waiting.lock().await.is_empty()
    }
}
