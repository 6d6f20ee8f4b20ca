//! Per-connection queue of in-flight exchanges.
//!
//! Pipelined requests are answered in arrival order: the writer only ever
//! attaches to the head of the queue. Exchanges leave the queue when they
//! complete or are cancelled.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use uuid::Uuid;

use crate::exchange::Exchange;

#[derive(Default)]
struct QueueState {
    items: VecDeque<Arc<Exchange>>,
    closed: bool,
}

/// Ordered collection of exchanges awaiting responses.
#[derive(Default)]
pub struct PendingExchanges {
    state: Mutex<QueueState>,
    changed: Notify,
}

impl PendingExchanges {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append an exchange. Returns false once the queue is closed.
    pub fn push(self: &Arc<Self>, exchange: Arc<Exchange>) -> bool {
        {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            exchange.set_queue(Arc::downgrade(self));
            state.items.push_back(exchange);
        }
        self.changed.notify_one();
        true
    }

    /// Remove an exchange by id.
    pub fn remove(&self, id: Uuid) -> Option<Arc<Exchange>> {
        let removed = {
            let mut state = self.lock();
            let pos = state.items.iter().position(|e| e.id() == id)?;
            state.items.remove(pos)
        };
        self.changed.notify_one();
        removed
    }

    /// Current head without removing it.
    pub fn front(&self) -> Option<Arc<Exchange>> {
        self.lock().items.front().cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Wait for a head exchange. `None` once the queue is closed and empty.
    pub async fn next(&self) -> Option<Arc<Exchange>> {
        loop {
            {
                let state = self.lock();
                if let Some(front) = state.items.front() {
                    return Some(front.clone());
                }
                if state.closed {
                    return None;
                }
            }
            self.changed.notified().await;
        }
    }

    /// Refuse further exchanges. Those already queued stay until they finish.
    pub fn close(&self) {
        self.lock().closed = true;
        self.changed.notify_one();
    }

    /// Cancel every queued exchange.
    pub fn cancel_all(&self) -> usize {
        let items: Vec<_> = self.lock().items.iter().cloned().collect();
        let count = items.len();
        for exchange in items {
            exchange.cancel();
        }
        count
    }
}
