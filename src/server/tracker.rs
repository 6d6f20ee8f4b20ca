//! Connection identity and live-connection tracking for graceful drain.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::observability::metrics;

/// Relaxed is enough: ids only need to be unique.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Counts open connections; the count is published on a watch channel so
/// shutdown can wait for it to reach zero.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    count: Arc<watch::Sender<usize>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            count: Arc::new(tx),
        }
    }

    /// Register a connection. The returned guard unregisters it on drop.
    pub fn track(&self) -> ConnectionGuard {
        let mut active = 0;
        self.count.send_modify(|n| {
            *n += 1;
            active = *n;
        });
        metrics::set_active_connections(active);
        ConnectionGuard {
            count: self.count.clone(),
            id: ConnectionId::next(),
        }
    }

    pub fn active_count(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until every tracked connection closed. False on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let mut rx = self.count.subscribe();
        let drained = tokio::time::timeout(timeout, rx.wait_for(|n| *n == 0))
            .await
            .is_ok_and(|r| r.is_ok());
        drained
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Held for a connection's lifetime.
#[derive(Debug)]
pub struct ConnectionGuard {
    count: Arc<watch::Sender<usize>>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let mut active = 0;
        self.count.send_modify(|n| {
            *n = n.saturating_sub(1);
            active = *n;
        });
        metrics::set_active_connections(active);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}
