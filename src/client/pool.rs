//! Per-route and total concurrency limits for upstream requests.
//!
//! hyper-util pools the connections themselves; this pool caps how many
//! requests may hold one at a time. A permit is released when the response
//! body has been drained, not when headers arrive.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::PoolConfig;
use crate::error::{ChainError, ChainResult};
use crate::exchange::HttpHost;

/// A leased request slot, released on drop.
#[derive(Debug)]
pub struct PoolPermit {
    _route: OwnedSemaphorePermit,
    _total: OwnedSemaphorePermit,
}

#[derive(Debug)]
pub struct ConnectionPool {
    max_per_route: usize,
    max_total: usize,
    total: Arc<Semaphore>,
    routes: DashMap<String, Arc<Semaphore>>,
    acquire_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            max_per_route: config.max_per_route,
            max_total: config.max_total,
            total: Arc::new(Semaphore::new(config.max_total)),
            routes: DashMap::new(),
            acquire_timeout: Duration::from_secs(config.acquire_timeout_secs),
        }
    }

    fn route(&self, host: &HttpHost) -> Arc<Semaphore> {
        self.routes
            .entry(host.key())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_route)))
            .clone()
    }

    /// Wait for a slot for `host`; 504 if none frees up in time.
    pub async fn acquire(&self, host: &HttpHost) -> ChainResult<PoolPermit> {
        let route = self.route(host);
        let total = self.total.clone();
        let lease = async move {
            let route = route.acquire_owned().await?;
            let total = total.acquire_owned().await?;
            Ok::<_, tokio::sync::AcquireError>(PoolPermit {
                _route: route,
                _total: total,
            })
        };
        match tokio::time::timeout(self.acquire_timeout, lease).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(ChainError::ServiceUnavailable("connection pool closed".into())),
            Err(_) => {
                tracing::warn!(target_host = %host, "Connection pool exhausted");
                Err(ChainError::GatewayTimeout(format!(
                    "no connection to {} within {:?}",
                    host, self.acquire_timeout
                )))
            }
        }
    }

    /// Requests currently holding a slot.
    pub fn leased(&self) -> usize {
        self.max_total - self.total.available_permits()
    }

    pub fn leased_for(&self, host: &HttpHost) -> usize {
        self.routes
            .get(&host.key())
            .map(|s| self.max_per_route - s.available_permits())
            .unwrap_or(0)
    }

    /// Refuse new leases; waiting acquisitions fail.
    pub fn close(&self) {
        self.total.close();
        for route in self.routes.iter() {
            route.close();
        }
    }
}
