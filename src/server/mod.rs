//! HTTP/1.1 server: accept loop, connection tracking and per-connection
//! exchange handling.
//!
//! # Data Flow
//! ```text
//! listener.rs   accept, bounded by max_connections
//!     → tracker.rs     count the connection for drain
//!     → connection.rs  reader/writer pair, one Exchange per request
//!         → decode.rs  request heads and body framing
//!         → chain      Deadline(Pipeline)
//!         → encode.rs  status line, headers, body framing
//! ```
//!
//! # Design Decisions
//! - The wire protocol is ours rather than hyper's so that `100 Continue`,
//!   pipelined ordering and body backpressure follow the exchange model
//! - Shutdown stops accepting, lets idle connections close and waits for
//!   busy ones up to the exchange timeout

pub mod connection;
pub mod decode;
pub mod encode;
pub mod listener;
pub mod tracker;

use std::sync::Arc;

use crate::chain::{ExecChain, Pipeline};
use crate::config::ServerConfig;
use crate::lifecycle::shutdown::triggered;
use crate::lifecycle::Shutdown;

pub use connection::{serve_connection, ConnectionSettings, Deadline};
pub use listener::{Listener, ListenerError};
pub use tracker::{ConnectionId, ConnectionTracker};

/// Serves one chain on a listener.
pub struct HttpServer {
    chain: Arc<dyn ExecChain>,
    settings: Arc<ConnectionSettings>,
    tracker: ConnectionTracker,
}

impl HttpServer {
    /// Wrap `pipeline` with the exchange deadline from `config`.
    pub fn new(config: &ServerConfig, pipeline: Pipeline) -> Self {
        let settings = ConnectionSettings::from_config(config);
        let chain: Arc<dyn ExecChain> = Arc::new(Deadline::new(
            Arc::new(pipeline),
            settings.exchange_timeout,
        ));
        Self {
            chain,
            settings: Arc::new(settings),
            tracker: ConnectionTracker::new(),
        }
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }

    /// Accept connections until `shutdown` fires, then drain.
    pub async fn run(&self, listener: Listener, shutdown: &Shutdown) -> Result<(), ListenerError> {
        let mut stop = shutdown.subscribe();
        let local = listener.local_addr().ok();
        tracing::info!(
            address = ?local,
            max_connections = listener.max_connections(),
            "HTTP server starting"
        );

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = triggered(&mut stop) => break,
            };
            let (stream, peer, permit) = match accepted {
                Ok(accepted) => accepted,
                Err(ListenerError::Accept(e)) => {
                    tracing::warn!(error = %e, "Accept failed");
                    continue;
                }
                Err(ListenerError::Closed) => break,
                Err(e) => return Err(e),
            };

            let guard = self.tracker.track();
            let chain = self.chain.clone();
            let settings = self.settings.clone();
            let connection_shutdown = shutdown.subscribe();
            let local = stream.local_addr().ok();
            tokio::spawn(async move {
                tracing::debug!(connection_id = %guard.id(), peer_addr = %peer, "Connection opened");
                serve_connection(stream, peer, local, chain, settings, connection_shutdown).await;
                drop(permit);
                drop(guard);
            });
        }

        listener.close();
        let active = self.tracker.active_count();
        tracing::info!(active_connections = active, "HTTP server draining");
        if !self.tracker.drain(self.settings.exchange_timeout).await {
            tracing::warn!(
                remaining = self.tracker.active_count(),
                "Connections still open after drain timeout"
            );
        }
        tracing::info!("HTTP server stopped");
        Ok(())
    }
}
