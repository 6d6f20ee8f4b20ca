//! OS signal handling.
//!
//! # Responsibilities
//! - Wait for Ctrl-C / SIGINT on a background task
//! - Translate it into a [`Shutdown`] trigger

use std::sync::Arc;

use super::Shutdown;

/// Trigger `shutdown` when the process is interrupted.
pub fn spawn_signal_handler(shutdown: Arc<Shutdown>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("Interrupt received, shutting down");
                shutdown.trigger();
            }
            Err(e) => tracing::warn!(error = %e, "Failed to listen for interrupt signal"),
        }
    })
}
