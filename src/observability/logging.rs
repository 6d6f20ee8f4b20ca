//! Structured logging.
//!
//! # Responsibilities
//! - Install the global `tracing` subscriber once at startup
//! - Honour `RUST_LOG`, falling back to the configured level
//!
//! # Design Decisions
//! - Request ids travel as span-free fields (`request_id = %id`) on events,
//!   so the plain fmt layer is enough

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Directive used when `level` does not parse as a filter.
const DEFAULT_DIRECTIVE: &str = "exchange_chain=info";

fn filter_for(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("exchange_chain={level}")))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE))
}

/// Install the subscriber. A second call is a no-op.
pub fn init_tracing(level: &str) {
    let installed = tracing_subscriber::registry()
        .with(filter_for(level))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init_tracing("debug");
        init_tracing("warn");
    }
}
