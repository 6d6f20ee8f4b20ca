//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! server, chain, cache, auth, bridge
//!     → logging.rs (structured events with request_id / peer_addr fields)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → stdout (fmt layer)
//!     → Prometheus scrape endpoint (when enabled)
//! ```
//!
//! # Design Decisions
//! - Request ID flows through every log event of an exchange
//! - Metrics are cheap (atomic increments) and no-ops without a recorder

pub mod logging;
pub mod metrics;

pub use logging::init_tracing;
