//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGINT / Ctrl-C → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     trigger → accept loop stops → idle connections close
//!             → busy connections drain → connection manager shuts down
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop accept, drain, close upstream resources
//! - Drain has a deadline: remaining connections are abandoned after it

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::spawn_signal_handler;
