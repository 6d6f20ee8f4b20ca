//! Blocking-to-async bridge.
//!
//! # Responsibilities
//! - Run synchronous handlers on worker threads without stalling the runtime
//! - Bound concurrent blocking work; excess work is rejected, not queued
//! - Report through the same callback contract as async chains
//! - Forward cancellation to the blocking unit as an interrupt
//!
//! # Design Decisions
//! - Rejection is a cancellation, never an error
//! - The request body reaches the worker through a bounded pipe, so a slow
//!   handler applies backpressure to the socket

pub mod dispatch;
pub mod executor;
pub mod handler;

pub use dispatch::BlockingDispatch;
pub use executor::BlockingBridge;
pub use handler::{BlockingContext, BlockingHandler, Interrupt};
