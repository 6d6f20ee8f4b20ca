//! Exchange subsystem: the unit pairing one request with one response.
//!
//! # Data Flow
//! ```text
//! transport reads head
//!     → Exchange::new (state: ReadingRequest)
//!     → PendingExchanges::push (arrival order)
//!     → request body bytes → Pipe::sink ──► PipeSource read by the chain
//!     → chain completes → Exchange::submit_response
//!     → writer attaches to queue head → ResponseSink → socket
//! ```
//!
//! # Design Decisions
//! - Request bodies flow through a bounded [`Pipe`]; a full pipe suspends the
//!   socket reader until the consumer drains
//! - Per-request data lives in a typed [`RequestContext`], never in the chain

#[allow(clippy::module_inception)]
pub mod exchange;
pub mod context;
pub mod pipe;
pub mod queue;

pub use context::{HttpHost, RawHead, RequestContext};
pub use exchange::{Exchange, ExchangeState, ResponseSink};
pub use pipe::{Pipe, PipeSource};
pub use queue::PendingExchanges;
