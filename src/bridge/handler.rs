//! The synchronous handler contract and what a worker thread sees.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use axum::body::Body;
use axum::http::{request::Parts, Request, Response};
use uuid::Uuid;

use crate::chain::dispatch::{ResourceState, UnitOfWorkHandle};
use crate::error::ChainResult;
use crate::exchange::{HttpHost, PipeSource, RequestContext};

/// Cooperative interrupt flag for a blocking unit of work.
#[derive(Debug, Clone, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Snapshot of the request context handed to a worker thread.
#[derive(Debug, Clone)]
pub struct BlockingContext {
    pub request_id: Uuid,
    pub client_addr: Option<SocketAddr>,
    pub received_at: SystemTime,
    pub scheme: String,
    pub resource: Option<ResourceState>,
    pub unit_of_work: Option<UnitOfWorkHandle>,
    pub interrupt: Interrupt,
}

impl BlockingContext {
    pub fn from_context(ctx: &RequestContext) -> Self {
        Self {
            request_id: ctx.request_id,
            client_addr: ctx.client_addr,
            received_at: ctx.received_at,
            scheme: ctx.scheme.clone(),
            resource: ctx.resource().cloned(),
            unit_of_work: ctx.unit_of_work.clone(),
            interrupt: Interrupt::new(),
        }
    }
}

/// A handler that may block the calling thread.
///
/// The request body is a [`PipeSource`]; reading it with `std::io::Read`
/// parks the worker until the transport delivers more bytes. Reads fail
/// with `Interrupted` once the exchange is cancelled.
pub trait BlockingHandler: Send + Sync + 'static {
    fn execute(
        &self,
        target: &HttpHost,
        request: Request<PipeSource>,
        ctx: &BlockingContext,
    ) -> ChainResult<Response<Body>>;

    /// Describe the addressed resource. Runs on the async side, so it must
    /// not block.
    fn resolve(&self, _target: &HttpHost, _parts: &Parts) -> ChainResult<Option<ResourceState>> {
        Ok(None)
    }
}
