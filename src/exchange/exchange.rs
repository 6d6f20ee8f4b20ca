//! One request paired with its eventual response.
//!
//! # Responsibilities
//! - Track the exchange state machine
//! - Deliver interim (100) and final responses to the transport exactly once
//! - Drain any response body that loses a submission race
//! - Cancel: fail the request body pipe, abort the running chain, leave the queue
//!
//! # States
//! ```text
//! ReadingRequest ─► PendingContinuation ─► PendingResponse ─► Responding ─► Completed
//!        │                  │                     │                │
//!        └──────────────────┴──────── Cancelled ◄─┴────────────────┘
//! ```
//! `PendingContinuation` is entered only for `Expect: 100-continue` requests.
//!
//! # Design Decisions
//! - A single mutex guards all mutable fields; sinks are non-blocking so they
//!   are invoked inside the critical section, which keeps interim and final
//!   delivery ordered.
//! - Waiting for the response never blocks a runtime thread: waiters use a
//!   `watch` channel.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use axum::body::Body;
use axum::http::{Method, Response, StatusCode, Uri};
use tokio::sync::watch;
use uuid::Uuid;

use crate::chain::body::drain_body;
use crate::chain::callback::Cancellable;
use crate::exchange::pipe::Pipe;
use crate::exchange::queue::PendingExchanges;

/// Lifecycle state of an [`Exchange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Head parsed, exchange not yet handed to the chain.
    ReadingRequest,
    /// Waiting for the chain to ask for the body before sending `100 Continue`.
    PendingContinuation,
    /// Chain running, no response delivered yet.
    PendingResponse,
    /// Final response handed to the transport; body being written.
    Responding,
    /// Response fully written.
    Completed,
    /// Terminated early.
    Cancelled,
}

impl ExchangeState {
    /// True for `Completed` and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(self, ExchangeState::Completed | ExchangeState::Cancelled)
    }
}

/// Transport-side channel that writes responses for one exchange.
///
/// Implementations must not block: they are called with the exchange lock held.
pub trait ResponseSink: Send {
    /// Write an interim 1xx head.
    fn send_interim(&mut self, status: StatusCode);

    /// Write the final response. `close` asks the transport to close the
    /// connection after the body.
    fn send_response(&mut self, response: Response<Body>, close: bool);

    /// The exchange was cancelled; nothing more will be sent.
    fn cancelled(&mut self) {}
}

struct Inner {
    state: ExchangeState,
    expect_continue: bool,
    continuation_pending: bool,
    continuation_sent: bool,
    response: Option<Response<Body>>,
    delivered: bool,
    close_after: bool,
    sink: Option<Box<dyn ResponseSink>>,
    request_body: Option<Pipe>,
    task: Option<Cancellable>,
    queue: Option<Weak<PendingExchanges>>,
}

/// Request/response pairing tracked by a connection.
pub struct Exchange {
    id: Uuid,
    method: Method,
    uri: Uri,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<ExchangeState>,
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("uri", &self.uri)
            .field("state", &self.state())
            .finish()
    }
}

impl Exchange {
    /// Create an exchange for a parsed request head.
    pub fn new(id: Uuid, method: Method, uri: Uri, expect_continue: bool) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ExchangeState::ReadingRequest);
        Arc::new(Self {
            id,
            method,
            uri,
            inner: Mutex::new(Inner {
                state: ExchangeState::ReadingRequest,
                expect_continue,
                continuation_pending: false,
                continuation_sent: false,
                response: None,
                delivered: false,
                close_after: false,
                sink: None,
                request_body: None,
                task: None,
                queue: None,
            }),
            state_tx,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn state(&self) -> ExchangeState {
        self.lock().state
    }

    /// Whether the connection must close after this exchange.
    pub fn close_after(&self) -> bool {
        self.lock().close_after
    }

    /// Ask the transport to close the connection after this exchange.
    pub fn set_close_after(&self) {
        self.lock().close_after = true;
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, inner: &mut Inner, next: ExchangeState) {
        if inner.state != next {
            tracing::trace!(exchange_id = %self.id, from = ?inner.state, to = ?next, "Exchange state");
            inner.state = next;
            self.state_tx.send_replace(next);
        }
    }

    /// Attach the pipe feeding the request body.
    pub fn set_request_body(&self, pipe: Pipe) {
        let mut inner = self.lock();
        if inner.state == ExchangeState::Cancelled {
            pipe.fail(cancelled_error());
        }
        inner.request_body = Some(pipe);
    }

    /// Record the task running the chain so cancellation can abort it.
    pub fn set_task(&self, task: Cancellable) {
        let mut inner = self.lock();
        if inner.state == ExchangeState::Cancelled {
            drop(inner);
            task.cancel();
            return;
        }
        inner.task = Some(task);
    }

    pub(crate) fn set_queue(&self, queue: Weak<PendingExchanges>) {
        self.lock().queue = Some(queue);
    }

    /// The head is complete and the request is handed to the chain.
    pub fn request_received(&self) {
        let mut inner = self.lock();
        if inner.state != ExchangeState::ReadingRequest {
            return;
        }
        let next = if inner.expect_continue && inner.response.is_none() {
            ExchangeState::PendingContinuation
        } else {
            ExchangeState::PendingResponse
        };
        self.transition(&mut inner, next);
    }

    /// Record a `100 Continue`; sent at once if a sink is attached.
    ///
    /// Returns false when no continuation is appropriate any more: a final
    /// response was already submitted, one was already sent, or the
    /// exchange is terminal.
    pub fn submit_continue(&self) -> bool {
        let mut inner = self.lock();
        if inner.state.is_terminal()
            || inner.response.is_some()
            || inner.delivered
            || inner.continuation_sent
        {
            return false;
        }
        inner.continuation_pending = true;
        if inner.sink.is_some() {
            self.deliver_continue(&mut inner);
        }
        true
    }

    fn deliver_continue(&self, inner: &mut Inner) {
        if let Some(sink) = inner.sink.as_mut() {
            sink.send_interim(StatusCode::CONTINUE);
            inner.continuation_pending = false;
            inner.continuation_sent = true;
            tracing::debug!(exchange_id = %self.id, "100 Continue sent");
            if inner.state == ExchangeState::PendingContinuation {
                self.transition(inner, ExchangeState::PendingResponse);
            }
        }
    }

    /// Bind the transport's response channel.
    ///
    /// Delivers a final response that is already set, otherwise a pending
    /// continuation.
    pub fn attach(&self, mut sink: Box<dyn ResponseSink>) {
        let mut inner = self.lock();
        if inner.state == ExchangeState::Cancelled {
            sink.cancelled();
            return;
        }
        inner.sink = Some(sink);
        if inner.response.is_some() {
            self.deliver_response(&mut inner);
        } else if inner.continuation_pending {
            self.deliver_continue(&mut inner);
        }
    }

    /// Set the final response.
    ///
    /// Returns true if this response will reach the transport. A response
    /// that arrives after another was delivered, or after the exchange
    /// terminated, is drained and dropped. A response replacing one that was
    /// set but not yet delivered wins, and the replaced body is drained.
    pub fn submit_response(&self, response: Response<Body>) -> bool {
        let mut inner = self.lock();
        if inner.state.is_terminal() || inner.delivered {
            drop(inner);
            tracing::debug!(exchange_id = %self.id, "Discarding late response");
            drain_body(response.into_body());
            return false;
        }

        if inner.expect_continue && !inner.continuation_sent {
            // Body was never solicited; the client may still send it.
            inner.continuation_pending = false;
            inner.close_after = true;
        }

        if let Some(previous) = inner.response.replace(response) {
            drain_body(previous.into_body());
        }
        if inner.sink.is_some() {
            self.deliver_response(&mut inner);
        } else if inner.state != ExchangeState::PendingResponse {
            self.transition(&mut inner, ExchangeState::PendingResponse);
        }
        true
    }

    fn deliver_response(&self, inner: &mut Inner) {
        let Some(response) = inner.response.take() else {
            return;
        };
        let close = inner.close_after;
        if let Some(sink) = inner.sink.as_mut() {
            sink.send_response(response, close);
            inner.delivered = true;
            self.transition(inner, ExchangeState::Responding);
        } else {
            inner.response = Some(response);
        }
    }

    /// The response body was fully written.
    pub fn complete(&self) {
        let queue = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return;
            }
            self.transition(&mut inner, ExchangeState::Completed);
            inner.sink = None;
            inner.task = None;
            inner.queue.take()
        };
        if let Some(queue) = queue.and_then(|q| q.upgrade()) {
            queue.remove(self.id);
        }
    }

    /// Cancel the exchange. Idempotent.
    ///
    /// Returns true if the cancellation preempted a response that was
    /// already being written.
    pub fn cancel(&self) -> bool {
        let (preempted, pipe, response, task, sink, queue) = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return false;
            }
            let preempted = inner.state == ExchangeState::Responding;
            self.transition(&mut inner, ExchangeState::Cancelled);
            inner.continuation_pending = false;
            (
                preempted,
                inner.request_body.take(),
                inner.response.take(),
                inner.task.take(),
                inner.sink.take(),
                inner.queue.take(),
            )
        };

        tracing::debug!(exchange_id = %self.id, preempted, "Exchange cancelled");
        if let Some(pipe) = pipe {
            pipe.fail(cancelled_error());
        }
        if let Some(response) = response {
            drain_body(response.into_body());
        }
        if let Some(task) = task {
            task.cancel();
        }
        if let Some(mut sink) = sink {
            sink.cancelled();
        }
        if let Some(queue) = queue.and_then(|q| q.upgrade()) {
            queue.remove(self.id);
        }
        preempted
    }

    /// Wait until the exchange completes or is cancelled.
    pub async fn finished(&self) -> ExchangeState {
        let mut rx = self.state_tx.subscribe();
        let state = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }

    /// Wait until a response is delivered or the exchange terminates.
    pub async fn responded(&self) -> ExchangeState {
        let mut rx = self.state_tx.subscribe();
        let state = match rx
            .wait_for(|s| matches!(s, ExchangeState::Responding) || s.is_terminal())
            .await
        {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }
}

fn cancelled_error() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::ConnectionAborted, "exchange cancelled")
}
