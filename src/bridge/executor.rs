//! Runs [`BlockingHandler`]s on tokio's blocking pool behind a fixed number
//! of slots.
//!
//! # Data Flow
//! ```text
//! submit(request, callback)
//!     ├─ no free slot ──► callback.cancelled()            (rejection)
//!     └─ slot acquired
//!          ├─ pump task:   Body ──► Pipe  (waits on capacity_available)
//!          └─ spawn_blocking: handler.execute(PipeSource) ──► callback
//! cancel()
//!     → interrupt flag raised, request pipe failed, pump aborted
//!     → callback.cancelled() unless a result was already delivered
//! ```

use std::io;
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{Request, Response};
use futures_util::StreamExt;
use tokio::sync::Semaphore;

use crate::bridge::handler::{BlockingContext, BlockingHandler};
use crate::chain::callback::{take_callback, Cancellable, FutureCallback, SharedCallback};
use crate::error::ChainError;
use crate::exchange::pipe::Pending;
use crate::exchange::{HttpHost, Pipe};
use crate::observability::metrics;

pub struct BlockingBridge<H> {
    handler: Arc<H>,
    slots: Arc<Semaphore>,
    max_blocking: usize,
    pipe_capacity: usize,
}

impl<H> std::fmt::Debug for BlockingBridge<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingBridge")
            .field("max_blocking", &self.max_blocking)
            .field("available", &self.slots.available_permits())
            .finish()
    }
}

/// Copy a streaming body into `pipe`, waiting whenever the pipe is full.
async fn pump(body: Body, pipe: Pipe) {
    let mut stream = body.into_data_stream();
    let mut pending = Pending::default();
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(chunk) => pending.push(chunk),
            Err(e) => {
                pipe.fail(io::Error::other(e));
                return;
            }
        }
        while !pending.is_empty() {
            if pending.flush_into(&pipe).is_err() {
                // Consumer went away or the exchange was cancelled.
                return;
            }
            if !pending.is_empty() {
                pipe.capacity_available().await;
            }
        }
    }
    pipe.close();
}

impl<H: BlockingHandler> BlockingBridge<H> {
    pub fn new(handler: H, max_blocking: usize, pipe_capacity: usize) -> Self {
        Self {
            handler: Arc::new(handler),
            slots: Arc::new(Semaphore::new(max_blocking)),
            max_blocking,
            pipe_capacity,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Free worker slots.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Run the handler for `request` and report through `callback`.
    ///
    /// When every slot is busy the callback is cancelled before this
    /// returns. Must be called from within a tokio runtime.
    pub fn submit(
        &self,
        target: HttpHost,
        request: Request<Body>,
        ctx: BlockingContext,
        callback: Box<dyn FutureCallback<Response<Body>>>,
    ) -> Cancellable {
        let handle = Cancellable::new();
        let Ok(permit) = self.slots.clone().try_acquire_owned() else {
            metrics::record_bridge_rejection();
            tracing::warn!(
                request_id = %ctx.request_id,
                max_blocking = self.max_blocking,
                "Blocking pool exhausted, rejecting request"
            );
            handle.mark_done();
            callback.cancelled();
            return handle;
        };

        let slot: SharedCallback<Response<Body>> = Arc::new(Mutex::new(Some(callback)));
        let (parts, body) = request.into_parts();
        let pipe = Pipe::with_capacity(self.pipe_capacity);
        let source = match pipe.source() {
            Some(source) => source,
            None => {
                handle.mark_done();
                if let Some(callback) = take_callback(&slot) {
                    callback.failed(ChainError::Internal("request pipe already taken".into()));
                }
                return handle;
            }
        };
        let pump_task = tokio::spawn(pump(body, pipe.clone()));

        {
            let slot = slot.clone();
            let interrupt = ctx.interrupt.clone();
            let pipe = pipe.clone();
            let pump_abort = pump_task.abort_handle();
            let request_id = ctx.request_id;
            handle.on_cancel(move || {
                interrupt.raise();
                pipe.fail(io::Error::new(io::ErrorKind::Interrupted, "exchange cancelled"));
                pump_abort.abort();
                tracing::debug!(request_id = %request_id, "Blocking unit interrupted");
                if let Some(callback) = take_callback(&slot) {
                    callback.cancelled();
                }
            });
        }

        let handler = self.handler.clone();
        let task_handle = handle.clone();
        let worker = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let request = Request::from_parts(parts, source);
            handler.execute(&target, request, &ctx)
        });

        tokio::spawn(async move {
            let result = worker.await;
            task_handle.mark_done();
            let Some(callback) = take_callback(&slot) else {
                return;
            };
            match result {
                Ok(Ok(response)) => callback.completed(response),
                Ok(Err(ChainError::Cancelled)) => callback.cancelled(),
                Ok(Err(error)) => callback.failed(error),
                Err(join) => callback.failed(ChainError::Internal(format!(
                    "blocking handler panicked: {}",
                    join
                ))),
            }
        });
        handle
    }
}
