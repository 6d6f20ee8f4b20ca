//! Outermost stage: render failures as status-coded responses.

use std::panic::AssertUnwindSafe;

use axum::body::Body;
use axum::http::{Request, Response};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::chain::{Next, Stage};
use crate::error::{ChainError, ChainResult};
use crate::exchange::{HttpHost, RequestContext};
use crate::observability::metrics;

/// Maps every [`ChainError`] and any panic below it to a response.
///
/// `Cancelled` is passed through untouched so the caller can report it as a
/// terminal state instead of a failure.
#[derive(Debug, Default)]
pub struct ErrorMapping;

impl ErrorMapping {
    pub fn new() -> Self {
        Self
    }
}

impl Stage for ErrorMapping {
    fn name(&self) -> &'static str {
        "error-mapping"
    }

    fn execute<'a>(
        &'a self,
        target: &'a HttpHost,
        request: Request<Body>,
        ctx: &'a mut RequestContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, ChainResult<Response<Body>>> {
        Box::pin(async move {
            let request_id = ctx.request_id;
            let outcome = AssertUnwindSafe(next.run(target, request, ctx))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(ChainError::Cancelled)) => Err(ChainError::Cancelled),
                Ok(Err(error)) => {
                    if error.is_alternate_response() || error.status().is_client_error() {
                        tracing::debug!(request_id = %request_id, error = %error, "Request rejected");
                    } else {
                        tracing::warn!(request_id = %request_id, error = %error, "Request failed");
                    }
                    metrics::record_chain_error(error.status().as_u16());
                    Ok(error.into_response())
                }
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "handler panicked".to_string());
                    tracing::error!(request_id = %request_id, panic = %message, "Handler panicked");
                    metrics::record_chain_error(500);
                    Ok(ChainError::Internal(message).into_response())
                }
            }
        })
    }
}
