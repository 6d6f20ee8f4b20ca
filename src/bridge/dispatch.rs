//! Plugs a [`BlockingBridge`] into a chain as its dispatch step.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{request::Parts, Request, Response};
use futures_util::future::BoxFuture;
use tokio::sync::oneshot;

use crate::bridge::executor::BlockingBridge;
use crate::bridge::handler::{BlockingContext, BlockingHandler};
use crate::chain::callback::{callback_fn, Cancellable, Outcome};
use crate::chain::dispatch::{Dispatch, ResourceState};
use crate::error::{ChainError, ChainResult};
use crate::exchange::{HttpHost, RequestContext};

pub struct BlockingDispatch<H> {
    bridge: Arc<BlockingBridge<H>>,
}

impl<H: BlockingHandler> BlockingDispatch<H> {
    pub fn new(bridge: Arc<BlockingBridge<H>>) -> Self {
        Self { bridge }
    }
}

/// Cancels the blocking unit if the awaiting future is dropped first.
struct CancelOnDrop(Cancellable);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

impl<H: BlockingHandler> Dispatch for BlockingDispatch<H> {
    fn resolve<'a>(
        &'a self,
        target: &'a HttpHost,
        parts: &'a Parts,
    ) -> BoxFuture<'a, ChainResult<Option<ResourceState>>> {
        Box::pin(async move { self.bridge.handler().resolve(target, parts) })
    }

    fn invoke<'a>(
        &'a self,
        target: &'a HttpHost,
        request: Request<Body>,
        ctx: &'a mut RequestContext,
    ) -> BoxFuture<'a, ChainResult<Response<Body>>> {
        Box::pin(async move {
            let (tx, rx) = oneshot::channel();
            let callback = callback_fn(move |outcome: Outcome<Response<Body>>| {
                let _ = tx.send(outcome);
            });
            let handle = self.bridge.submit(
                target.clone(),
                request,
                BlockingContext::from_context(ctx),
                callback,
            );
            let guard = CancelOnDrop(handle);

            let outcome = rx.await;
            // Finished or already cancelled: dropping the guard is a no-op.
            drop(guard);
            match outcome {
                Ok(Outcome::Completed(response)) => Ok(response),
                Ok(Outcome::Failed(error)) => Err(error),
                Ok(Outcome::Cancelled) | Err(_) => Err(ChainError::ServiceUnavailable(
                    "no blocking worker available".into(),
                )),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ExecChain, Pipeline};
    use crate::exchange::PipeSource;
    use axum::http::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl BlockingHandler for Counter {
        fn execute(
            &self,
            _target: &HttpHost,
            _request: Request<PipeSource>,
            ctx: &BlockingContext,
        ) -> ChainResult<Response<Body>> {
            let n = self.0.fetch_add(1, Ordering::SeqCst) + 1;
            let body = format!("{} {}", n, ctx.resource.as_ref().is_some_and(|r| r.exists));
            Ok(Response::new(Body::from(body)))
        }

        fn resolve(&self, _target: &HttpHost, _parts: &Parts) -> ChainResult<Option<ResourceState>> {
            Ok(Some(ResourceState::existing(vec![axum::http::Method::GET])))
        }
    }

    struct Failing;

    impl BlockingHandler for Failing {
        fn execute(
            &self,
            _target: &HttpHost,
            _request: Request<PipeSource>,
            _ctx: &BlockingContext,
        ) -> ChainResult<Response<Body>> {
            Err(ChainError::NotAcceptable("text/plain".into()))
        }
    }

    #[tokio::test]
    async fn test_dispatch_delivers_response() {
        let bridge = Arc::new(BlockingBridge::new(Counter(AtomicUsize::new(0)), 4, 1024));
        let dispatch = BlockingDispatch::new(bridge);
        let target = HttpHost::new("http", "local", None);
        let mut ctx = RequestContext::default();
        let (parts, body) = Request::get("/").body(Body::empty()).unwrap().into_parts();
        let resource = dispatch.resolve(&target, &parts).await.unwrap();
        ctx.set_resource(resource);

        let response = dispatch
            .invoke(&target, Request::from_parts(parts, body), &mut ctx)
            .await
            .unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"1 true");
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let bridge = Arc::new(BlockingBridge::new(Failing, 1, 1024));
        let pipeline = Pipeline::builder(Arc::new(BlockingDispatch::new(bridge))).build();
        let target = HttpHost::new("http", "local", None);
        let mut ctx = RequestContext::default();
        let err = pipeline
            .execute(&target, Request::new(Body::empty()), &mut ctx)
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::NOT_ACCEPTABLE);
    }

    #[tokio::test]
    async fn test_exhausted_pool_is_unavailable() {
        let bridge = Arc::new(BlockingBridge::new(Failing, 0, 1024));
        let dispatch = BlockingDispatch::new(bridge);
        let target = HttpHost::new("http", "local", None);
        let mut ctx = RequestContext::default();
        let err = dispatch
            .invoke(&target, Request::new(Body::empty()), &mut ctx)
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
