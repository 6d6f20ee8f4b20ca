//! Execution chain: an ordered pipeline of protocol stages around a dispatch.
//!
//! # Data Flow
//! ```text
//! Exchange ─► ErrorMapping          (ChainError / panic → status response)
//!           ─► OptionsTrace          (OPTIONS *, TRACE, discovery OPTIONS, CORS)
//!           ─► Transaction           (unit of work: commit / rollback / end once)
//!           ─► Conditional           (If-Match, If-None-Match, ... → 304 / 412)
//!           ─► Caching               (per-destination store, revalidation)
//!           ─► Encoding              (gunzip requests, gzip responses)
//!           ─► Integrity             (Content-MD5 on request bodies)
//!           ─► Dispatch              (resolve + invoke the target)
//! ```
//!
//! # Design Decisions
//! - The pipeline is built once; stages hold configuration only, and all
//!   per-request state lives in [`RequestContext`]
//! - Stages either call `next` or short-circuit with their own response
//! - Failures travel as [`ChainError`] values; only the outermost stage
//!   renders them

pub mod body;
pub mod callback;
pub mod caching;
pub mod conditional;
pub mod dispatch;
pub mod encoding;
pub mod errors;
pub mod integrity;
pub mod options;
pub mod transaction;
pub mod validators;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response};
use futures_util::future::BoxFuture;

use crate::client::ConnectionManager;
use crate::config::ServerConfig;
use crate::error::ChainResult;
use crate::exchange::{HttpHost, RequestContext};

pub use callback::{callback_fn, spawn, Cancellable, FutureCallback, Outcome};
pub use dispatch::{Dispatch, ResourceState, UnitOfWork, UnitOfWorkFactory};

/// Anything that turns a request into a response.
pub trait ExecChain: Send + Sync {
    fn execute<'a>(
        &'a self,
        target: &'a HttpHost,
        request: Request<Body>,
        ctx: &'a mut RequestContext,
    ) -> BoxFuture<'a, ChainResult<Response<Body>>>;
}

/// One protocol concern in a [`Pipeline`].
pub trait Stage: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn execute<'a>(
        &'a self,
        target: &'a HttpHost,
        request: Request<Body>,
        ctx: &'a mut RequestContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, ChainResult<Response<Body>>>;
}

/// The remainder of the pipeline after the current stage.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    stages: &'a [Arc<dyn Stage>],
    dispatch: &'a dyn Dispatch,
}

impl<'a> Next<'a> {
    /// Run the remaining stages and the dispatch.
    pub fn run<'b>(
        self,
        target: &'b HttpHost,
        request: Request<Body>,
        ctx: &'b mut RequestContext,
    ) -> BoxFuture<'b, ChainResult<Response<Body>>>
    where
        'a: 'b,
    {
        match self.stages.split_first() {
            Some((stage, rest)) => {
                let next = Next {
                    stages: rest,
                    dispatch: self.dispatch,
                };
                stage.execute(target, request, ctx, next)
            }
            None => self.dispatch.invoke(target, request, ctx),
        }
    }

    /// Resolve the target resource once per exchange and memoise it.
    pub fn resolve<'b>(
        self,
        target: &'b HttpHost,
        request: Request<Body>,
        ctx: &'b mut RequestContext,
    ) -> BoxFuture<'b, ChainResult<Request<Body>>>
    where
        'a: 'b,
    {
        let dispatch = self.dispatch;
        Box::pin(async move {
            if ctx.is_resolved() {
                return Ok(request);
            }
            let (parts, body) = request.into_parts();
            let resource = dispatch.resolve(target, &parts).await?;
            ctx.set_resource(resource);
            Ok(Request::from_parts(parts, body))
        })
    }
}

/// An ordered list of stages ending in a dispatch.
pub struct Pipeline {
    stages: Vec<Arc<dyn Stage>>,
    dispatch: Arc<dyn Dispatch>,
}

impl Pipeline {
    pub fn builder(dispatch: Arc<dyn Dispatch>) -> PipelineBuilder {
        PipelineBuilder {
            stages: Vec::new(),
            dispatch,
        }
    }

    /// Stage names, outermost first.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }
}

impl ExecChain for Pipeline {
    fn execute<'a>(
        &'a self,
        target: &'a HttpHost,
        request: Request<Body>,
        ctx: &'a mut RequestContext,
    ) -> BoxFuture<'a, ChainResult<Response<Body>>> {
        let next = Next {
            stages: &self.stages,
            dispatch: self.dispatch.as_ref(),
        };
        next.run(target, request, ctx)
    }
}

/// Builds a [`Pipeline`], outermost stage first.
pub struct PipelineBuilder {
    stages: Vec<Arc<dyn Stage>>,
    dispatch: Arc<dyn Dispatch>,
}

impl PipelineBuilder {
    pub fn stage<S: Stage + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            stages: self.stages,
            dispatch: self.dispatch,
        }
    }
}

/// Assemble the server-side chain in its fixed order.
pub fn server_pipeline(
    config: &ServerConfig,
    manager: Arc<ConnectionManager>,
    units: Arc<dyn UnitOfWorkFactory>,
    dispatch: Arc<dyn Dispatch>,
) -> Pipeline {
    let mut builder = Pipeline::builder(dispatch)
        .stage(errors::ErrorMapping::new())
        .stage(options::OptionsTrace::new(config.cors.clone()))
        .stage(transaction::Transaction::new(units))
        .stage(conditional::Conditional::new());
    if config.cache.enabled {
        builder = builder.stage(caching::Caching::new(manager));
    }
    builder
        .stage(encoding::Encoding::new(config.compression.clone()))
        .stage(integrity::Integrity::new())
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use std::sync::Mutex;

    struct Record(&'static str, Arc<Mutex<Vec<&'static str>>>);

    impl Stage for Record {
        fn name(&self) -> &'static str {
            self.0
        }

        fn execute<'a>(
            &'a self,
            target: &'a HttpHost,
            request: Request<Body>,
            ctx: &'a mut RequestContext,
            next: Next<'a>,
        ) -> BoxFuture<'a, ChainResult<Response<Body>>> {
            Box::pin(async move {
                self.1.lock().unwrap().push(self.0);
                let response = next.run(target, request, ctx).await?;
                self.1.lock().unwrap().push(self.0);
                Ok(response)
            })
        }
    }

    struct Teapot;

    impl Dispatch for Teapot {
        fn invoke<'a>(
            &'a self,
            _target: &'a HttpHost,
            _request: Request<Body>,
            _ctx: &'a mut RequestContext,
        ) -> BoxFuture<'a, ChainResult<Response<Body>>> {
            Box::pin(async {
                let mut response = Response::new(Body::empty());
                *response.status_mut() = StatusCode::IM_A_TEAPOT;
                Ok(response)
            })
        }
    }

    #[tokio::test]
    async fn test_stages_wrap_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = Pipeline::builder(Arc::new(Teapot))
            .stage(Record("outer", log.clone()))
            .stage(Record("inner", log.clone()))
            .build();
        assert_eq!(pipeline.stage_names(), vec!["outer", "inner"]);

        let target = HttpHost::new("http", "localhost", None);
        let mut ctx = RequestContext::default();
        let response = pipeline
            .execute(&target, Request::new(Body::empty()), &mut ctx)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::IM_A_TEAPOT);
        assert_eq!(*log.lock().unwrap(), vec!["outer", "inner", "inner", "outer"]);
    }

    #[test]
    fn test_server_pipeline_order() {
        let config = ServerConfig::default();
        let manager = Arc::new(ConnectionManager::new(&config));
        let pipeline = server_pipeline(
            &config,
            manager,
            Arc::new(dispatch::NoopUnitOfWork),
            Arc::new(Teapot),
        );
        assert_eq!(
            pipeline.stage_names(),
            vec![
                "error-mapping",
                "options-trace",
                "transaction",
                "conditional",
                "caching",
                "encoding",
                "integrity"
            ]
        );
    }
}
