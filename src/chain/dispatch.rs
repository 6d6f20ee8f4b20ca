//! Interfaces to the collaborators around the chain: domain dispatch and the
//! unit of work against the backing store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use axum::body::Body;
use axum::http::{request::Parts, HeaderName, Method, Request, Response};
use futures_util::future::BoxFuture;

use crate::chain::ExecChain;
use crate::error::ChainResult;
use crate::exchange::{HttpHost, RequestContext};

/// What the chain needs to know about a target resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceState {
    /// Opaque version token; changes whenever the representation does.
    pub version: Option<String>,
    pub last_modified: Option<SystemTime>,
    pub content_type: Option<String>,
    /// Methods the resource answers.
    pub allow: Vec<Method>,
    /// Request headers that select between representations.
    pub vary: Vec<HeaderName>,
    /// `Link` header values advertised on discovery.
    pub links: Vec<String>,
    pub cache_control: Option<String>,
    pub exists: bool,
}

impl ResourceState {
    /// A resource that exists and answers `allow`.
    pub fn existing(allow: Vec<Method>) -> Self {
        Self {
            allow,
            exists: true,
            ..Self::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_last_modified(mut self, at: SystemTime) -> Self {
        self.last_modified = Some(at);
        self
    }

    pub fn with_vary(mut self, names: Vec<HeaderName>) -> Self {
        self.vary = names;
        self
    }

    pub fn with_cache_control(mut self, value: impl Into<String>) -> Self {
        self.cache_control = Some(value.into());
        self
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.links.push(link.into());
        self
    }

    pub fn allows(&self, method: &Method) -> bool {
        self.allow.iter().any(|m| m == method)
            || (*method == Method::HEAD && self.allow.contains(&Method::GET))
    }
}

/// Response extension marking a response produced by another server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Forwarded;

/// Innermost step of a chain: resolve and invoke the target.
pub trait Dispatch: Send + Sync {
    /// Describe the resource the request addresses, if known.
    fn resolve<'a>(
        &'a self,
        _target: &'a HttpHost,
        _parts: &'a Parts,
    ) -> BoxFuture<'a, ChainResult<Option<ResourceState>>> {
        Box::pin(async { Ok(None) })
    }

    /// Produce the response.
    fn invoke<'a>(
        &'a self,
        target: &'a HttpHost,
        request: Request<Body>,
        ctx: &'a mut RequestContext,
    ) -> BoxFuture<'a, ChainResult<Response<Body>>>;
}

/// Use a whole chain as the dispatch step of another.
pub struct ChainDispatch(pub Arc<dyn ExecChain>);

impl Dispatch for ChainDispatch {
    fn invoke<'a>(
        &'a self,
        target: &'a HttpHost,
        request: Request<Body>,
        ctx: &'a mut RequestContext,
    ) -> BoxFuture<'a, ChainResult<Response<Body>>> {
        self.0.execute(target, request, ctx)
    }
}

/// Transactional handle against the backing store.
pub trait UnitOfWork: Send + Sync {
    fn commit(&self) -> ChainResult<()>;
    fn rollback(&self);
    /// Release the unit of work.
    fn end(&self);
}

/// Opens units of work.
pub trait UnitOfWorkFactory: Send + Sync {
    fn begin(&self, ctx: &RequestContext) -> ChainResult<Arc<dyn UnitOfWork>>;
}

/// Shared handle guaranteeing `end` runs at most once.
#[derive(Clone)]
pub struct UnitOfWorkHandle {
    inner: Arc<dyn UnitOfWork>,
    ended: Arc<AtomicBool>,
}

impl std::fmt::Debug for UnitOfWorkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWorkHandle")
            .field("ended", &self.is_ended())
            .finish()
    }
}

impl UnitOfWorkHandle {
    pub fn new(inner: Arc<dyn UnitOfWork>) -> Self {
        Self {
            inner,
            ended: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn commit(&self) -> ChainResult<()> {
        self.inner.commit()
    }

    pub fn rollback(&self) {
        self.inner.rollback()
    }

    /// End the unit of work. Returns false if it had already ended.
    pub fn end(&self) -> bool {
        if self.ended.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.inner.end();
        true
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }
}

/// Unit of work that does nothing; used when no store is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopUnitOfWork;

impl UnitOfWork for NoopUnitOfWork {
    fn commit(&self) -> ChainResult<()> {
        Ok(())
    }

    fn rollback(&self) {}

    fn end(&self) {}
}

impl UnitOfWorkFactory for NoopUnitOfWork {
    fn begin(&self, _ctx: &RequestContext) -> ChainResult<Arc<dyn UnitOfWork>> {
        Ok(Arc::new(NoopUnitOfWork))
    }
}
