//! Unit-of-work stage.
//!
//! Opens a unit of work per exchange and attaches it to the context. After
//! the inner chain answers: commit when the method is unsafe and the status
//! is below 400, roll back otherwise. The unit of work always ends exactly
//! once, after the response body is drained when the body is streamed.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, Response};
use futures_util::future::BoxFuture;
use http_body::Body as _;

use crate::chain::body::GuardedBody;
use crate::chain::dispatch::{UnitOfWorkFactory, UnitOfWorkHandle};
use crate::chain::{Next, Stage};
use crate::error::ChainResult;
use crate::exchange::{HttpHost, RequestContext};

/// Safe methods never commit.
pub fn is_safe(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE
    )
}

/// Begins, commits or rolls back, and ends a unit of work per exchange.
pub struct Transaction {
    units: Arc<dyn UnitOfWorkFactory>,
}

impl Transaction {
    pub fn new(units: Arc<dyn UnitOfWorkFactory>) -> Self {
        Self { units }
    }
}

impl Stage for Transaction {
    fn name(&self) -> &'static str {
        "transaction"
    }

    fn execute<'a>(
        &'a self,
        target: &'a HttpHost,
        request: Request<Body>,
        ctx: &'a mut RequestContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, ChainResult<Response<Body>>> {
        Box::pin(async move {
            let safe = is_safe(request.method());
            let unit = UnitOfWorkHandle::new(self.units.begin(ctx)?);
            ctx.unit_of_work = Some(unit.clone());

            let result = next.run(target, request, &mut *ctx).await;
            ctx.unit_of_work = None;

            let response = match result {
                Ok(response) => response,
                Err(error) => {
                    unit.rollback();
                    unit.end();
                    return Err(error);
                }
            };

            if !safe && response.status().as_u16() < 400 {
                if let Err(error) = unit.commit() {
                    tracing::warn!(request_id = %ctx.request_id, error = %error, "Commit failed");
                    unit.rollback();
                    unit.end();
                    return Err(error);
                }
                tracing::debug!(request_id = %ctx.request_id, status = %response.status(), "Unit of work committed");
            } else if !safe {
                unit.rollback();
                tracing::debug!(request_id = %ctx.request_id, status = %response.status(), "Unit of work rolled back");
            } else {
                unit.rollback();
            }

            if response.body().is_end_stream() {
                unit.end();
                return Ok(response);
            }
            let (parts, body) = response.into_parts();
            let body = GuardedBody::wrap(body, move |_| {
                unit.end();
            });
            Ok(Response::from_parts(parts, body))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::dispatch::UnitOfWork;
    use crate::chain::{Dispatch, ExecChain, Pipeline};
    use crate::error::ChainError;
    use axum::http::StatusCode;
    use http_body_util::BodyExt;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Journal(Mutex<Vec<&'static str>>);

    impl UnitOfWork for Journal {
        fn commit(&self) -> ChainResult<()> {
            self.0.lock().unwrap().push("commit");
            Ok(())
        }
        fn rollback(&self) {
            self.0.lock().unwrap().push("rollback");
        }
        fn end(&self) {
            self.0.lock().unwrap().push("end");
        }
    }

    struct Factory(Arc<Journal>);

    impl UnitOfWorkFactory for Factory {
        fn begin(&self, _ctx: &RequestContext) -> ChainResult<Arc<dyn UnitOfWork>> {
            Ok(self.0.clone())
        }
    }

    struct Status(u16, &'static str);

    impl Dispatch for Status {
        fn invoke<'a>(
            &'a self,
            _target: &'a HttpHost,
            _request: Request<Body>,
            ctx: &'a mut RequestContext,
        ) -> BoxFuture<'a, ChainResult<Response<Body>>> {
            let attached = ctx.unit_of_work.is_some();
            let (status, body) = (self.0, self.1);
            Box::pin(async move {
                if !attached {
                    return Err(ChainError::Internal("no unit of work".into()));
                }
                let mut response = Response::new(Body::from(body));
                *response.status_mut() = StatusCode::from_u16(status).unwrap();
                Ok(response)
            })
        }
    }

    async fn run(method: Method, status: u16, body: &'static str) -> (Response<Body>, Arc<Journal>) {
        let journal = Arc::new(Journal::default());
        let pipeline = Pipeline::builder(Arc::new(Status(status, body)))
            .stage(Transaction::new(Arc::new(Factory(journal.clone()))))
            .build();
        let target = HttpHost::new("http", "localhost", None);
        let mut ctx = RequestContext::default();
        let request = Request::builder().method(method).body(Body::empty()).unwrap();
        let response = pipeline.execute(&target, request, &mut ctx).await.unwrap();
        (response, journal)
    }

    #[tokio::test]
    async fn test_unsafe_success_commits() {
        let (response, journal) = run(Method::PUT, 204, "").await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(*journal.0.lock().unwrap(), vec!["commit", "end"]);
    }

    #[tokio::test]
    async fn test_unsafe_failure_rolls_back() {
        let (_, journal) = run(Method::POST, 409, "").await;
        assert_eq!(*journal.0.lock().unwrap(), vec!["rollback", "end"]);
    }

    #[tokio::test]
    async fn test_end_deferred_until_body_drained() {
        let (response, journal) = run(Method::GET, 200, "payload").await;
        assert_eq!(*journal.0.lock().unwrap(), vec!["rollback"]);
        response.into_body().collect().await.unwrap();
        assert_eq!(*journal.0.lock().unwrap(), vec!["rollback", "end"]);
    }
}
