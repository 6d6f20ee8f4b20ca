//! Innermost step of the upstream chain: send the request with hyper-util.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, HeaderValue, Request, Response, Uri, Version};
use futures_util::future::BoxFuture;
use hyper_util::client::legacy::connect::{Connect, HttpConnector};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::chain::body::GuardedBody;
use crate::chain::dispatch::{Dispatch, Forwarded};
use crate::client::pool::ConnectionPool;
use crate::error::{ChainError, ChainResult};
use crate::exchange::{HttpHost, RequestContext};

/// Plain TCP connector with a connect timeout.
pub fn direct_connector(connect_timeout: Duration) -> HttpConnector {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(connect_timeout));
    connector.set_nodelay(true);
    connector
}

/// `scheme://authority/path?query` for `target`.
pub fn absolute_uri(target: &HttpHost, uri: &Uri) -> ChainResult<Uri> {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("{}://{}{}", target.scheme, target.authority(), path)
        .parse()
        .map_err(|e| ChainError::BadRequest(format!("invalid upstream URI: {}", e)))
}

pub struct Transport<C> {
    client: Client<C, Body>,
    pool: Arc<ConnectionPool>,
}

impl<C> Transport<C>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    pub fn new(connector: C, pool: Arc<ConnectionPool>, idle_timeout: Duration) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(idle_timeout)
            .build(connector);
        Self { client, pool }
    }
}

fn classify(target: &HttpHost, error: hyper_util::client::legacy::Error) -> ChainError {
    if error.is_connect() {
        tracing::warn!(target_host = %target, error = %error, "Upstream connect failed");
        return ChainError::GatewayTimeout(format!("cannot connect to {}", target));
    }
    tracing::warn!(target_host = %target, error = %error, "Upstream exchange failed");
    ChainError::Internal(format!("upstream {} failed: {}", target, error))
}

impl<C> Dispatch for Transport<C>
where
    C: Connect + Clone + Send + Sync + 'static,
{
    fn invoke<'a>(
        &'a self,
        target: &'a HttpHost,
        request: Request<Body>,
        ctx: &'a mut RequestContext,
    ) -> BoxFuture<'a, ChainResult<Response<Body>>> {
        Box::pin(async move {
            let permit = self.pool.acquire(target).await?;

            let (mut parts, body) = request.into_parts();
            parts.uri = absolute_uri(target, &parts.uri)?;
            parts.version = Version::HTTP_11;
            if !parts.headers.contains_key(header::HOST) {
                if let Ok(host) = HeaderValue::from_str(&target.authority()) {
                    parts.headers.insert(header::HOST, host);
                }
            }
            tracing::debug!(
                request_id = %ctx.request_id,
                method = %parts.method,
                uri = %parts.uri,
                "Sending upstream request"
            );

            let response = self
                .client
                .request(Request::from_parts(parts, body))
                .await
                .map_err(|e| classify(target, e))?;

            let (mut head, incoming) = response.into_parts();
            head.extensions.insert(Forwarded);
            // The slot stays leased until the body is drained or dropped.
            let body = GuardedBody::wrap(Body::new(incoming), move |_| drop(permit));
            Ok(Response::from_parts(head, body))
        })
    }
}
