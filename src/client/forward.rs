//! Forwarding dispatch: the innermost step of the server chain when the
//! binary runs as a gateway.
//!
//! # Data Flow
//! ```text
//! request (Host: api.local)
//!     → route table lookup        (exact host, then "*")
//!     → strip hop-by-hop, X-Forwarded-*, X-Request-ID
//!     → manager.exec_chain_for(origin)   (proxy override or default)
//!     → strip hop-by-hop on the way back, echo X-Request-ID
//! ```

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, Response, Uri};
use futures_util::future::BoxFuture;

use crate::chain::{Dispatch, ExecChain};
use crate::client::headers::{append_forwarded, ensure_request_id, strip_hop_by_hop, X_REQUEST_ID};
use crate::client::ConnectionManager;
use crate::config::RouteConfig;
use crate::error::{ChainError, ChainResult};
use crate::exchange::{HttpHost, RequestContext};

/// One resolved route: the origin host plus an optional path prefix.
#[derive(Debug, Clone, PartialEq)]
struct Origin {
    host: HttpHost,
    prefix: String,
}

pub struct ForwardDispatch {
    routes: Vec<(String, Origin)>,
    fallback: Option<Origin>,
    manager: Arc<ConnectionManager>,
}

fn parse_origin(raw: &str) -> Option<Origin> {
    let uri: Uri = raw.parse().ok()?;
    let host = HttpHost::from_uri(&uri)?;
    let prefix = uri.path().trim_end_matches('/').to_string();
    Some(Origin { host, prefix })
}

impl ForwardDispatch {
    pub fn new(routes: &[RouteConfig], manager: Arc<ConnectionManager>) -> Self {
        let mut table = Vec::new();
        let mut fallback = None;
        for route in routes {
            let Some(origin) = parse_origin(&route.origin) else {
                tracing::warn!(host = %route.host, origin = %route.origin, "Ignoring route with invalid origin");
                continue;
            };
            if route.host == "*" {
                fallback = Some(origin);
            } else {
                table.push((route.host.to_ascii_lowercase(), origin));
            }
        }
        Self {
            routes: table,
            fallback,
            manager,
        }
    }

    fn origin_for(&self, target: &HttpHost) -> Option<&Origin> {
        let authority = target.authority();
        self.routes
            .iter()
            .find(|(host, _)| *host == target.host || *host == authority)
            .map(|(_, origin)| origin)
            .or(self.fallback.as_ref())
    }
}

fn upstream_uri(origin: &Origin, uri: &Uri) -> ChainResult<Uri> {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    format!("{}{}", origin.prefix, path)
        .parse()
        .map_err(|e| ChainError::BadRequest(format!("invalid request target: {}", e)))
}

impl Dispatch for ForwardDispatch {
    fn invoke<'a>(
        &'a self,
        target: &'a HttpHost,
        request: Request<Body>,
        ctx: &'a mut RequestContext,
    ) -> BoxFuture<'a, ChainResult<Response<Body>>> {
        Box::pin(async move {
            let Some(origin) = self.origin_for(target) else {
                return Err(ChainError::ServiceUnavailable(format!(
                    "no route for {}",
                    target.authority()
                )));
            };

            let (mut parts, body) = request.into_parts();
            strip_hop_by_hop(&mut parts.headers);
            let original_host = parts.headers.remove(header::HOST);
            append_forwarded(&mut parts.headers, ctx.client_addr, &ctx.scheme, original_host);
            let request_id = ensure_request_id(&mut parts.headers, ctx.request_id);
            parts.uri = upstream_uri(origin, &parts.uri)?;

            tracing::debug!(
                request_id = %ctx.request_id,
                origin = %origin.host,
                uri = %parts.uri,
                "Forwarding request"
            );

            let chain = self.manager.exec_chain_for(&origin.host);
            let response = chain
                .execute(&origin.host, Request::from_parts(parts, body), ctx)
                .await?;

            let (mut head, body) = response.into_parts();
            strip_hop_by_hop(&mut head.headers);
            head.headers.insert(X_REQUEST_ID, request_id);
            Ok(Response::from_parts(head, body))
        })
    }
}
