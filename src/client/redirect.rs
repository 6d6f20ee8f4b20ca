//! Follows upstream redirects up to a fixed hop count.
//!
//! 303 (and 301/302 answering a POST) turn the request into a body-less
//! GET. Other redirects repeat the method and are followed only when the
//! request had no body, since a streamed body cannot be sent twice.
//! Crossing to another host drops `Authorization`.

use axum::body::Body;
use axum::http::{header, Method, Request, Response, StatusCode, Uri};
use futures_util::future::BoxFuture;
use http_body::Body as _;
use url::Url;

use crate::chain::body::drain_body;
use crate::chain::{Next, Stage};
use crate::error::{ChainError, ChainResult};
use crate::exchange::{HttpHost, RequestContext};

#[derive(Debug, Clone)]
pub struct RedirectStage {
    max_hops: usize,
}

impl RedirectStage {
    pub fn new(max_hops: usize) -> Self {
        Self { max_hops }
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

/// Method for the next hop.
fn redirected_method(status: StatusCode, method: &Method) -> Method {
    match status.as_u16() {
        303 if *method != Method::HEAD => Method::GET,
        301 | 302 if *method == Method::POST => Method::GET,
        _ => method.clone(),
    }
}

/// Resolve `Location` against the current request URL.
fn resolve_location(target: &HttpHost, uri: &Uri, location: &str) -> Option<(HttpHost, Uri)> {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let base = Url::parse(&format!("{}{}", target, path)).ok()?;
    let next = base.join(location).ok()?;
    if !matches!(next.scheme(), "http" | "https") {
        return None;
    }
    let host = HttpHost::new(next.scheme(), next.host_str()?, next.port());
    let mut origin_form = next.path().to_string();
    if let Some(query) = next.query() {
        origin_form.push('?');
        origin_form.push_str(query);
    }
    Some((host, origin_form.parse().ok()?))
}

impl Stage for RedirectStage {
    fn name(&self) -> &'static str {
        "redirect"
    }

    fn execute<'a>(
        &'a self,
        target: &'a HttpHost,
        request: Request<Body>,
        ctx: &'a mut RequestContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, ChainResult<Response<Body>>> {
        Box::pin(async move {
            let (mut parts, body) = request.into_parts();
            let had_body = !body.is_end_stream();
            let mut body = Some(body);
            let mut current = target.clone();
            let mut hops = 0;

            loop {
                let attempt = Request::from_parts(
                    parts.clone(),
                    body.take().unwrap_or_else(Body::empty),
                );
                let response = next.run(&current, attempt, &mut *ctx).await?;
                if !is_redirect(response.status()) {
                    return Ok(response);
                }
                let Some(location) = response
                    .headers()
                    .get(header::LOCATION)
                    .and_then(|v| v.to_str().ok())
                else {
                    return Ok(response);
                };
                let Some((host, uri)) = resolve_location(&current, &parts.uri, location) else {
                    tracing::debug!(request_id = %ctx.request_id, location, "Unfollowable redirect");
                    return Ok(response);
                };

                let method = redirected_method(response.status(), &parts.method);
                let drops_body = method != parts.method;
                if had_body && !drops_body {
                    return Ok(response);
                }
                if hops == self.max_hops {
                    drain_body(response.into_body());
                    return Err(ChainError::TooManyRedirects(self.max_hops));
                }
                hops += 1;

                tracing::debug!(
                    request_id = %ctx.request_id,
                    status = %response.status(),
                    from = %current,
                    to = %host,
                    hop = hops,
                    "Following redirect"
                );
                drain_body(response.into_body());

                if drops_body {
                    for name in [
                        header::CONTENT_LENGTH,
                        header::CONTENT_TYPE,
                        header::CONTENT_ENCODING,
                        header::TRANSFER_ENCODING,
                    ] {
                        parts.headers.remove(name);
                    }
                    parts.headers.remove(crate::chain::integrity::CONTENT_MD5);
                }
                if host.key() != current.key() {
                    parts.headers.remove(header::AUTHORIZATION);
                    parts.headers.remove(header::HOST);
                    ctx.target_auth.reset();
                }
                parts.method = method;
                parts.uri = uri;
                current = host;
            }
        })
    }
}
