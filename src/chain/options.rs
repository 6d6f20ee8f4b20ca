//! OPTIONS, TRACE and CORS handling.
//!
//! # Responsibilities
//! - Answer `OPTIONS *` with the server-wide method set
//! - Echo `TRACE` requests as `message/http`
//! - Answer discovery/preflight `OPTIONS` from the resource's method set
//! - Refuse methods the resolved resource does not answer with `405`
//! - Post-process: add `TRACE` to `405 Allow` lists, add the allowed origin

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use bytes::Bytes;
use futures_util::future::BoxFuture;

use crate::chain::body::drain_body;
use crate::chain::{Next, Stage};
use crate::config::CorsConfig;
use crate::error::{allow_header, ChainError, ChainResult};
use crate::exchange::{HttpHost, RawHead, RequestContext};

/// Methods advertised for `OPTIONS *`.
pub const SERVER_METHODS: [Method; 8] = [
    Method::OPTIONS,
    Method::GET,
    Method::HEAD,
    Method::POST,
    Method::PUT,
    Method::PATCH,
    Method::DELETE,
    Method::TRACE,
];

/// Short-circuits OPTIONS/TRACE and decorates responses with CORS headers.
#[derive(Debug, Clone)]
pub struct OptionsTrace {
    cors: CorsConfig,
}

impl OptionsTrace {
    pub fn new(cors: CorsConfig) -> Self {
        Self { cors }
    }

    fn allow_origin(&self, request_headers: &HeaderMap) -> Option<HeaderValue> {
        let origin = request_headers.get(header::ORIGIN)?;
        if self.cors.allow_origin == "*" {
            return Some(HeaderValue::from_static("*"));
        }
        if self.cors.allow_origin.is_empty() {
            return None;
        }
        let allowed = self
            .cors
            .allow_origin
            .split(',')
            .map(str::trim)
            .any(|o| origin.as_bytes() == o.as_bytes());
        allowed.then(|| origin.clone())
    }

    fn server_options(&self, request_headers: &HeaderMap) -> Response<Body> {
        let mut response = empty(StatusCode::NO_CONTENT);
        if let Some(value) = allow_header(&SERVER_METHODS) {
            response.headers_mut().insert(header::ALLOW, value);
        }
        if let Some(origin) = self.allow_origin(request_headers) {
            response
                .headers_mut()
                .insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        }
        response
    }

    fn resource_options(
        &self,
        request_headers: &HeaderMap,
        allow: &[Method],
        links: &[String],
    ) -> Response<Body> {
        let mut methods = allow.to_vec();
        for extra in [Method::OPTIONS, Method::TRACE] {
            if !methods.contains(&extra) {
                methods.push(extra);
            }
        }

        let mut response = empty(StatusCode::NO_CONTENT);
        let headers = response.headers_mut();
        if let Some(value) = allow_header(&methods) {
            headers.insert(header::ALLOW, value.clone());
            headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, value);
        }

        let requested = request_headers
            .get(header::ACCESS_CONTROL_REQUEST_HEADERS)
            .cloned();
        let allow_headers = requested.or_else(|| {
            if self.cors.allow_headers.is_empty() {
                None
            } else {
                HeaderValue::from_str(&self.cors.allow_headers.join(", ")).ok()
            }
        });
        if let Some(value) = allow_headers {
            headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, value);
        }
        if let Some(origin) = self.allow_origin(request_headers) {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        }
        headers.insert(
            header::ACCESS_CONTROL_MAX_AGE,
            HeaderValue::from(self.cors.max_age_secs),
        );
        for link in links {
            if let Ok(value) = HeaderValue::from_str(link) {
                headers.append(header::LINK, value);
            }
        }
        response
    }
}

fn empty(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    response
}

/// Render the request line and headers as a `message/http` echo.
///
/// Uses the head bytes as received when the transport recorded them, so
/// header case and order survive.
pub fn trace_echo(request: &Request<Body>) -> Response<Body> {
    let echo = match request.extensions().get::<RawHead>() {
        Some(RawHead(raw)) => raw.clone(),
        None => Bytes::from(rebuild_head(request)),
    };

    let mut response = Response::new(Body::from(echo));
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("message/http"));
    response
}

fn rebuild_head(request: &Request<Body>) -> Vec<u8> {
    let mut echo = format!(
        "{} {} {:?}\r\n",
        request.method(),
        request.uri(),
        request.version()
    )
    .into_bytes();
    for (name, value) in request.headers() {
        echo.extend_from_slice(name.as_str().as_bytes());
        echo.extend_from_slice(b": ");
        echo.extend_from_slice(value.as_bytes());
        echo.extend_from_slice(b"\r\n");
    }
    echo.extend_from_slice(b"\r\n");
    echo
}

fn with_trace(mut allow: Vec<Method>) -> Vec<Method> {
    if !allow.contains(&Method::TRACE) {
        allow.push(Method::TRACE);
    }
    allow
}

/// Append `TRACE` to an `Allow` header that lacks it.
fn append_trace(headers: &mut HeaderMap) {
    let Some(current) = headers.get(header::ALLOW).and_then(|v| v.to_str().ok()) else {
        return;
    };
    if current
        .split(',')
        .any(|m| m.trim().eq_ignore_ascii_case("TRACE"))
    {
        return;
    }
    let updated = if current.trim().is_empty() {
        "TRACE".to_string()
    } else {
        format!("{}, TRACE", current)
    };
    if let Ok(value) = HeaderValue::from_str(&updated) {
        headers.insert(header::ALLOW, value);
    }
}

impl Stage for OptionsTrace {
    fn name(&self) -> &'static str {
        "options-trace"
    }

    fn execute<'a>(
        &'a self,
        target: &'a HttpHost,
        request: Request<Body>,
        ctx: &'a mut RequestContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, ChainResult<Response<Body>>> {
        Box::pin(async move {
            if request.method() == Method::TRACE {
                tracing::debug!(request_id = %ctx.request_id, "TRACE echoed");
                let response = trace_echo(&request);
                drain_body(request.into_body());
                return Ok(response);
            }

            if request.method() == Method::OPTIONS {
                if request.uri().path() == "*" {
                    tracing::debug!(request_id = %ctx.request_id, "OPTIONS * answered");
                    return Ok(self.server_options(request.headers()));
                }
                let request = next.resolve(target, request, &mut *ctx).await?;
                if let Some(resource) = ctx.resource().filter(|r| r.exists) {
                    tracing::debug!(request_id = %ctx.request_id, path = %request.uri().path(), "OPTIONS answered");
                    let response =
                        self.resource_options(request.headers(), &resource.allow, &resource.links);
                    drain_body(request.into_body());
                    return Ok(response);
                }
                return next.run(target, request, ctx).await;
            }

            let request = next.resolve(target, request, &mut *ctx).await?;
            if let Some(resource) = ctx.resource().filter(|r| r.exists && !r.allow.is_empty()) {
                if !resource.allows(request.method()) {
                    tracing::debug!(
                        request_id = %ctx.request_id,
                        method = %request.method(),
                        "Method not allowed by resource"
                    );
                    let allow = with_trace(resource.allow.clone());
                    drain_body(request.into_body());
                    return Err(ChainError::MethodNotAllowed { allow });
                }
            }

            let origin = self.allow_origin(request.headers());
            let mut response = match next.run(target, request, ctx).await {
                Ok(response) => response,
                Err(ChainError::MethodNotAllowed { allow }) => {
                    return Err(ChainError::MethodNotAllowed {
                        allow: with_trace(allow),
                    })
                }
                Err(e) => return Err(e),
            };
            if response.status() == StatusCode::METHOD_NOT_ALLOWED {
                append_trace(response.headers_mut());
            }
            if let Some(origin) = origin {
                response
                    .headers_mut()
                    .entry(header::ACCESS_CONTROL_ALLOW_ORIGIN)
                    .or_insert(origin);
            }
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::http::request::Parts;
    use http_body_util::BodyExt;

    use crate::chain::errors::ErrorMapping;
    use crate::chain::{Dispatch, ExecChain, Pipeline, ResourceState};

    /// Optionally resolves to a GET-only resource; `invoke` always answers
    /// with a typed 405.
    struct GetOnly {
        resolves: bool,
        invoked: AtomicUsize,
    }

    impl GetOnly {
        fn new(resolves: bool) -> Arc<Self> {
            Arc::new(Self {
                resolves,
                invoked: AtomicUsize::new(0),
            })
        }
    }

    impl Dispatch for GetOnly {
        fn resolve<'a>(
            &'a self,
            _target: &'a HttpHost,
            _parts: &'a Parts,
        ) -> BoxFuture<'a, ChainResult<Option<ResourceState>>> {
            let resolves = self.resolves;
            Box::pin(async move {
                Ok(resolves.then(|| ResourceState::existing(vec![Method::GET])))
            })
        }

        fn invoke<'a>(
            &'a self,
            _target: &'a HttpHost,
            _request: Request<Body>,
            _ctx: &'a mut RequestContext,
        ) -> BoxFuture<'a, ChainResult<Response<Body>>> {
            self.invoked.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                Err(ChainError::MethodNotAllowed {
                    allow: vec![Method::GET],
                })
            })
        }
    }

    async fn delete_through(dispatch: Arc<GetOnly>) -> Response<Body> {
        let pipeline = Pipeline::builder(dispatch)
            .stage(ErrorMapping::new())
            .stage(OptionsTrace::new(CorsConfig::default()))
            .build();
        let target = HttpHost::new("http", "localhost", None);
        let mut ctx = RequestContext::default();
        let request = Request::builder()
            .method(Method::DELETE)
            .uri("/doc")
            .body(Body::empty())
            .unwrap();
        pipeline.execute(&target, request, &mut ctx).await.unwrap()
    }

    #[tokio::test]
    async fn test_raised_method_not_allowed_lists_trace() {
        let dispatch = GetOnly::new(false);
        let response = delete_through(dispatch.clone()).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[header::ALLOW], "GET, TRACE");
        assert_eq!(dispatch.invoked.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resource_method_set_is_enforced_before_dispatch() {
        let dispatch = GetOnly::new(true);
        let response = delete_through(dispatch.clone()).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[header::ALLOW], "GET, TRACE");
        assert_eq!(dispatch.invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_trace_echo_uses_received_head() {
        let raw = b"TRACE /a HTTP/1.1\r\nHost: x\r\nX-Marker: 1\r\nx-marker: 2\r\n\r\n";
        let mut request = Request::builder()
            .method(Method::TRACE)
            .uri("/a")
            .header("host", "x")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(RawHead(Bytes::from_static(raw)));
        let body = trace_echo(&request).into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], &raw[..]);
    }

    #[test]
    fn test_append_trace_once() {
        let mut headers = HeaderMap::new();
        headers.insert(header::ALLOW, HeaderValue::from_static("GET, HEAD"));
        append_trace(&mut headers);
        append_trace(&mut headers);
        assert_eq!(headers[header::ALLOW], "GET, HEAD, TRACE");
    }

    #[tokio::test]
    async fn test_trace_echo_without_raw_head() {
        let request = Request::builder()
            .method(Method::TRACE)
            .uri("/a?b=c")
            .header("x-marker", "1")
            .body(Body::empty())
            .unwrap();
        let response = trace_echo(&request);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "message/http");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"TRACE /a?b=c HTTP/1.1\r\nx-marker: 1\r\n\r\n");
    }

    #[test]
    fn test_origin_list() {
        let stage = OptionsTrace::new(CorsConfig {
            allow_origin: "https://a.example, https://b.example".to_string(),
            ..CorsConfig::default()
        });
        let mut headers = HeaderMap::new();
        assert!(stage.allow_origin(&headers).is_none());
        headers.insert(header::ORIGIN, HeaderValue::from_static("https://b.example"));
        assert_eq!(stage.allow_origin(&headers).unwrap(), "https://b.example");
        headers.insert(header::ORIGIN, HeaderValue::from_static("https://c.example"));
        assert!(stage.allow_origin(&headers).is_none());
    }
}
