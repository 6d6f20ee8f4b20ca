//! Client-side authentication stage.
//!
//! Buffers the request body (up to `replay_limit`) so the request can be
//! replayed after a challenge, adds credentials for the current target and
//! proxy state, and retries while the authenticator asks for it.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{request, Request, Response};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http_body::Body as _;
use http_body_util::{BodyExt, LengthLimitError, Limited};

use crate::auth::{AuthRequest, Authenticator, ChallengeType};
use crate::chain::body::drain_body;
use crate::chain::{Next, Stage};
use crate::error::{BoxError, ChainError, ChainResult};
use crate::exchange::{HttpHost, RequestContext};

pub struct AuthStage {
    authenticator: Arc<Authenticator>,
    replay_limit: usize,
    proxy: Option<(HttpHost, Arc<Authenticator>)>,
}

impl AuthStage {
    pub fn new(authenticator: Arc<Authenticator>, replay_limit: usize) -> Self {
        Self {
            authenticator,
            replay_limit,
            proxy: None,
        }
    }

    /// Also negotiate `Proxy-Authenticate` challenges from `proxy`, with
    /// credentials from a separate authenticator.
    pub fn via_proxy(mut self, proxy: HttpHost, authenticator: Arc<Authenticator>) -> Self {
        self.proxy = Some((proxy, authenticator));
        self
    }
}

fn declared_length(parts: &request::Parts) -> Option<u64> {
    parts
        .headers
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn collect_error(error: BoxError, limit: usize) -> ChainError {
    if error.is::<LengthLimitError>() {
        return ChainError::PayloadTooLarge { limit };
    }
    match error.downcast::<axum::Error>() {
        Ok(e) => ChainError::from(*e),
        Err(other) => ChainError::Internal(other.to_string()),
    }
}

/// Buffer a body for replay; `Err(body)` hands back a body that is too
/// large to keep.
async fn buffer_for_replay(
    parts: &request::Parts,
    body: Body,
    limit: usize,
) -> ChainResult<Result<Bytes, Body>> {
    if body.is_end_stream() {
        return Ok(Ok(Bytes::new()));
    }
    if declared_length(parts).is_some_and(|len| len > limit as u64) {
        return Ok(Err(body));
    }
    let collected = Limited::new(body, limit)
        .collect()
        .await
        .map_err(|e| collect_error(e, limit))?;
    Ok(Ok(collected.to_bytes()))
}

impl Stage for AuthStage {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn execute<'a>(
        &'a self,
        target: &'a HttpHost,
        request: Request<Body>,
        ctx: &'a mut RequestContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, ChainResult<Response<Body>>> {
        Box::pin(async move {
            let (parts, body) = request.into_parts();
            let (replay, mut streaming) =
                match buffer_for_replay(&parts, body, self.replay_limit).await? {
                    Ok(bytes) => (Some(bytes), None),
                    Err(body) => (None, Some(body)),
                };

            loop {
                let mut headers = parts.headers.clone();
                let view = AuthRequest {
                    method: &parts.method,
                    uri: &parts.uri,
                };
                self.authenticator.generate_response(
                    ChallengeType::Target,
                    view,
                    &mut headers,
                    &mut ctx.target_auth,
                );
                if let Some((_, proxy_auth)) = &self.proxy {
                    proxy_auth.generate_response(
                        ChallengeType::Proxy,
                        view,
                        &mut headers,
                        &mut ctx.proxy_auth,
                    );
                }

                let body = match &replay {
                    Some(bytes) => Body::from(bytes.clone()),
                    None => streaming.take().unwrap_or_else(Body::empty),
                };
                let mut attempt = Request::new(body);
                *attempt.method_mut() = parts.method.clone();
                *attempt.uri_mut() = parts.uri.clone();
                *attempt.version_mut() = parts.version;
                *attempt.headers_mut() = headers;

                let response = next.run(target, attempt, &mut *ctx).await?;

                let retry_target = self.authenticator.needs_authentication(
                    target,
                    ChallengeType::Target,
                    response.status(),
                    response.headers(),
                    &mut ctx.target_auth,
                );
                let retry_proxy = match &self.proxy {
                    Some((proxy, proxy_auth)) => proxy_auth.needs_authentication(
                        proxy,
                        ChallengeType::Proxy,
                        response.status(),
                        response.headers(),
                        &mut ctx.proxy_auth,
                    ),
                    None => false,
                };
                if !(retry_target || retry_proxy) {
                    return Ok(response);
                }
                if replay.is_none() {
                    tracing::debug!(request_id = %ctx.request_id, "Challenge received but body cannot be replayed");
                    return Ok(response);
                }
                tracing::debug!(
                    request_id = %ctx.request_id,
                    target_host = %target,
                    status = %response.status(),
                    "Retrying with credentials"
                );
                drain_body(response.into_body());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthSchemeRegistry, AuthScope, Credentials, InMemoryCredentials};
    use crate::chain::{Dispatch, ExecChain, Pipeline};
    use axum::http::{header, HeaderValue, StatusCode};
    use std::sync::Mutex;

    /// Answers 401 until it sees the expected Authorization header.
    struct Guarded {
        expected: &'static str,
        seen: Mutex<Vec<(Option<String>, Bytes)>>,
    }

    impl Dispatch for Guarded {
        fn invoke<'a>(
            &'a self,
            _target: &'a HttpHost,
            request: Request<Body>,
            _ctx: &'a mut RequestContext,
        ) -> BoxFuture<'a, ChainResult<Response<Body>>> {
            Box::pin(async move {
                let auth = request
                    .headers()
                    .get(header::AUTHORIZATION)
                    .map(|v| v.to_str().unwrap().to_string());
                let body = request.into_body().collect().await?.to_bytes();
                self.seen.lock().unwrap().push((auth.clone(), body));
                let mut response = Response::new(Body::empty());
                if auth.as_deref() != Some(self.expected) {
                    *response.status_mut() = StatusCode::UNAUTHORIZED;
                    response.headers_mut().insert(
                        header::WWW_AUTHENTICATE,
                        HeaderValue::from_static(r#"Basic realm="r""#),
                    );
                }
                Ok(response)
            })
        }
    }

    fn pipeline(expected: &'static str, replay_limit: usize) -> (Pipeline, Arc<Guarded>) {
        let creds = InMemoryCredentials::new();
        creds.set(AuthScope::any(), Credentials::basic("user", "pass"));
        let authenticator = Arc::new(Authenticator::new(
            AuthSchemeRegistry::default(),
            Arc::new(creds),
        ));
        let dispatch = Arc::new(Guarded {
            expected,
            seen: Mutex::new(Vec::new()),
        });
        let pipeline = Pipeline::builder(dispatch.clone())
            .stage(AuthStage::new(authenticator, replay_limit))
            .build();
        (pipeline, dispatch)
    }

    #[tokio::test]
    async fn test_retry_replays_body_with_credentials() {
        let (pipeline, origin) = pipeline("Basic dXNlcjpwYXNz", 1024);
        let target = HttpHost::new("http", "origin.test", None);
        let mut ctx = RequestContext::default();
        let request = Request::post("/upload").body(Body::from("data")).unwrap();
        let response = pipeline.execute(&target, request, &mut ctx).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let seen = origin.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, None);
        assert_eq!(seen[1].0.as_deref(), Some("Basic dXNlcjpwYXNz"));
        assert_eq!(&seen[1].1[..], b"data");
    }

    #[tokio::test]
    async fn test_rejected_credentials_stop_retrying() {
        let (pipeline, origin) = pipeline("Basic never", 1024);
        let target = HttpHost::new("http", "origin.test", None);
        let mut ctx = RequestContext::default();
        let response = pipeline
            .execute(&target, Request::new(Body::empty()), &mut ctx)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(origin.seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_oversized_body_is_not_replayed() {
        let (pipeline, origin) = pipeline("Basic dXNlcjpwYXNz", 2);
        let target = HttpHost::new("http", "origin.test", None);
        let mut ctx = RequestContext::default();
        let request = Request::post("/upload")
            .header(header::CONTENT_LENGTH, "4")
            .body(Body::from("data"))
            .unwrap();
        let response = pipeline.execute(&target, request, &mut ctx).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(origin.seen.lock().unwrap().len(), 1);
    }
}
