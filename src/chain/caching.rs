//! Response caching stage.
//!
//! # Responsibilities
//! - Serve fresh entries for GET/HEAD without running inner stages
//! - Revalidate stale entries with If-None-Match / If-Modified-Since
//! - Store cacheable responses once their body has been fully delivered
//! - Invalidate on successful unsafe methods
//! - Drive the compaction cadence of the connection manager

use std::sync::Arc;
use std::time::SystemTime;

use axum::body::Body;
use axum::http::{header, request, HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use futures_util::future::BoxFuture;

use crate::cache::key::{primary_key, VaryKey};
use crate::cache::{CacheControl, CacheEntry, CacheStatus, CacheStore, Freshness};
use crate::chain::body::{drain_body, CaptureBody};
use crate::chain::transaction::is_safe;
use crate::chain::validators::date_value;
use crate::chain::{Next, Stage};
use crate::client::ConnectionManager;
use crate::error::{ChainError, ChainResult};
use crate::exchange::{HttpHost, RequestContext};
use crate::observability::metrics;

/// Statuses a shared cache may store.
const CACHEABLE_STATUS: [u16; 7] = [200, 203, 204, 300, 301, 308, 410];

/// Headers that never go into a stored entry.
const UNSTORED_HEADERS: [header::HeaderName; 5] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::TE,
    header::TRAILER,
];

/// Per-destination response cache.
pub struct Caching {
    manager: Arc<ConnectionManager>,
}

impl Caching {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }
}

/// Whether a response may be stored for the given request.
pub fn is_storable(
    method: &Method,
    request_headers: &HeaderMap,
    status: StatusCode,
    response_headers: &HeaderMap,
) -> bool {
    if *method != Method::GET || !CACHEABLE_STATUS.contains(&status.as_u16()) {
        return false;
    }
    let request_cc = CacheControl::from_headers(request_headers);
    let cc = CacheControl::from_headers(response_headers);
    if request_cc.no_store || cc.no_store || cc.private {
        return false;
    }
    if request_headers.contains_key(header::AUTHORIZATION)
        && !(cc.public || cc.s_maxage.is_some() || cc.must_revalidate)
    {
        return false;
    }
    let explicit = cc.max_age.is_some() || cc.s_maxage.is_some() || response_headers.contains_key(header::EXPIRES);
    let validated = response_headers.contains_key(header::ETAG)
        || response_headers.contains_key(header::LAST_MODIFIED);
    explicit || validated
}

fn strip_conditionals(headers: &mut HeaderMap) {
    for name in [
        header::IF_MATCH,
        header::IF_NONE_MATCH,
        header::IF_MODIFIED_SINCE,
        header::IF_UNMODIFIED_SINCE,
        header::IF_RANGE,
    ] {
        headers.remove(name);
    }
}

fn content_length(headers: &HeaderMap) -> Option<usize> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

impl Caching {
    async fn serve(
        &self,
        entry: &CacheEntry,
        with_body: bool,
        ctx: &mut RequestContext,
        status: CacheStatus,
    ) -> ChainResult<Response<Body>> {
        ctx.cache_status = Some(status);
        metrics::record_cache_lookup(status.as_str());
        entry
            .to_response(SystemTime::now(), with_body)
            .await
            .map_err(ChainError::Io)
    }

    /// Wrap a response so it is stored once fully delivered.
    fn store_on_completion(
        &self,
        store: Arc<CacheStore>,
        key: String,
        parts: &request::Parts,
        request_time: SystemTime,
        response: Response<Body>,
    ) -> Response<Body> {
        let Some(vary) = VaryKey::capture(response.headers(), &parts.headers) else {
            return response;
        };
        if content_length(response.headers()).is_some_and(|len| len > store.max_entry_bytes()) {
            return response;
        }

        let (mut head, body) = response.into_parts();
        if !head.headers.contains_key(header::DATE) {
            head.headers.insert(header::DATE, date_value(SystemTime::now()));
        }
        let status = head.status;
        let mut headers = head.headers.clone();
        for name in UNSTORED_HEADERS.iter() {
            headers.remove(name);
        }
        headers.remove(header::CONTENT_LENGTH);

        let limit = store.max_entry_bytes();
        let body = CaptureBody::wrap(body, limit, move |bytes| {
            let resource = match store.resource_for(bytes) {
                Ok(resource) => resource,
                Err(e) => {
                    tracing::warn!(error = %e, "Cache blob write failed");
                    return;
                }
            };
            store.put(
                key,
                CacheEntry {
                    status,
                    headers,
                    resource,
                    request_time,
                    response_time: SystemTime::now(),
                    vary,
                },
            );
        });
        Response::from_parts(head, body)
    }
}

impl Stage for Caching {
    fn name(&self) -> &'static str {
        "caching"
    }

    fn execute<'a>(
        &'a self,
        target: &'a HttpHost,
        request: Request<Body>,
        ctx: &'a mut RequestContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, ChainResult<Response<Body>>> {
        Box::pin(async move {
            if self.manager.record_request() {
                self.manager.clean_resources();
            }

            let method = request.method().clone();
            let store = self.manager.cache_for(target);
            let key = primary_key(target, request.uri());

            if method != Method::GET && method != Method::HEAD {
                ctx.cache_status = Some(CacheStatus::Bypass);
                let response = next.run(target, request, ctx).await?;
                if !is_safe(&method) && response.status().as_u16() < 400 {
                    let dropped = store.invalidate(&key);
                    if dropped > 0 {
                        tracing::debug!(key = %key, dropped, "Cache invalidated");
                    }
                }
                return Ok(response);
            }

            let request_cc = CacheControl::from_headers(request.headers());
            if request_cc.no_store {
                ctx.cache_status = Some(CacheStatus::Bypass);
                metrics::record_cache_lookup(CacheStatus::Bypass.as_str());
                return next.run(target, request, ctx).await;
            }

            let with_body = method == Method::GET;
            let now = SystemTime::now();
            let cached = store.get(&key, request.headers());

            if let Some(entry) = &cached {
                match entry.usable_for(&request_cc, now) {
                    Freshness::Fresh { age, heuristic } => {
                        tracing::debug!(key = %key, age_secs = age.as_secs(), heuristic, "Cache hit");
                        drain_body(request.into_body());
                        return self.serve(entry, with_body, ctx, CacheStatus::Hit).await;
                    }
                    Freshness::StaleAcceptable { age } => {
                        tracing::debug!(key = %key, age_secs = age.as_secs(), "Serving stale entry");
                        drain_body(request.into_body());
                        return self.serve(entry, with_body, ctx, CacheStatus::Hit).await;
                    }
                    Freshness::Stale => {}
                }
            }

            if request_cc.only_if_cached {
                metrics::record_cache_lookup("miss");
                return Err(ChainError::GatewayTimeout(
                    "only-if-cached and no usable entry".into(),
                ));
            }

            let (mut parts, body) = request.into_parts();
            let revalidating = cached.as_ref().filter(|e| e.has_validator()).cloned();
            if let Some(entry) = &revalidating {
                strip_conditionals(&mut parts.headers);
                if let Some(etag) = entry.headers.get(header::ETAG) {
                    parts.headers.insert(header::IF_NONE_MATCH, etag.clone());
                }
                if let Some(modified) = entry.headers.get(header::LAST_MODIFIED) {
                    parts.headers.insert(header::IF_MODIFIED_SINCE, modified.clone());
                }
            }

            let request_time = SystemTime::now();
            let forwarded = Request::from_parts(parts.clone(), body);
            let response = next.run(target, forwarded, &mut *ctx).await?;

            if let Some(entry) = revalidating {
                if response.status() == StatusCode::NOT_MODIFIED {
                    let refreshed =
                        entry.refreshed(response.headers(), request_time, SystemTime::now());
                    drain_body(response.into_body());
                    tracing::debug!(key = %key, "Cache entry revalidated");
                    let served = self
                        .serve(&refreshed, with_body, ctx, CacheStatus::Validated)
                        .await;
                    store.put(key, refreshed);
                    return served;
                }
                if response.status().is_server_error() && !entry.cache_control().requires_revalidation() {
                    tracing::debug!(key = %key, status = %response.status(), "Origin failed, serving stale entry");
                    drain_body(response.into_body());
                    let mut stale = self.serve(&entry, with_body, ctx, CacheStatus::Hit).await?;
                    stale.headers_mut().append(
                        header::WARNING,
                        HeaderValue::from_static("111 - \"Revalidation Failed\""),
                    );
                    return Ok(stale);
                }
            }

            ctx.cache_status = Some(CacheStatus::Miss);
            metrics::record_cache_lookup(CacheStatus::Miss.as_str());
            if is_storable(&method, &parts.headers, response.status(), response.headers()) {
                return Ok(self.store_on_completion(store, key, &parts, request_time, response));
            }
            if cached.is_some() && response.status().is_success() {
                store.invalidate(&key);
            }
            Ok(response)
        })
    }
}
