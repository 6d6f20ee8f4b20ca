//! Conditional requests.
//!
//! # Responsibilities
//! - Evaluate preconditions in order: If-Match, If-Unmodified-Since,
//!   If-None-Match, If-Modified-Since
//! - Short-circuit with 304 (safe methods) or 412 without running inner stages
//! - Stamp validators on successful GET/HEAD responses
//!
//! When the resource cannot be resolved up front, GET/HEAD are evaluated
//! against the validators of the inner response instead.

use std::time::SystemTime;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use futures_util::future::BoxFuture;

use crate::chain::body::drain_body;
use crate::chain::dispatch::ResourceState;
use crate::chain::validators::{
    compute_etag, date_value, header_date, header_tags, truncate_secs, EntityTag, TagList,
};
use crate::chain::{Next, Stage};
use crate::error::ChainResult;
use crate::exchange::{HttpHost, RequestContext};

/// Outcome of precondition evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    Proceed,
    NotModified,
    Failed,
}

/// Request validators extracted once per request.
#[derive(Debug, Default)]
pub struct RequestValidators {
    pub if_match: Option<TagList>,
    pub if_none_match: Option<TagList>,
    pub if_modified_since: Option<SystemTime>,
    pub if_unmodified_since: Option<SystemTime>,
}

impl RequestValidators {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        Self {
            if_match: header_tags(headers, &header::IF_MATCH),
            if_none_match: header_tags(headers, &header::IF_NONE_MATCH),
            if_modified_since: header_date(headers, &header::IF_MODIFIED_SINCE),
            if_unmodified_since: header_date(headers, &header::IF_UNMODIFIED_SINCE),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.if_match.is_none()
            && self.if_none_match.is_none()
            && self.if_modified_since.is_none()
            && self.if_unmodified_since.is_none()
    }

    /// Evaluate against the current representation.
    ///
    /// `exists` is false for a resource that does not exist yet, in which case
    /// only `If-Match` (always fails) and `If-None-Match` (always passes) apply.
    pub fn evaluate(
        &self,
        method: &Method,
        exists: bool,
        etag: Option<&EntityTag>,
        last_modified: Option<SystemTime>,
    ) -> Precondition {
        let safe = *method == Method::GET || *method == Method::HEAD;
        let last_modified = last_modified.map(truncate_secs);

        if !exists {
            return if self.if_match.is_some() {
                Precondition::Failed
            } else {
                Precondition::Proceed
            };
        }

        if let Some(list) = &self.if_match {
            let ok = match (list, etag) {
                (TagList::Any, _) => true,
                (list, Some(current)) => list.matches_strong(current),
                (_, None) => false,
            };
            if !ok {
                return Precondition::Failed;
            }
        } else if let (Some(since), Some(modified)) = (self.if_unmodified_since, last_modified) {
            if modified > since {
                return Precondition::Failed;
            }
        }

        if let Some(list) = &self.if_none_match {
            let matched = match (list, etag) {
                (TagList::Any, _) => true,
                (list, Some(current)) => list.matches_weak(current),
                (_, None) => false,
            };
            if matched {
                return if safe {
                    Precondition::NotModified
                } else {
                    Precondition::Failed
                };
            }
        } else if safe {
            if let (Some(since), Some(modified)) = (self.if_modified_since, last_modified) {
                if modified <= since {
                    return Precondition::NotModified;
                }
            }
        }

        Precondition::Proceed
    }
}

/// Conditional-request stage.
#[derive(Debug, Default)]
pub struct Conditional;

impl Conditional {
    pub fn new() -> Self {
        Self
    }
}

fn not_modified(validators: HeaderMap) -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NOT_MODIFIED;
    *response.headers_mut() = validators;
    response
}

fn precondition_failed() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::PRECONDITION_FAILED;
    response
}

/// Validator headers describing a resource.
fn resource_validators(resource: &ResourceState, etag: Option<&EntityTag>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Some(value) = etag.and_then(EntityTag::to_header) {
        headers.insert(header::ETAG, value);
    }
    if let Some(modified) = resource.last_modified {
        headers.insert(header::LAST_MODIFIED, date_value(modified));
    }
    if let Some(value) = resource
        .cache_control
        .as_deref()
        .and_then(|v| HeaderValue::from_str(v).ok())
    {
        headers.insert(header::CACHE_CONTROL, value);
    }
    if !resource.vary.is_empty() {
        let joined = resource
            .vary
            .iter()
            .map(|n| n.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        if let Ok(value) = HeaderValue::from_str(&joined) {
            headers.insert(header::VARY, value);
        }
    }
    headers
}

/// Validator headers copied from a response.
fn response_validators(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for name in [
        header::ETAG,
        header::LAST_MODIFIED,
        header::CACHE_CONTROL,
        header::VARY,
        header::EXPIRES,
        header::CONTENT_LOCATION,
    ] {
        for value in headers.get_all(&name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("gzip"))
        .unwrap_or(false)
}

impl Stage for Conditional {
    fn name(&self) -> &'static str {
        "conditional"
    }

    fn execute<'a>(
        &'a self,
        target: &'a HttpHost,
        request: Request<Body>,
        ctx: &'a mut RequestContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, ChainResult<Response<Body>>> {
        Box::pin(async move {
            let request = next.resolve(target, request, &mut *ctx).await?;
            let method = request.method().clone();
            let safe = method == Method::GET || method == Method::HEAD;
            let validators = RequestValidators::from_headers(request.headers());

            let resource = ctx.resource().cloned();
            let etag = resource
                .as_ref()
                .and_then(|r| compute_etag(r, request.headers()));

            if let Some(resource) = &resource {
                if !validators.is_empty() {
                    match validators.evaluate(
                        &method,
                        resource.exists,
                        etag.as_ref(),
                        resource.last_modified,
                    ) {
                        Precondition::Proceed => {}
                        Precondition::NotModified => {
                            tracing::debug!(request_id = %ctx.request_id, "Not modified");
                            return Ok(not_modified(resource_validators(resource, etag.as_ref())));
                        }
                        Precondition::Failed => {
                            tracing::debug!(request_id = %ctx.request_id, method = %method, "Precondition failed");
                            return Ok(precondition_failed());
                        }
                    }
                }
            }

            let mut response = next.run(target, request, &mut *ctx).await?;
            if !safe || !response.status().is_success() {
                return Ok(response);
            }

            match &resource {
                Some(resource) if resource.exists => {
                    let gzip = is_gzip(response.headers());
                    let stamped = resource_validators(resource, etag.as_ref());
                    let headers = response.headers_mut();
                    for (name, value) in stamped.iter() {
                        if headers.contains_key(name) {
                            continue;
                        }
                        if *name == header::ETAG && gzip {
                            if let Some(v) = etag
                                .as_ref()
                                .and_then(|t| t.gzip_variant().to_header())
                            {
                                headers.insert(header::ETAG, v);
                            }
                            continue;
                        }
                        headers.insert(name.clone(), value.clone());
                    }
                    Ok(response)
                }
                _ if !validators.is_empty() && response.status() == StatusCode::OK => {
                    let current_etag = response
                        .headers()
                        .get(header::ETAG)
                        .and_then(|v| v.to_str().ok())
                        .and_then(EntityTag::parse);
                    let modified = header_date(response.headers(), &header::LAST_MODIFIED);
                    let outcome = RequestValidators {
                        if_match: None,
                        if_unmodified_since: None,
                        ..validators
                    }
                    .evaluate(&method, true, current_etag.as_ref(), modified);
                    if outcome == Precondition::NotModified {
                        tracing::debug!(request_id = %ctx.request_id, "Not modified (response validators)");
                        let headers = response_validators(response.headers());
                        drain_body(response.into_body());
                        return Ok(not_modified(headers));
                    }
                    Ok(response)
                }
                _ => Ok(response),
            }
        })
    }
}
