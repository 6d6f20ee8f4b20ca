//! Stored responses.

use std::io;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Response, StatusCode};
use bytes::Bytes;

use crate::cache::freshness::{current_age, freshness_lifetime, CacheControl, HEURISTIC_CAP};
use crate::cache::key::VaryKey;
use crate::chain::validators::{header_date, EntityTag};

/// Where a stored body lives.
#[derive(Debug, Clone)]
pub enum Resource {
    Memory(Bytes),
    File { path: PathBuf, len: usize },
}

impl Resource {
    pub fn len(&self) -> usize {
        match self {
            Resource::Memory(bytes) => bytes.len(),
            Resource::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn load(&self) -> io::Result<Bytes> {
        match self {
            Resource::Memory(bytes) => Ok(bytes.clone()),
            Resource::File { path, .. } => Ok(Bytes::from(tokio::fs::read(path).await?)),
        }
    }

    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Resource::File { path, .. } => Some(path),
            Resource::Memory(_) => None,
        }
    }
}

/// A response held by a [`CacheStore`](super::CacheStore).
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub resource: Resource,
    pub request_time: SystemTime,
    pub response_time: SystemTime,
    pub vary: VaryKey,
}

impl CacheEntry {
    pub fn cache_control(&self) -> CacheControl {
        CacheControl::from_headers(&self.headers)
    }

    /// Freshness lifetime and whether it is heuristic.
    pub fn lifetime(&self) -> (Duration, bool) {
        freshness_lifetime(&self.headers, &self.cache_control())
    }

    pub fn age(&self, now: SystemTime) -> Duration {
        current_age(&self.headers, self.request_time, self.response_time, now)
    }

    pub fn etag(&self) -> Option<EntityTag> {
        self.headers
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .and_then(EntityTag::parse)
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        header_date(&self.headers, &header::LAST_MODIFIED)
    }

    /// Whether a conditional request can revalidate this entry.
    pub fn has_validator(&self) -> bool {
        self.headers.contains_key(header::ETAG) || self.headers.contains_key(header::LAST_MODIFIED)
    }

    /// Fresh, or stale and no longer useful (nothing to revalidate with).
    pub fn is_fresh(&self, now: SystemTime) -> bool {
        self.age(now) < self.lifetime().0
    }

    /// Evaluate the entry against request directives.
    pub fn usable_for(&self, request: &CacheControl, now: SystemTime) -> Freshness {
        if request.no_cache {
            return Freshness::Stale;
        }
        let own = self.cache_control();
        if own.no_cache {
            return Freshness::Stale;
        }
        let (mut lifetime, heuristic) = self.lifetime();
        if let Some(max_age) = request.max_age {
            lifetime = lifetime.min(Duration::from_secs(max_age));
        }
        let age = self.age(now);
        let needed = age + Duration::from_secs(request.min_fresh.unwrap_or(0));
        if needed < lifetime {
            return Freshness::Fresh { age, heuristic };
        }
        if let Some(max_stale) = request.max_stale {
            if !own.requires_revalidation() {
                let tolerance = max_stale.map(Duration::from_secs);
                let overdue = age.saturating_sub(lifetime);
                if tolerance.map(|t| overdue <= t).unwrap_or(true) {
                    return Freshness::StaleAcceptable { age };
                }
            }
        }
        Freshness::Stale
    }

    /// Fold a 304's headers into this entry.
    pub fn refreshed(&self, not_modified: &HeaderMap, request_time: SystemTime, response_time: SystemTime) -> Self {
        let mut headers = self.headers.clone();
        for name in not_modified.keys() {
            if *name == header::CONTENT_LENGTH || *name == header::TRANSFER_ENCODING {
                continue;
            }
            headers.remove(name);
            for value in not_modified.get_all(name) {
                headers.append(name.clone(), value.clone());
            }
        }
        headers.remove(header::AGE);
        Self {
            headers,
            request_time,
            response_time,
            ..self.clone()
        }
    }

    /// Build a response from this entry; `with_body` is false for HEAD.
    pub async fn to_response(&self, now: SystemTime, with_body: bool) -> io::Result<Response<Body>> {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers.clone();
        let age = self.age(now);
        let headers = response.headers_mut();
        headers.insert(header::AGE, HeaderValue::from(age.as_secs()));
        let (lifetime, heuristic) = self.lifetime();
        if heuristic && age > HEURISTIC_CAP {
            headers.append(
                header::WARNING,
                HeaderValue::from_static("113 - \"Heuristic Expiration\""),
            );
        }
        if age >= lifetime {
            headers.append(
                header::WARNING,
                HeaderValue::from_static("110 - \"Response is Stale\""),
            );
        }
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(self.resource.len()));
        if with_body {
            *response.body_mut() = Body::from(self.resource.load().await?);
        }
        Ok(response)
    }
}

/// How a stored entry relates to a request's freshness requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh { age: Duration, heuristic: bool },
    StaleAcceptable { age: Duration },
    Stale,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::validators::date_value;

    fn entry(cache_control: &str, age_secs: u64) -> (CacheEntry, SystemTime) {
        let stored = SystemTime::now() - Duration::from_secs(age_secs);
        let mut headers = HeaderMap::new();
        headers.insert(header::DATE, date_value(stored));
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_str(cache_control).unwrap());
        headers.insert(header::ETAG, HeaderValue::from_static("\"v1\""));
        let entry = CacheEntry {
            status: StatusCode::OK,
            headers,
            resource: Resource::Memory(Bytes::from_static(b"hello")),
            request_time: stored,
            response_time: stored,
            vary: VaryKey::default(),
        };
        (entry, SystemTime::now())
    }

    #[test]
    fn test_fresh_within_max_age() {
        let (entry, now) = entry("max-age=60", 10);
        assert!(matches!(
            entry.usable_for(&CacheControl::default(), now),
            Freshness::Fresh { heuristic: false, .. }
        ));
        let strict = CacheControl::parse("max-age=5");
        assert_eq!(entry.usable_for(&strict, now), Freshness::Stale);
        let min_fresh = CacheControl::parse("min-fresh=55");
        assert_eq!(entry.usable_for(&min_fresh, now), Freshness::Stale);
    }

    #[test]
    fn test_max_stale_respects_must_revalidate() {
        let (entry, now) = entry("max-age=10", 30);
        let lenient = CacheControl::parse("max-stale=60");
        assert!(matches!(entry.usable_for(&lenient, now), Freshness::StaleAcceptable { .. }));

        let (strict, now) = self::entry("max-age=10, must-revalidate", 30);
        assert_eq!(strict.usable_for(&lenient, now), Freshness::Stale);
    }

    #[test]
    fn test_refresh_merges_headers() {
        let (entry, now) = entry("max-age=10", 30);
        let mut update = HeaderMap::new();
        update.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=600"));
        update.insert(header::DATE, date_value(now));
        let refreshed = entry.refreshed(&update, now, now);
        assert_eq!(refreshed.headers[header::CACHE_CONTROL], "max-age=600");
        assert_eq!(refreshed.headers[header::ETAG], "\"v1\"");
        assert!(refreshed.is_fresh(now));
    }

    #[tokio::test]
    async fn test_response_carries_age() {
        let (entry, now) = entry("max-age=60", 10);
        let response = entry.to_response(now, false).await.unwrap();
        let age: u64 = response.headers()[header::AGE].to_str().unwrap().parse().unwrap();
        assert!((10..=11).contains(&age));
        assert_eq!(response.headers()[header::CONTENT_LENGTH], "5");
        assert!(response.headers().get(header::WARNING).is_none());
    }
}
