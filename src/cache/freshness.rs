//! Cache-Control parsing and freshness arithmetic.

use std::time::{Duration, SystemTime};

use axum::http::{header, HeaderMap};

use crate::chain::validators::header_date;

/// Cap on heuristic freshness.
pub const HEURISTIC_CAP: Duration = Duration::from_secs(24 * 60 * 60);

/// Parsed `Cache-Control` directives from a request or response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    pub no_store: bool,
    pub no_cache: bool,
    pub no_transform: bool,
    pub only_if_cached: bool,
    pub private: bool,
    pub public: bool,
    pub must_revalidate: bool,
    pub proxy_revalidate: bool,
    pub max_age: Option<u64>,
    pub s_maxage: Option<u64>,
    pub min_fresh: Option<u64>,
    /// `Some(None)` for a bare `max-stale` (any staleness).
    pub max_stale: Option<Option<u64>>,
}

impl CacheControl {
    /// Parse every `Cache-Control` line; `Pragma: no-cache` counts as `no-cache`.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut cc = Self::default();
        for value in headers.get_all(header::CACHE_CONTROL) {
            if let Ok(value) = value.to_str() {
                cc.merge(value);
            }
        }
        let pragma_no_cache = headers
            .get_all(header::PRAGMA)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.to_ascii_lowercase().contains("no-cache"));
        if pragma_no_cache && headers.get(header::CACHE_CONTROL).is_none() {
            cc.no_cache = true;
        }
        cc
    }

    pub fn parse(value: &str) -> Self {
        let mut cc = Self::default();
        cc.merge(value);
        cc
    }

    fn merge(&mut self, value: &str) {
        for directive in split_directives(value) {
            let (name, arg) = match directive.split_once('=') {
                Some((n, a)) => (n.trim(), Some(a.trim().trim_matches('"'))),
                None => (directive.trim(), None),
            };
            let seconds = arg.and_then(|a| a.parse::<u64>().ok());
            match name.to_ascii_lowercase().as_str() {
                "no-store" => self.no_store = true,
                // `no-cache="field"` only restricts the named fields.
                "no-cache" if arg.is_none() => self.no_cache = true,
                "no-transform" => self.no_transform = true,
                "only-if-cached" => self.only_if_cached = true,
                "private" => self.private = true,
                "public" => self.public = true,
                "must-revalidate" => self.must_revalidate = true,
                "proxy-revalidate" => self.proxy_revalidate = true,
                "max-age" => self.max_age = seconds.or(Some(0)),
                "s-maxage" => self.s_maxage = seconds.or(Some(0)),
                "min-fresh" => self.min_fresh = seconds,
                "max-stale" => self.max_stale = Some(seconds),
                _ => {}
            }
        }
    }

    /// Stale entries must be revalidated before reuse.
    pub fn requires_revalidation(&self) -> bool {
        self.must_revalidate || self.proxy_revalidate || self.s_maxage.is_some()
    }
}

fn split_directives(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in value.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&value[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&value[start..]);
    parts.into_iter().map(str::trim).filter(|p| !p.is_empty()).collect()
}

/// How long a response stays fresh, and whether that was guessed.
///
/// Order: `s-maxage`, `max-age`, `Expires - Date`, then 10% of
/// `Date - Last-Modified` capped at a day.
pub fn freshness_lifetime(headers: &HeaderMap, cc: &CacheControl) -> (Duration, bool) {
    if let Some(secs) = cc.s_maxage.or(cc.max_age) {
        return (Duration::from_secs(secs), false);
    }
    let date = header_date(headers, &header::DATE);
    if headers.contains_key(header::EXPIRES) {
        // An unparseable Expires means already expired.
        let expires = header_date(headers, &header::EXPIRES);
        let lifetime = match (expires, date) {
            (Some(expires), Some(date)) => expires.duration_since(date).unwrap_or_default(),
            _ => Duration::ZERO,
        };
        return (lifetime, false);
    }
    if let (Some(modified), Some(date)) = (header_date(headers, &header::LAST_MODIFIED), date) {
        let since = date.duration_since(modified).unwrap_or_default();
        return ((since / 10).min(HEURISTIC_CAP), true);
    }
    (Duration::ZERO, true)
}

/// Age of a stored response now, per the corrected-age calculation.
pub fn current_age(
    headers: &HeaderMap,
    request_time: SystemTime,
    response_time: SystemTime,
    now: SystemTime,
) -> Duration {
    let date = header_date(headers, &header::DATE).unwrap_or(response_time);
    let apparent = response_time.duration_since(date).unwrap_or_default();
    let age_value = headers
        .get(header::AGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or_default();
    let delay = response_time.duration_since(request_time).unwrap_or_default();
    let initial = apparent.max(age_value + delay);
    let resident = now.duration_since(response_time).unwrap_or_default();
    initial + resident
}
