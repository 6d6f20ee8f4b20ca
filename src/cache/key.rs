//! Cache keys: normalized URI plus the request's values for `Vary` headers.

use axum::http::{HeaderMap, HeaderName, HeaderValue, Uri};
use url::Url;

use crate::exchange::HttpHost;

/// Normalized absolute URI used as the primary key.
///
/// `HEAD` shares entries with `GET`; other methods are never looked up.
pub fn primary_key(target: &HttpHost, uri: &Uri) -> String {
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let raw = format!("{}://{}{}", target.scheme, target.key(), path);
    match Url::parse(&raw) {
        Ok(mut url) => {
            url.set_fragment(None);
            url.to_string()
        }
        Err(_) => raw,
    }
}

/// Request header values captured for each `Vary` name of a response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VaryKey {
    fields: Vec<(HeaderName, Vec<HeaderValue>)>,
}

impl VaryKey {
    /// Capture `request_headers` for the names listed in a response `Vary`.
    /// Returns `None` for `Vary: *`.
    pub fn capture(response_headers: &HeaderMap, request_headers: &HeaderMap) -> Option<Self> {
        let names = vary_names(response_headers)?;
        let fields = names
            .into_iter()
            .map(|name| {
                let values = request_headers.get_all(&name).iter().cloned().collect();
                (name, values)
            })
            .collect();
        Some(Self { fields })
    }

    /// Whether a new request selects the same variant.
    pub fn matches(&self, request_headers: &HeaderMap) -> bool {
        self.fields.iter().all(|(name, values)| {
            let current: Vec<_> = request_headers.get_all(name).iter().collect();
            current.len() == values.len()
                && current
                    .iter()
                    .zip(values)
                    .all(|(a, b)| normalize(a) == normalize(b))
        })
    }
}

fn normalize(value: &HeaderValue) -> String {
    value
        .to_str()
        .map(|s| s.split_whitespace().collect::<Vec<_>>().join(" "))
        .unwrap_or_default()
}

/// Names listed in a response's `Vary` headers; `None` for `*`.
pub fn vary_names(headers: &HeaderMap) -> Option<Vec<HeaderName>> {
    let mut names = Vec::new();
    for value in headers.get_all(axum::http::header::VARY) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for name in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            if name == "*" {
                return None;
            }
            if let Ok(name) = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes()) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
    }
    Some(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;

    #[test]
    fn test_primary_key_normalizes() {
        let target = HttpHost::new("http", "Example.COM", Some(80));
        let a = primary_key(&target, &"/a/./b/../c?x=1".parse().unwrap());
        let b = primary_key(&HttpHost::new("http", "example.com", None), &"/a/c?x=1".parse().unwrap());
        assert_eq!(a, b);
        assert_eq!(a, "http://example.com/a/c?x=1");
    }

    #[test]
    fn test_vary_selects_variant() {
        let mut response = HeaderMap::new();
        response.insert(header::VARY, HeaderValue::from_static("Accept-Encoding"));
        let mut request = HeaderMap::new();
        request.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));

        let key = VaryKey::capture(&response, &request).unwrap();
        assert!(key.matches(&request));
        request.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("br"));
        assert!(!key.matches(&request));
        request.remove(header::ACCEPT_ENCODING);
        assert!(!key.matches(&request));
    }

    #[test]
    fn test_vary_star_is_uncacheable() {
        let mut response = HeaderMap::new();
        response.insert(header::VARY, HeaderValue::from_static("*"));
        assert!(VaryKey::capture(&response, &HeaderMap::new()).is_none());
    }
}
