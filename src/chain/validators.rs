//! Entity tags, tag lists and HTTP dates.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use md5::{Digest, Md5};

use crate::chain::dispatch::ResourceState;

/// Suffix marking a gzip-coded variant of a representation.
pub const GZIP_SUFFIX: &str = "-gzip";

/// An entity tag, strong or weak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityTag {
    pub weak: bool,
    pub tag: String,
}

impl EntityTag {
    pub fn strong(tag: impl Into<String>) -> Self {
        Self {
            weak: false,
            tag: tag.into(),
        }
    }

    pub fn weak(tag: impl Into<String>) -> Self {
        Self {
            weak: true,
            tag: tag.into(),
        }
    }

    /// Parse `"abc"` or `W/"abc"`.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let (weak, rest) = match value.strip_prefix("W/") {
            Some(rest) => (true, rest),
            None => (false, value),
        };
        let inner = rest.strip_prefix('"')?.strip_suffix('"')?;
        if inner.contains('"') {
            return None;
        }
        Some(Self {
            weak,
            tag: inner.to_string(),
        })
    }

    /// Strong comparison: both strong and identical.
    pub fn strong_eq(&self, other: &EntityTag) -> bool {
        !self.weak && !other.weak && self.tag == other.tag
    }

    /// Weak comparison: identical opaque tags.
    pub fn weak_eq(&self, other: &EntityTag) -> bool {
        self.tag == other.tag
    }

    /// The same tag marked as the gzip-coded variant.
    pub fn gzip_variant(&self) -> Self {
        Self {
            weak: self.weak,
            tag: format!("{}{}", self.tag, GZIP_SUFFIX),
        }
    }

    /// The tag without a gzip variant suffix.
    pub fn identity_variant(&self) -> Self {
        Self {
            weak: self.weak,
            tag: self
                .tag
                .strip_suffix(GZIP_SUFFIX)
                .unwrap_or(&self.tag)
                .to_string(),
        }
    }

    pub fn to_header(&self) -> Option<HeaderValue> {
        HeaderValue::from_str(&self.to_string()).ok()
    }
}

impl fmt::Display for EntityTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.weak {
            write!(f, "W/\"{}\"", self.tag)
        } else {
            write!(f, "\"{}\"", self.tag)
        }
    }
}

/// Compute the strong tag for a resource's current representation.
///
/// Hashes the version, the content type and the request's values for each of
/// the resource's `Vary` headers. Returns `None` for unversioned resources.
pub fn compute_etag(resource: &ResourceState, request_headers: &HeaderMap) -> Option<EntityTag> {
    let version = resource.version.as_deref()?;
    let mut hasher = Md5::new();
    hasher.update(version.as_bytes());
    hasher.update([0u8]);
    if let Some(content_type) = &resource.content_type {
        hasher.update(content_type.as_bytes());
    }
    for name in &resource.vary {
        hasher.update([0u8]);
        hasher.update(name.as_str().as_bytes());
        hasher.update(b"=");
        for value in request_headers.get_all(name) {
            hasher.update(value.as_bytes());
            hasher.update(b",");
        }
    }
    Some(EntityTag::strong(hex(&hasher.finalize())))
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
        let _ = write!(s, "{:02x}", b);
        s
    })
}

/// Parsed `If-Match` / `If-None-Match` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagList {
    Any,
    Tags(Vec<EntityTag>),
}

impl TagList {
    /// Any listed tag weakly matches `current`, ignoring gzip variants.
    pub fn matches_weak(&self, current: &EntityTag) -> bool {
        match self {
            TagList::Any => true,
            TagList::Tags(tags) => {
                let current = current.identity_variant();
                tags.iter()
                    .any(|t| t.identity_variant().weak_eq(&current))
            }
        }
    }

    /// Any listed tag strongly matches `current`.
    pub fn matches_strong(&self, current: &EntityTag) -> bool {
        match self {
            TagList::Any => true,
            TagList::Tags(tags) => tags.iter().any(|t| t.strong_eq(current)),
        }
    }
}

/// Read a tag list header, merging repeated header lines.
/// Malformed members are skipped.
pub fn header_tags(headers: &HeaderMap, name: &HeaderName) -> Option<TagList> {
    let mut tags = Vec::new();
    let mut seen = false;
    for value in headers.get_all(name) {
        seen = true;
        let Ok(value) = value.to_str() else {
            continue;
        };
        if value.trim() == "*" {
            return Some(TagList::Any);
        }
        tags.extend(split_tags(value).into_iter().filter_map(EntityTag::parse));
    }
    seen.then_some(TagList::Tags(tags))
}

/// Split a comma-separated tag list; commas inside quotes are kept.
fn split_tags(value: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, c) in value.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(value[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(value[start..].trim());
    parts.retain(|p| !p.is_empty());
    parts
}

/// Parse an HTTP date header.
pub fn header_date(headers: &HeaderMap, name: &HeaderName) -> Option<SystemTime> {
    let value = headers.get(name)?.to_str().ok()?;
    httpdate::parse_http_date(value).ok()
}

/// Format a time as an HTTP date header value.
pub fn date_value(at: SystemTime) -> HeaderValue {
    HeaderValue::from_str(&httpdate::fmt_http_date(at))
        .unwrap_or_else(|_| HeaderValue::from_static("Thu, 01 Jan 1970 00:00:00 GMT"))
}

/// Drop sub-second precision; HTTP dates carry whole seconds.
pub fn truncate_secs(at: SystemTime) -> SystemTime {
    match at.duration_since(UNIX_EPOCH) {
        Ok(d) => UNIX_EPOCH + Duration::from_secs(d.as_secs()),
        Err(_) => at,
    }
}
