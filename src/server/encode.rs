//! HTTP/1.1 response encoding.

use std::time::SystemTime;

use axum::http::{header, response, HeaderValue, Method, StatusCode};
use bytes::{BufMut, BytesMut};

/// How the response body goes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// No body bytes are written.
    None,
    Length(u64),
    Chunked,
}

/// Responses that never carry a body (RFC 7230 §3.3.3).
pub fn bodyless(method: &Method, status: StatusCode) -> bool {
    *method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

/// `HTTP/1.1 100 Continue` and friends.
pub fn encode_interim(status: StatusCode, dst: &mut BytesMut) {
    status_line(status, dst);
    dst.put_slice(b"\r\n");
}

fn status_line(status: StatusCode, dst: &mut BytesMut) {
    dst.put_slice(b"HTTP/1.1 ");
    dst.put_slice(status.as_str().as_bytes());
    dst.put_u8(b' ');
    dst.put_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    dst.put_slice(b"\r\n");
}

fn declared_length(parts: &response::Parts) -> Option<u64> {
    parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Write the status line and headers; pick the body framing.
///
/// `exact_len` is the body's exact size when known. Framing headers set by
/// the chain are replaced by ours, and `Connection: close` is added when
/// the connection ends after this response.
pub fn encode_head(
    parts: &mut response::Parts,
    method: &Method,
    exact_len: Option<u64>,
    close: bool,
    dst: &mut BytesMut,
) -> Framing {
    let headers = &mut parts.headers;
    headers.remove(header::TRANSFER_ENCODING);
    headers.remove(header::CONNECTION);
    headers.remove("keep-alive");

    let framing = if bodyless(method, parts.status) {
        if parts.status == StatusCode::NO_CONTENT || parts.status.is_informational() {
            headers.remove(header::CONTENT_LENGTH);
        }
        Framing::None
    } else if let Some(n) = exact_len {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(n));
        Framing::Length(n)
    } else {
        headers.remove(header::CONTENT_LENGTH);
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        Framing::Chunked
    };
    // HEAD keeps the Content-Length the chain computed for the GET.
    if *method == Method::HEAD && framing == Framing::None && !headers.contains_key(header::CONTENT_LENGTH) {
        if let Some(n) = exact_len.filter(|n| *n > 0) {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(n));
        }
    }

    if !headers.contains_key(header::DATE) {
        if let Ok(date) = HeaderValue::from_str(&httpdate::fmt_http_date(SystemTime::now())) {
            headers.insert(header::DATE, date);
        }
    }
    if close {
        headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    }

    status_line(parts.status, dst);
    for (name, value) in headers.iter() {
        dst.put_slice(name.as_str().as_bytes());
        dst.put_slice(b": ");
        dst.put_slice(value.as_bytes());
        dst.put_slice(b"\r\n");
    }
    dst.put_slice(b"\r\n");
    framing
}

/// Content-Length the head will declare, from the body or the chain.
pub fn body_length(parts: &response::Parts, size_hint: Option<u64>) -> Option<u64> {
    size_hint.or_else(|| declared_length(parts))
}

/// Frame one chunk of body data.
pub fn encode_chunk(data: &[u8], framing: Framing, dst: &mut BytesMut) {
    match framing {
        Framing::None => {}
        Framing::Length(_) => dst.put_slice(data),
        Framing::Chunked => {
            if data.is_empty() {
                return;
            }
            dst.put_slice(format!("{:x}\r\n", data.len()).as_bytes());
            dst.put_slice(data);
            dst.put_slice(b"\r\n");
        }
    }
}

/// Terminate the body.
pub fn encode_end(framing: Framing, dst: &mut BytesMut) {
    if framing == Framing::Chunked {
        dst.put_slice(b"0\r\n\r\n");
    }
}
