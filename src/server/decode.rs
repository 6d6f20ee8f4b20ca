//! HTTP/1.1 request decoding: heads with `httparse`, bodies by
//! content-length or chunked framing.

use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, Uri, Version};
use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use crate::exchange::RawHead;

/// Largest request head accepted.
pub const MAX_HEAD_BYTES: usize = 8 * 1024;
/// Most header fields accepted in one head.
pub const MAX_HEADERS: usize = 128;
/// Longest chunk-size or trailer line accepted.
const MAX_LINE: usize = 4 * 1024;

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("request head exceeds 8 KiB or 128 fields")]
    HeadTooLarge,

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("unsupported transfer coding: {0}")]
    UnsupportedCoding(String),
}

/// How the request body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Empty,
    Length(u64),
    Chunked,
}

#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
    pub body: BodyKind,
    pub keep_alive: bool,
    pub expect_continue: bool,
    pub raw: RawHead,
}

fn header_has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

fn body_kind(headers: &mut HeaderMap) -> Result<BodyKind, DecodeError> {
    if headers.contains_key(header::TRANSFER_ENCODING) {
        let codings: Vec<String> = headers
            .get_all(header::TRANSFER_ENCODING)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .collect();
        return match codings.as_slice() {
            [only] if only == "chunked" => {
                // Transfer-Encoding overrides Content-Length.
                headers.remove(header::CONTENT_LENGTH);
                Ok(BodyKind::Chunked)
            }
            _ => Err(DecodeError::UnsupportedCoding(codings.join(", "))),
        };
    }

    let mut length: Option<u64> = None;
    for value in headers.get_all(header::CONTENT_LENGTH) {
        let parsed = value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| DecodeError::Malformed("invalid Content-Length".into()))?;
        if length.is_some_and(|l| l != parsed) {
            return Err(DecodeError::Malformed("conflicting Content-Length".into()));
        }
        length = Some(parsed);
    }
    Ok(match length {
        Some(0) | None => BodyKind::Empty,
        Some(n) => BodyKind::Length(n),
    })
}

/// Parse a request head from the front of `buf`.
///
/// Returns `Ok(None)` until a complete head has arrived; consumed bytes are
/// split off `buf`.
pub fn parse_head(buf: &mut BytesMut) -> Result<Option<RequestHead>, DecodeError> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut slots);
    let consumed = match request.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => {
            if buf.len() > MAX_HEAD_BYTES {
                return Err(DecodeError::HeadTooLarge);
            }
            return Ok(None);
        }
        Err(httparse::Error::TooManyHeaders) => return Err(DecodeError::HeadTooLarge),
        Err(e) => return Err(DecodeError::Malformed(e.to_string())),
    };
    if consumed > MAX_HEAD_BYTES {
        return Err(DecodeError::HeadTooLarge);
    }

    let method = request
        .method
        .and_then(|m| Method::from_bytes(m.as_bytes()).ok())
        .ok_or_else(|| DecodeError::Malformed("invalid method".into()))?;
    let uri: Uri = request
        .path
        .unwrap_or("/")
        .parse()
        .map_err(|_| DecodeError::Malformed("invalid request target".into()))?;
    let version = match request.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut headers = HeaderMap::with_capacity(request.headers.len());
    for h in request.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| DecodeError::Malformed(format!("invalid header name {:?}", h.name)))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|_| DecodeError::Malformed(format!("invalid value for {}", name)))?;
        headers.append(name, value);
    }
    let raw = RawHead(buf.split_to(consumed).freeze());

    let body = body_kind(&mut headers)?;
    let keep_alive = match version {
        Version::HTTP_10 => header_has_token(&headers, header::CONNECTION, "keep-alive"),
        _ => !header_has_token(&headers, header::CONNECTION, "close"),
    };
    let expect_continue = version == Version::HTTP_11
        && body != BodyKind::Empty
        && header_has_token(&headers, header::EXPECT, "100-continue");

    Ok(Some(RequestHead {
        method,
        uri,
        version,
        headers,
        body,
        keep_alive,
        expect_continue,
        raw,
    }))
}

/// Result of one decode step.
#[derive(Debug, PartialEq)]
pub enum Decoded {
    Data(Bytes),
    NeedMore,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Chunk {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
    Done,
}

#[derive(Debug)]
enum Framing {
    Length(u64),
    Chunked(Chunk),
}

/// Incremental body decoder for one request.
#[derive(Debug)]
pub struct BodyDecoder {
    framing: Framing,
}

/// Split one CRLF-terminated line off `buf`.
fn take_line(buf: &mut BytesMut) -> Result<Option<Bytes>, DecodeError> {
    match buf.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => {
            let line = buf.split_to(pos).freeze();
            buf.advance(2);
            Ok(Some(line))
        }
        None if buf.len() > MAX_LINE => Err(DecodeError::Malformed("chunk line too long".into())),
        None => Ok(None),
    }
}

fn chunk_size(line: &[u8]) -> Result<u64, DecodeError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| DecodeError::Malformed("invalid chunk size".into()))?;
    let digits = text.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(digits, 16).map_err(|_| DecodeError::Malformed("invalid chunk size".into()))
}

impl BodyDecoder {
    /// Decoder for a body of `kind`; `None` when there is no body.
    pub fn new(kind: BodyKind) -> Option<Self> {
        let framing = match kind {
            BodyKind::Empty => return None,
            BodyKind::Length(n) => Framing::Length(n),
            BodyKind::Chunked => Framing::Chunked(Chunk::Size),
        };
        Some(Self { framing })
    }

    /// Take the next piece of body from the front of `buf`.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Decoded, DecodeError> {
        match &mut self.framing {
            Framing::Length(0) => Ok(Decoded::Done),
            Framing::Length(remaining) => {
                if buf.is_empty() {
                    return Ok(Decoded::NeedMore);
                }
                let n = (*remaining).min(buf.len() as u64) as usize;
                *remaining -= n as u64;
                Ok(Decoded::Data(buf.split_to(n).freeze()))
            }
            Framing::Chunked(state) => loop {
                match *state {
                    Chunk::Size => {
                        let Some(line) = take_line(buf)? else {
                            return Ok(Decoded::NeedMore);
                        };
                        *state = match chunk_size(&line)? {
                            0 => Chunk::Trailers,
                            n => Chunk::Data(n),
                        };
                    }
                    Chunk::Data(remaining) => {
                        if buf.is_empty() {
                            return Ok(Decoded::NeedMore);
                        }
                        let n = remaining.min(buf.len() as u64) as usize;
                        let left = remaining - n as u64;
                        *state = if left == 0 { Chunk::DataEnd } else { Chunk::Data(left) };
                        return Ok(Decoded::Data(buf.split_to(n).freeze()));
                    }
                    Chunk::DataEnd => {
                        if buf.len() < 2 {
                            return Ok(Decoded::NeedMore);
                        }
                        if &buf[..2] != b"\r\n" {
                            return Err(DecodeError::Malformed("missing CRLF after chunk".into()));
                        }
                        buf.advance(2);
                        *state = Chunk::Size;
                    }
                    Chunk::Trailers => {
                        let Some(line) = take_line(buf)? else {
                            return Ok(Decoded::NeedMore);
                        };
                        // Trailer fields are read and dropped.
                        if line.is_empty() {
                            *state = Chunk::Done;
                        }
                    }
                    Chunk::Done => return Ok(Decoded::Done),
                }
            },
        }
    }
}
