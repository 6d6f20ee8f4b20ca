//! Content-coding transcoding.
//!
//! # Responsibilities
//! - Gunzip request bodies sent with `Content-Encoding: gzip`
//! - Gunzip gzip responses for clients that do not accept gzip
//! - Gzip compressible responses for clients that do
//!
//! Every transcoded representation loses `Content-Length` and `Content-MD5`
//! and gains `Warning: 214`.

use std::io::{self, Write};

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use bytes::Bytes;
use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;
use futures_util::future::BoxFuture;
use http_body::Body as _;

use crate::cache::CacheControl;
use crate::chain::body::{Transform, TransformBody};
use crate::chain::dispatch::Forwarded;
use crate::chain::validators::EntityTag;
use crate::chain::{Next, Stage};
use crate::config::CompressionConfig;
use crate::error::ChainResult;
use crate::exchange::{HttpHost, RequestContext};

fn transformed() -> HeaderValue {
    HeaderValue::from_static("214 - \"Transformation Applied\"")
}

/// Streaming gzip compressor.
pub struct Gzip {
    encoder: GzEncoder<Vec<u8>>,
}

impl Gzip {
    pub fn new(level: u32) -> Self {
        Self {
            encoder: GzEncoder::new(Vec::new(), Compression::new(level.min(9))),
        }
    }
}

impl Transform for Gzip {
    fn data(&mut self, chunk: &[u8]) -> io::Result<Bytes> {
        self.encoder.write_all(chunk)?;
        Ok(Bytes::from(std::mem::take(self.encoder.get_mut())))
    }

    fn finish(&mut self) -> io::Result<Bytes> {
        self.encoder.try_finish()?;
        Ok(Bytes::from(std::mem::take(self.encoder.get_mut())))
    }
}

/// Streaming gzip decompressor.
pub struct Gunzip {
    decoder: GzDecoder<Vec<u8>>,
}

impl Gunzip {
    pub fn new() -> Self {
        Self {
            decoder: GzDecoder::new(Vec::new()),
        }
    }
}

impl Default for Gunzip {
    fn default() -> Self {
        Self::new()
    }
}

impl Transform for Gunzip {
    fn data(&mut self, chunk: &[u8]) -> io::Result<Bytes> {
        self.decoder.write_all(chunk)?;
        Ok(Bytes::from(std::mem::take(self.decoder.get_mut())))
    }

    fn finish(&mut self) -> io::Result<Bytes> {
        self.decoder.try_finish()?;
        Ok(Bytes::from(std::mem::take(self.decoder.get_mut())))
    }
}

/// Whether `Accept-Encoding` admits gzip with a non-zero q-value.
pub fn accepts_gzip(headers: &HeaderMap) -> bool {
    let mut gzip = None;
    let mut any = None;
    for value in headers.get_all(header::ACCEPT_ENCODING) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for item in value.split(',') {
            let mut params = item.split(';');
            let coding = params.next().unwrap_or("").trim().to_ascii_lowercase();
            let q = params
                .filter_map(|p| p.trim().strip_prefix("q="))
                .find_map(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            match coding.as_str() {
                "gzip" | "x-gzip" => gzip = Some(q),
                "*" => any = Some(q),
                _ => {}
            }
        }
    }
    gzip.or(any).map(|q| q > 0.0).unwrap_or(false)
}

fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            let v = v.trim();
            v.eq_ignore_ascii_case("gzip") || v.eq_ignore_ascii_case("x-gzip")
        })
        .unwrap_or(false)
}

fn has_coding(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| !v.trim().eq_ignore_ascii_case("identity"))
        .unwrap_or(false)
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn add_vary(headers: &mut HeaderMap, name: &str) {
    let present = headers
        .get_all(header::VARY)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|v| v.trim() == "*" || v.trim().eq_ignore_ascii_case(name));
    if !present {
        if let Ok(value) = HeaderValue::from_str(name) {
            headers.append(header::VARY, value);
        }
    }
}

fn mark_transcoded(headers: &mut HeaderMap) {
    headers.remove(header::CONTENT_LENGTH);
    headers.remove("content-md5");
    headers.append(header::WARNING, transformed());
}

/// Gzip/gunzip stage.
#[derive(Debug, Clone)]
pub struct Encoding {
    config: CompressionConfig,
}

impl Encoding {
    pub fn new(config: CompressionConfig) -> Self {
        Self { config }
    }

    fn is_compressible(&self, headers: &HeaderMap) -> bool {
        let Some(content_type) = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        else {
            return false;
        };
        let essence = content_type
            .split(';')
            .next()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        self.config.compressible.iter().any(|pattern| {
            let pattern = pattern.to_ascii_lowercase();
            if let Some(prefix) = pattern.strip_suffix('*') {
                essence.starts_with(prefix)
            } else if let Some(suffix) = pattern.strip_prefix('*') {
                essence.ends_with(suffix)
            } else {
                essence == pattern
            }
        })
    }

    fn should_compress(&self, method: &Method, response: &Response<Body>) -> bool {
        let status = response.status();
        let headers = response.headers();
        if !self.config.enabled
            || *method == Method::HEAD
            || !status.is_success()
            || status == StatusCode::NO_CONTENT
            || status == StatusCode::PARTIAL_CONTENT
            || has_coding(headers)
            || response.body().is_end_stream()
            || CacheControl::from_headers(headers).no_transform
            || !self.is_compressible(headers)
        {
            return false;
        }
        content_length(headers)
            .map(|len| len > self.config.min_size as u64)
            .unwrap_or(true)
    }

    fn decode_request(&self, request: Request<Body>) -> Request<Body> {
        if !self.config.decode_requests || !is_gzip(request.headers()) {
            return request;
        }
        let (mut parts, body) = request.into_parts();
        parts.headers.remove(header::CONTENT_ENCODING);
        parts.headers.remove(header::CONTENT_LENGTH);
        parts.headers.remove("content-md5");
        Request::from_parts(parts, TransformBody::wrap(body, Gunzip::new()))
    }

    fn gunzip_response(response: Response<Body>) -> Response<Body> {
        let (mut parts, body) = response.into_parts();
        parts.headers.remove(header::CONTENT_ENCODING);
        mark_transcoded(&mut parts.headers);
        if let Some(tag) = parts
            .headers
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .and_then(EntityTag::parse)
        {
            if let Some(value) = tag.identity_variant().to_header() {
                parts.headers.insert(header::ETAG, value);
            }
        }
        add_vary(&mut parts.headers, "Accept-Encoding");
        Response::from_parts(parts, TransformBody::wrap(body, Gunzip::new()))
    }

    fn gzip_response(&self, response: Response<Body>, reused: bool) -> Response<Body> {
        let (mut parts, body) = response.into_parts();
        mark_transcoded(&mut parts.headers);
        parts
            .headers
            .insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        add_vary(&mut parts.headers, "Accept-Encoding");
        if let Some(tag) = parts
            .headers
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .and_then(EntityTag::parse)
        {
            if let Some(value) = tag.gzip_variant().to_header() {
                parts.headers.insert(header::ETAG, value);
            }
        }
        if reused && parts.status == StatusCode::OK {
            parts.status = StatusCode::NON_AUTHORITATIVE_INFORMATION;
        }
        Response::from_parts(
            parts,
            TransformBody::wrap(body, Gzip::new(self.config.level)),
        )
    }
}

impl Stage for Encoding {
    fn name(&self) -> &'static str {
        "encoding"
    }

    fn execute<'a>(
        &'a self,
        target: &'a HttpHost,
        request: Request<Body>,
        ctx: &'a mut RequestContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, ChainResult<Response<Body>>> {
        Box::pin(async move {
            let method = request.method().clone();
            let accepts = accepts_gzip(request.headers());
            let request = self.decode_request(request);

            let response = next.run(target, request, &mut *ctx).await?;

            if is_gzip(response.headers()) {
                if !accepts && method != Method::HEAD && !response.body().is_end_stream() {
                    tracing::debug!(request_id = %ctx.request_id, "Gunzipping response");
                    return Ok(Self::gunzip_response(response));
                }
                return Ok(response);
            }

            if accepts && self.should_compress(&method, &response) {
                // A response this server did not generate is now transformed.
                let reused = response.extensions().get::<Forwarded>().is_some();
                tracing::debug!(request_id = %ctx.request_id, reused, "Gzipping response");
                return Ok(self.gzip_response(response, reused));
            }
            Ok(response)
        })
    }
}
