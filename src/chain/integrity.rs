//! `Content-MD5` validation of request bodies.
//!
//! The body is digested as the consumer reads it. At end of stream a
//! mismatch turns into a body error carrying [`ChainError::DigestMismatch`],
//! so the consumer never sees a clean EOF for a corrupted body.

use std::io;

use axum::body::Body;
use axum::http::{HeaderValue, Request, Response};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use md5::{Digest, Md5};

use crate::chain::body::{Transform, TransformBody};
use crate::chain::{Next, Stage};
use crate::error::{ChainError, ChainResult};
use crate::exchange::{HttpHost, RequestContext};

/// Header name; not among the `http` crate's constants.
pub const CONTENT_MD5: &str = "content-md5";

/// Digests a body and checks it against an expected MD5.
pub struct DigestCheck {
    hasher: Md5,
    expected: [u8; 16],
}

impl DigestCheck {
    /// Parse a `Content-MD5` value (base64 of the 16-byte digest).
    pub fn from_header(value: &HeaderValue) -> Option<Self> {
        let decoded = STANDARD.decode(value.as_bytes().trim_ascii()).ok()?;
        let expected: [u8; 16] = decoded.try_into().ok()?;
        Some(Self {
            hasher: Md5::new(),
            expected,
        })
    }
}

impl Transform for DigestCheck {
    fn data(&mut self, chunk: &[u8]) -> io::Result<Bytes> {
        self.hasher.update(chunk);
        Ok(Bytes::copy_from_slice(chunk))
    }

    fn finish(&mut self) -> io::Result<Bytes> {
        let actual: [u8; 16] = std::mem::take(&mut self.hasher).finalize().into();
        if actual != self.expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                ChainError::DigestMismatch {
                    expected: STANDARD.encode(self.expected),
                    actual: STANDARD.encode(actual),
                },
            ));
        }
        Ok(Bytes::new())
    }
}

/// Request-body integrity stage.
#[derive(Debug, Default)]
pub struct Integrity;

impl Integrity {
    pub fn new() -> Self {
        Self
    }
}

impl Stage for Integrity {
    fn name(&self) -> &'static str {
        "integrity"
    }

    fn execute<'a>(
        &'a self,
        target: &'a HttpHost,
        request: Request<Body>,
        ctx: &'a mut RequestContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, ChainResult<Response<Body>>> {
        Box::pin(async move {
            let Some(value) = request.headers().get(CONTENT_MD5) else {
                return next.run(target, request, ctx).await;
            };
            let Some(check) = DigestCheck::from_header(value) else {
                return Err(ChainError::BadRequest("malformed Content-MD5".into()));
            };
            tracing::trace!(request_id = %ctx.request_id, "Validating request digest");
            let (parts, body) = request.into_parts();
            let request = Request::from_parts(parts, TransformBody::wrap(body, check));
            next.run(target, request, ctx).await
        })
    }
}
