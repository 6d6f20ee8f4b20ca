//! Body wrappers used by the stages.
//!
//! All wrappers keep `axum::body::Body` as the outer type so stages can swap
//! bodies without changing response types.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::BodyExt;

type Guard = Box<dyn FnOnce(bool) + Send>;

/// Consume and discard a body in the background.
///
/// Without a runtime the body is simply dropped.
pub fn drain_body(body: Body) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                let mut body = body;
                while let Some(frame) = body.frame().await {
                    if frame.is_err() {
                        break;
                    }
                }
            });
        }
        Err(_) => drop(body),
    }
}

/// Runs a guard once the body reaches end of stream, fails, or is dropped.
///
/// The guard receives `true` only when the body was fully delivered.
pub struct GuardedBody {
    inner: Body,
    guard: Option<Guard>,
}

impl GuardedBody {
    pub fn wrap<F>(body: Body, guard: F) -> Body
    where
        F: FnOnce(bool) + Send + 'static,
    {
        if body.is_end_stream() {
            guard(true);
            return body;
        }
        Body::new(Self {
            inner: body,
            guard: Some(Box::new(guard)),
        })
    }

    fn fire(&mut self, completed: bool) {
        if let Some(guard) = self.guard.take() {
            guard(completed);
        }
    }
}

impl HttpBody for GuardedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(None) => this.fire(true),
            Poll::Ready(Some(Err(_))) => this.fire(false),
            Poll::Ready(Some(Ok(_))) if this.inner.is_end_stream() => this.fire(true),
            _ => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for GuardedBody {
    fn drop(&mut self) {
        self.fire(false);
    }
}

/// Tees data frames into a buffer and hands the full payload to a callback
/// once the body completes. Gives up silently past `limit` bytes.
pub struct CaptureBody {
    inner: Body,
    buf: BytesMut,
    limit: usize,
    overflowed: bool,
    on_complete: Option<Box<dyn FnOnce(Bytes) + Send>>,
}

impl CaptureBody {
    pub fn wrap<F>(body: Body, limit: usize, on_complete: F) -> Body
    where
        F: FnOnce(Bytes) + Send + 'static,
    {
        Body::new(Self {
            inner: body,
            buf: BytesMut::new(),
            limit,
            overflowed: false,
            on_complete: Some(Box::new(on_complete)),
        })
    }

    fn finish(&mut self) {
        if self.overflowed {
            return;
        }
        if let Some(cb) = self.on_complete.take() {
            cb(std::mem::take(&mut self.buf).freeze());
        }
    }
}

impl HttpBody for CaptureBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
        let this = self.get_mut();
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    if !this.overflowed {
                        if this.buf.len() + data.len() > this.limit {
                            this.overflowed = true;
                            this.buf = BytesMut::new();
                        } else {
                            this.buf.extend_from_slice(data);
                        }
                    }
                }
                if this.inner.is_end_stream() {
                    this.finish();
                }
            }
            Poll::Ready(None) => this.finish(),
            Poll::Ready(Some(Err(_))) => {
                this.overflowed = true;
                this.on_complete = None;
            }
            Poll::Pending => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

/// Incremental byte transformation applied by [`TransformBody`].
pub trait Transform: Send + Unpin + 'static {
    /// Transform one data chunk. May return an empty buffer.
    fn data(&mut self, chunk: &[u8]) -> io::Result<Bytes>;

    /// Flush remaining output at end of stream.
    fn finish(&mut self) -> io::Result<Bytes>;
}

/// Streams a body through a [`Transform`]. Trailers pass through untouched.
pub struct TransformBody<T> {
    inner: Body,
    transform: T,
    finished: bool,
    trailers: Option<Frame<Bytes>>,
}

impl<T: Transform> TransformBody<T> {
    pub fn wrap(body: Body, transform: T) -> Body {
        Body::new(Self {
            inner: body,
            transform,
            finished: false,
            trailers: None,
        })
    }
}

impl<T: Transform> HttpBody for TransformBody<T> {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Self::Error>>> {
        let this = self.get_mut();
        loop {
            if this.finished {
                return Poll::Ready(this.trailers.take().map(Ok));
            }
            match Pin::new(&mut this.inner).poll_frame(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Some(Err(e))) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(e)));
                }
                Poll::Ready(Some(Ok(frame))) => match frame.into_data() {
                    Ok(data) => match this.transform.data(&data) {
                        Ok(out) if out.is_empty() => continue,
                        Ok(out) => return Poll::Ready(Some(Ok(Frame::data(out)))),
                        Err(e) => {
                            this.finished = true;
                            return Poll::Ready(Some(Err(axum::Error::new(e))));
                        }
                    },
                    Err(trailers) => {
                        this.trailers = Some(trailers);
                    }
                },
                Poll::Ready(None) => {
                    this.finished = true;
                    match this.transform.finish() {
                        Ok(out) if out.is_empty() => continue,
                        Ok(out) => return Poll::Ready(Some(Ok(Frame::data(out)))),
                        Err(e) => return Poll::Ready(Some(Err(axum::Error::new(e)))),
                    }
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.finished && self.trailers.is_none()
    }
}
