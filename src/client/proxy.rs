//! Connector that routes every connection through a forward HTTP proxy.
//!
//! Connections are marked as proxied, so hyper writes absolute-form request
//! targets (`GET http://host/path HTTP/1.1`) as a plain HTTP proxy expects.
//! TLS tunnelling through `CONNECT` is not attempted.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::http::Uri;
use futures_util::future::BoxFuture;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tower::Service;

use crate::error::BoxError;

#[derive(Debug, Clone)]
pub struct ProxyConnector {
    inner: HttpConnector,
    proxy: Uri,
}

impl ProxyConnector {
    pub fn new(inner: HttpConnector, proxy: Uri) -> Self {
        Self { inner, proxy }
    }

    pub fn proxy(&self) -> &Uri {
        &self.proxy
    }
}

impl Service<Uri> for ProxyConnector {
    type Response = ProxyStream;
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<ProxyStream, BoxError>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, destination: Uri) -> Self::Future {
        tracing::trace!(destination = %destination, proxy = %self.proxy, "Connecting via proxy");
        let connecting = self.inner.call(self.proxy.clone());
        Box::pin(async move { Ok(ProxyStream(connecting.await?)) })
    }
}

/// A TCP stream to the proxy.
#[derive(Debug)]
pub struct ProxyStream(TokioIo<TcpStream>);

impl Connection for ProxyStream {
    fn connected(&self) -> Connected {
        self.0.connected().proxy(true)
    }
}

impl Read for ProxyStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl Write for ProxyStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}
