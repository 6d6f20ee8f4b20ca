//! One HTTP/1.1 connection: a reader feeding exchanges in and a writer
//! draining responses out, in request order.
//!
//! # Data Flow
//! ```text
//! socket ─► reader ─ parse head ─► Exchange ─► PendingExchanges (arrival order)
//!              │                     │
//!              │                     └─► chain::spawn(chain) ─► submit_response
//!              └─ body bytes ─► Pending ─► Pipe ─► PipeSource (chain reads)
//!                                 ▲
//!                     pipe full: stop reading until capacity frees
//!
//! PendingExchanges head ─► attach(ChannelSink) ─► writer ─► socket
//!                                 100 Continue / final response / cancelled
//! ```
//!
//! # Design Decisions
//! - The reader never reads past a body it cannot deliver; backpressure is
//!   the pipe's capacity callback, not a poll loop
//! - `100 Continue` is sent the first time the chain asks for body bytes
//! - The per-exchange deadline wraps the chain, so a slow handler yields a
//!   504 and the connection stays usable
//! - A body the chain abandoned is read and discarded to keep framing,
//!   unless the client was never told to send it

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, Method, Request, Response, StatusCode, Uri};
use bytes::BytesMut;
use futures_util::future::BoxFuture;
use http_body::Body as _;
use http_body_util::BodyExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::chain::body::drain_body;
use crate::chain::callback::{callback_fn, spawn, FutureCallback, Outcome};
use crate::chain::ExecChain;
use crate::config::ServerConfig;
use crate::error::{ChainError, ChainResult};
use crate::exchange::pipe::Pending;
use crate::lifecycle::shutdown::triggered;
use crate::exchange::{Exchange, HttpHost, PendingExchanges, Pipe, RequestContext, ResponseSink};
use crate::observability::metrics;
use crate::server::decode::{parse_head, BodyDecoder, DecodeError, Decoded, RequestHead};
use crate::server::encode::{self, Framing};

/// Per-connection limits taken from the server configuration.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub scheme: String,
    pub header_timeout: Duration,
    pub idle_timeout: Duration,
    pub exchange_timeout: Duration,
    pub pipe_capacity: usize,
    pub max_pipelined: usize,
}

impl ConnectionSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            scheme: "http".to_string(),
            header_timeout: Duration::from_secs(config.timeouts.headers_secs),
            idle_timeout: Duration::from_secs(config.timeouts.idle_secs),
            exchange_timeout: Duration::from_secs(config.timeouts.exchange_secs),
            pipe_capacity: config.pipe.capacity,
            max_pipelined: config.listener.max_pipelined.max(1),
        }
    }
}

/// Bounds the time from request head to final response.
pub struct Deadline {
    inner: Arc<dyn ExecChain>,
    limit: Duration,
}

impl Deadline {
    pub fn new(inner: Arc<dyn ExecChain>, limit: Duration) -> Self {
        Self { inner, limit }
    }
}

impl ExecChain for Deadline {
    fn execute<'a>(
        &'a self,
        target: &'a HttpHost,
        request: Request<Body>,
        ctx: &'a mut RequestContext,
    ) -> BoxFuture<'a, ChainResult<Response<Body>>> {
        Box::pin(async move {
            let request_id = ctx.request_id;
            match tokio::time::timeout(self.limit, self.inner.execute(target, request, ctx)).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(request_id = %request_id, limit = ?self.limit, "Exchange timed out");
                    Err(ChainError::GatewayTimeout("exchange deadline exceeded".into()))
                }
            }
        })
    }
}

/// What an exchange asks the writer to do.
enum Outbound {
    Interim(StatusCode),
    Final(Response<Body>, bool),
    Cancelled,
}

struct ChannelSink(mpsc::UnboundedSender<Outbound>);

impl ResponseSink for ChannelSink {
    fn send_interim(&mut self, status: StatusCode) {
        let _ = self.0.send(Outbound::Interim(status));
    }

    fn send_response(&mut self, response: Response<Body>, close: bool) {
        let _ = self.0.send(Outbound::Final(response, close));
    }

    fn cancelled(&mut self) {
        let _ = self.0.send(Outbound::Cancelled);
    }
}

/// Resolves once the writer asked the reader to stop (or went away).
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|s| *s).await;
}

/// Serve one connection until either side closes it.
pub async fn serve_connection<S>(
    stream: S,
    peer: SocketAddr,
    local: Option<SocketAddr>,
    chain: Arc<dyn ExecChain>,
    settings: Arc<ConnectionSettings>,
    shutdown: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let queue = PendingExchanges::new();
    let (stop_tx, stop_rx) = watch::channel(false);

    let writer = tokio::spawn(write_loop(write_half, queue.clone(), stop_tx, peer));
    let mut reader = Reader {
        wire: Wire {
            io: read_half,
            buf: BytesMut::with_capacity(8 * 1024),
        },
        queue: queue.clone(),
        chain,
        settings,
        peer,
        local,
        stop: stop_rx,
        shutdown,
    };
    reader.run().await;
    queue.close();

    if let Err(e) = writer.await {
        tracing::warn!(peer_addr = %peer, error = %e, "Connection writer failed");
        queue.cancel_all();
    }
}

struct Wire<R> {
    io: ReadHalf<R>,
    buf: BytesMut,
}

enum HeadEvent {
    Head(RequestHead),
    Invalid(DecodeError),
    Closed,
}

enum BodyEnd {
    Complete,
    /// Stop reading; the connection closes after queued responses.
    Stop,
    Truncated(io::Error),
    Invalid(DecodeError),
}

struct Reader<S> {
    wire: Wire<S>,
    queue: Arc<PendingExchanges>,
    chain: Arc<dyn ExecChain>,
    settings: Arc<ConnectionSettings>,
    peer: SocketAddr,
    local: Option<SocketAddr>,
    stop: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
}

impl<S> Reader<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn run(&mut self) {
        loop {
            if !self.wait_for_pipeline_slot().await {
                return;
            }
            let head = match self.next_head().await {
                HeadEvent::Head(head) => head,
                HeadEvent::Invalid(error) => {
                    self.reject(error);
                    return;
                }
                HeadEvent::Closed => return,
            };
            if !self.start_exchange(head).await {
                return;
            }
        }
    }

    /// Hold off reading more heads while too many exchanges are queued.
    async fn wait_for_pipeline_slot(&mut self) -> bool {
        while self.queue.len() >= self.settings.max_pipelined {
            let Some(front) = self.queue.front() else {
                break;
            };
            tokio::select! {
                _ = front.finished() => {}
                _ = stopped(&mut self.stop) => return false,
            }
        }
        true
    }

    async fn next_head(&mut self) -> HeadEvent {
        let mut head_deadline: Option<tokio::time::Instant> = None;
        loop {
            match parse_head(&mut self.wire.buf) {
                Ok(Some(head)) => return HeadEvent::Head(head),
                Ok(None) => {}
                Err(error) => return HeadEvent::Invalid(error),
            }
            let idle = self.wire.buf.is_empty();
            let until = if idle {
                tokio::time::Instant::now() + self.settings.idle_timeout
            } else {
                *head_deadline
                    .get_or_insert_with(|| tokio::time::Instant::now() + self.settings.header_timeout)
            };

            let wire = &mut self.wire;
            tokio::select! {
                read = wire.io.read_buf(&mut wire.buf) => match read {
                    Ok(0) => {
                        if !wire.buf.is_empty() {
                            tracing::debug!(peer_addr = %self.peer, "Connection closed mid-head");
                        }
                        return HeadEvent::Closed;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(peer_addr = %self.peer, error = %e, "Read failed");
                        return HeadEvent::Closed;
                    }
                },
                _ = tokio::time::sleep_until(until) => {
                    tracing::debug!(peer_addr = %self.peer, idle, "Connection timed out waiting for a request head");
                    return HeadEvent::Closed;
                }
                _ = stopped(&mut self.stop) => return HeadEvent::Closed,
                _ = triggered(&mut self.shutdown), if idle => {
                    tracing::debug!(peer_addr = %self.peer, "Closing idle connection for shutdown");
                    return HeadEvent::Closed;
                }
            }
        }
    }

    /// Answer an unparseable head with 400 and stop reading.
    fn reject(&self, error: DecodeError) {
        tracing::debug!(peer_addr = %self.peer, error = %error, "Rejecting request head");
        let exchange = Exchange::new(Uuid::new_v4(), Method::GET, Uri::default(), false);
        if !self.queue.push(exchange.clone()) {
            return;
        }
        exchange.set_close_after();
        exchange.request_received();
        exchange.submit_response(ChainError::BadRequest(error.to_string()).into_response());
    }

    fn target_for(&self, head: &RequestHead) -> Option<HttpHost> {
        let scheme = &self.settings.scheme;
        if let Some(host) = head.headers.get(header::HOST).and_then(|v| v.to_str().ok()) {
            return HttpHost::from_authority(scheme, host);
        }
        if let Some(target) = HttpHost::from_uri(&head.uri) {
            return Some(target);
        }
        // HTTP/1.0 may omit Host; fall back to the address the client reached.
        if head.version == axum::http::Version::HTTP_10 {
            let local = self.local?;
            return Some(HttpHost::new(scheme, &local.ip().to_string(), Some(local.port())));
        }
        None
    }

    /// Queue the exchange, start the chain and deliver the request body.
    /// Returns false when the connection must stop reading.
    async fn start_exchange(&mut self, head: RequestHead) -> bool {
        let exchange = Exchange::new(
            Uuid::new_v4(),
            head.method.clone(),
            head.uri.clone(),
            head.expect_continue,
        );
        if !self.queue.push(exchange.clone()) {
            exchange.cancel();
            return false;
        }
        tracing::debug!(
            request_id = %exchange.id(),
            peer_addr = %self.peer,
            method = %head.method,
            uri = %head.uri,
            "Exchange created"
        );
        if !head.keep_alive {
            exchange.set_close_after();
        }

        let Some(target) = self.target_for(&head) else {
            exchange.set_close_after();
            exchange.request_received();
            exchange.submit_response(
                ChainError::BadRequest("missing or invalid Host".into()).into_response(),
            );
            return false;
        };

        let mut producer = None;
        let body = match BodyDecoder::new(head.body) {
            None => Body::empty(),
            Some(decoder) => {
                let pipe = Pipe::with_capacity(self.settings.pipe_capacity);
                let Some(source) = pipe.source() else {
                    exchange.cancel();
                    return false;
                };
                exchange.set_request_body(pipe.clone());
                if head.expect_continue {
                    let waiting: Weak<Exchange> = Arc::downgrade(&exchange);
                    pipe.on_demand(move || {
                        if let Some(exchange) = waiting.upgrade() {
                            exchange.submit_continue();
                        }
                    });
                }
                producer = Some((pipe, decoder));
                Body::from_stream(source)
            }
        };

        let mut request = Request::new(body);
        *request.method_mut() = head.method.clone();
        *request.uri_mut() = head.uri;
        *request.version_mut() = head.version;
        *request.headers_mut() = head.headers;
        request.extensions_mut().insert(head.raw);

        let mut ctx = RequestContext::new(Some(self.peer), &self.settings.scheme);
        ctx.request_id = exchange.id();

        exchange.request_received();
        let callback = exchange_callback(exchange.clone(), head.method, Instant::now());
        let task = spawn(self.chain.clone(), target, request, ctx, callback);
        exchange.set_task(task);

        if let Some((pipe, decoder)) = producer {
            match self.pump_body(decoder, &pipe, &exchange).await {
                BodyEnd::Complete => {}
                BodyEnd::Stop => return false,
                BodyEnd::Truncated(error) => {
                    tracing::debug!(request_id = %exchange.id(), error = %error, "Request body truncated");
                    pipe.fail(error);
                    exchange.cancel();
                    return false;
                }
                BodyEnd::Invalid(error) => {
                    tracing::debug!(request_id = %exchange.id(), error = %error, "Invalid request body framing");
                    pipe.fail(io::Error::new(io::ErrorKind::InvalidData, error.to_string()));
                    exchange.set_close_after();
                    exchange.submit_response(ChainError::BadRequest(error.to_string()).into_response());
                    return false;
                }
            }
        }
        !exchange.close_after()
    }

    /// Move the request body from the socket into `pipe`.
    async fn pump_body(&mut self, mut decoder: BodyDecoder, pipe: &Pipe, exchange: &Exchange) -> BodyEnd {
        let mut pending = Pending::default();
        let mut discarding = false;
        let mut finished = false;
        loop {
            if !discarding && pending.flush_into(pipe).is_err() {
                // The chain dropped the body; keep framing by discarding.
                discarding = true;
                pending = Pending::default();
            }
            if discarding && exchange.close_after() {
                return BodyEnd::Stop;
            }
            if !discarding && !pending.is_empty() {
                tokio::select! {
                    _ = pipe.capacity_available() => continue,
                    _ = stopped(&mut self.stop) => return BodyEnd::Stop,
                }
            }
            if finished {
                pipe.close();
                return BodyEnd::Complete;
            }

            match decoder.decode(&mut self.wire.buf) {
                Ok(Decoded::Data(chunk)) => {
                    if !discarding {
                        pending.push(chunk);
                    }
                }
                Ok(Decoded::Done) => finished = true,
                Ok(Decoded::NeedMore) => {
                    let wire = &mut self.wire;
                    tokio::select! {
                        read = tokio::time::timeout(self.settings.idle_timeout, wire.io.read_buf(&mut wire.buf)) => match read {
                            Ok(Ok(0)) => {
                                return BodyEnd::Truncated(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "connection closed mid-body",
                                ));
                            }
                            Ok(Ok(_)) => {}
                            Ok(Err(e)) => return BodyEnd::Truncated(e),
                            Err(_) => {
                                return BodyEnd::Truncated(io::Error::new(
                                    io::ErrorKind::TimedOut,
                                    "request body stalled",
                                ));
                            }
                        },
                        _ = stopped(&mut self.stop) => return BodyEnd::Stop,
                    }
                }
                Err(error) => return BodyEnd::Invalid(error),
            }
        }
    }
}

/// Routes the chain's outcome into the exchange.
fn exchange_callback(
    exchange: Arc<Exchange>,
    method: Method,
    start: Instant,
) -> Box<dyn FutureCallback<Response<Body>>> {
    callback_fn(move |outcome: Outcome<Response<Body>>| {
        let response = match outcome {
            Outcome::Completed(response) => response,
            Outcome::Failed(error) => {
                tracing::debug!(request_id = %exchange.id(), error = %error, "Chain failed");
                error.into_response()
            }
            Outcome::Cancelled if exchange.state().is_terminal() => {
                metrics::record_exchange_cancelled();
                return;
            }
            // Cancelled without the exchange, e.g. no worker was free.
            Outcome::Cancelled => ChainError::Cancelled.into_response(),
        };
        metrics::record_exchange(method.as_str(), response.status().as_u16(), start);
        exchange.submit_response(response);
    })
}

enum Written {
    Complete,
    Preempted,
}

async fn write_loop<S>(
    mut io: WriteHalf<S>,
    queue: Arc<PendingExchanges>,
    stop: watch::Sender<bool>,
    peer: SocketAddr,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut out = BytesMut::with_capacity(8 * 1024);
    while let Some(exchange) = queue.next().await {
        let (tx, mut rx) = mpsc::unbounded_channel();
        exchange.attach(Box::new(ChannelSink(tx)));

        let close = loop {
            match rx.recv().await {
                Some(Outbound::Interim(status)) => {
                    encode::encode_interim(status, &mut out);
                    let sent = io.write_all(&out).await;
                    out.clear();
                    if sent.is_err() {
                        exchange.cancel();
                        break true;
                    }
                }
                Some(Outbound::Final(response, close)) => {
                    let method = exchange.method().clone();
                    match write_response(&mut io, &mut out, response, &method, close, &mut rx).await {
                        Ok(Written::Complete) => {
                            exchange.complete();
                            tracing::debug!(request_id = %exchange.id(), close, "Exchange completed");
                            break close;
                        }
                        Ok(Written::Preempted) => {
                            tracing::debug!(request_id = %exchange.id(), "Response preempted by cancellation");
                            break true;
                        }
                        Err(e) => {
                            tracing::debug!(request_id = %exchange.id(), error = %e, "Response write failed");
                            exchange.cancel();
                            break true;
                        }
                    }
                }
                Some(Outbound::Cancelled) | None => {
                    queue.remove(exchange.id());
                    break false;
                }
            }
        };
        if close {
            break;
        }
    }

    queue.close();
    let cancelled = queue.cancel_all();
    if cancelled > 0 {
        tracing::debug!(peer_addr = %peer, cancelled, "Dropped exchanges queued behind a closing response");
    }
    let _ = io.shutdown().await;
    let _ = stop.send(true);
}

async fn write_response<W>(
    io: &mut W,
    out: &mut BytesMut,
    response: Response<Body>,
    method: &Method,
    close: bool,
    rx: &mut mpsc::UnboundedReceiver<Outbound>,
) -> io::Result<Written>
where
    W: AsyncWrite + Unpin,
{
    let (mut parts, mut body) = response.into_parts();
    let length = encode::body_length(&parts, body.size_hint().exact());
    let framing = encode::encode_head(&mut parts, method, length, close, out);
    io.write_all(out).await?;
    out.clear();

    if framing == Framing::None {
        drain_body(body);
        io.flush().await?;
        return Ok(Written::Complete);
    }

    loop {
        tokio::select! {
            biased;
            message = rx.recv() => {
                if matches!(message, Some(Outbound::Cancelled) | None) {
                    drain_body(body);
                    return Ok(Written::Preempted);
                }
            }
            frame = body.frame() => match frame {
                None => break,
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        encode::encode_chunk(&data, framing, out);
                        io.write_all(out).await?;
                        out.clear();
                    }
                }
                Some(Err(e)) => return Err(io::Error::other(e)),
            }
        }
    }
    encode::encode_end(framing, out);
    io.write_all(out).await?;
    out.clear();
    io.flush().await?;
    Ok(Written::Complete)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::Dispatch;
    use crate::chain::Pipeline;
    use tokio::io::DuplexStream;

    /// Echoes method, path and body.
    struct Echo;

    impl Dispatch for Echo {
        fn invoke<'a>(
            &'a self,
            _target: &'a HttpHost,
            request: Request<Body>,
            _ctx: &'a mut RequestContext,
        ) -> BoxFuture<'a, ChainResult<Response<Body>>> {
            Box::pin(async move {
                let line = format!("{} {} ", request.method(), request.uri().path());
                let body = request.into_body().collect().await?.to_bytes();
                let mut text = line.into_bytes();
                text.extend_from_slice(&body);
                Ok(Response::new(Body::from(text)))
            })
        }
    }

    struct Slow;

    impl Dispatch for Slow {
        fn invoke<'a>(
            &'a self,
            _target: &'a HttpHost,
            _request: Request<Body>,
            _ctx: &'a mut RequestContext,
        ) -> BoxFuture<'a, ChainResult<Response<Body>>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Response::new(Body::empty()))
            })
        }
    }

    fn settings() -> Arc<ConnectionSettings> {
        Arc::new(ConnectionSettings {
            scheme: "http".into(),
            header_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(2),
            exchange_timeout: Duration::from_millis(200),
            pipe_capacity: 8,
            max_pipelined: 4,
        })
    }

    fn connect(dispatch: Arc<dyn Dispatch>) -> (DuplexStream, watch::Sender<bool>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let chain: Arc<dyn ExecChain> = Arc::new(Deadline::new(
            Arc::new(Pipeline::builder(dispatch).build()),
            settings().exchange_timeout,
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(serve_connection(
            server,
            "127.0.0.1:5000".parse().unwrap(),
            None,
            chain,
            settings(),
            shutdown_rx,
        ));
        (client, shutdown_tx)
    }

    async fn read_until_closed(client: &mut DuplexStream) -> String {
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn test_pipelined_responses_keep_order() {
        let (mut client, _shutdown) = connect(Arc::new(Echo));
        client
            .write_all(
                b"POST /a HTTP/1.1\r\nHost: x\r\nContent-Length: 20\r\n\r\nlonger than the pipe\
                  GET /b HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n",
            )
            .await
            .unwrap();
        let text = read_until_closed(&mut client).await;
        let first = text.find("POST /a longer than the pipe").unwrap();
        let second = text.find("GET /b ").unwrap();
        assert!(first < second);
        assert!(text.contains("connection: close"));
    }

    #[tokio::test]
    async fn test_chunked_request_body() {
        let (mut client, _shutdown) = connect(Arc::new(Echo));
        client
            .write_all(
                b"PUT /c HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n\
                  3\r\nabc\r\n2\r\nde\r\n0\r\n\r\n",
            )
            .await
            .unwrap();
        let text = read_until_closed(&mut client).await;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("PUT /c abcde"));
    }

    #[tokio::test]
    async fn test_continue_sent_when_body_is_read() {
        let (mut client, _shutdown) = connect(Arc::new(Echo));
        client
            .write_all(b"PUT /d HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\nContent-Length: 2\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut interim = [0u8; 25];
        client.read_exact(&mut interim).await.unwrap();
        assert_eq!(&interim, b"HTTP/1.1 100 Continue\r\n\r\n");

        client.write_all(b"ok").await.unwrap();
        let text = read_until_closed(&mut client).await;
        assert!(text.ends_with("PUT /d ok"));
    }

    #[tokio::test]
    async fn test_malformed_head_gets_400() {
        let (mut client, _shutdown) = connect(Arc::new(Echo));
        client.write_all(b"NOT A REQUEST\r\n\r\n").await.unwrap();
        let text = read_until_closed(&mut client).await;
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn test_slow_exchange_times_out_with_504() {
        let (mut client, _shutdown) = connect(Arc::new(Slow));
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let text = read_until_closed(&mut client).await;
        assert!(text.starts_with("HTTP/1.1 504 Gateway Timeout\r\n"));
    }

    #[tokio::test]
    async fn test_missing_host_is_rejected() {
        let (mut client, _shutdown) = connect(Arc::new(Echo));
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let text = read_until_closed(&mut client).await;
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }
}
