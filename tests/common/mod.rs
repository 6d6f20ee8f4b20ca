//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, request::Parts, Method, Request, Response, StatusCode};
use futures_util::future::BoxFuture;
use http_body_util::BodyExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use exchange_chain::chain::dispatch::{ResourceState, UnitOfWork, UnitOfWorkFactory};
use exchange_chain::chain::{Dispatch, Pipeline};
use exchange_chain::config::ServerConfig;
use exchange_chain::exchange::{HttpHost, RequestContext};
use exchange_chain::server::{HttpServer, Listener};
use exchange_chain::{ChainResult, Shutdown};

/// A request as the mock origin saw it.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl SeenRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Status, extra headers and body returned by the mock origin.
pub type Reply = (u16, Vec<(&'static str, String)>, String);

/// Start a programmable mock origin on an ephemeral loopback port.
///
/// Every response closes the connection. Requests are recorded in arrival
/// order.
pub async fn start_origin<F>(f: F) -> (SocketAddr, Arc<Mutex<Vec<SeenRequest>>>)
where
    F: Fn(&SeenRequest) -> Reply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let f = Arc::new(f);

    let log = seen.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let f = f.clone();
            let log = log.clone();
            tokio::spawn(async move {
                let Some(request) = read_request(&mut socket).await else {
                    return;
                };
                let (status, headers, body) = f(&request);
                log.lock().unwrap().push(request);

                let mut out = format!("HTTP/1.1 {} {}\r\n", status, reason(status));
                for (name, value) in &headers {
                    out.push_str(&format!("{}: {}\r\n", name, value));
                }
                out.push_str(&format!(
                    "Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                ));
                let _ = socket.write_all(out.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    (addr, seen)
}

fn reason(status: u16) -> &'static str {
    StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown")
}

async fn read_request(socket: &mut TcpStream) -> Option<SeenRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Request::new(&mut headers);
        let httparse::Status::Complete(head_len) = parsed.parse(&buf).ok()? else {
            continue;
        };
        let headers: Vec<(String, String)> = parsed
            .headers
            .iter()
            .map(|h| {
                (
                    h.name.to_ascii_lowercase(),
                    String::from_utf8_lossy(h.value).into_owned(),
                )
            })
            .collect();
        let method = parsed.method?.to_string();
        let path = parsed.path?.to_string();
        let length: usize = headers
            .iter()
            .find(|(n, _)| n == "content-length")
            .and_then(|(_, v)| v.trim().parse().ok())
            .unwrap_or(0);

        while buf.len() < head_len + length {
            let n = socket.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        return Some(SeenRequest {
            method,
            path,
            headers,
            body: buf[head_len..head_len + length].to_vec(),
        });
    }
}

/// Loopback configuration with an ephemeral listener port.
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.timeouts.exchange_secs = 5;
    config.timeouts.idle_secs = 5;
    config.timeouts.headers_secs = 5;
    config
}

/// Serve `pipeline` on a loopback port until the returned shutdown fires.
pub async fn start_server(config: &ServerConfig, pipeline: Pipeline) -> (SocketAddr, Arc<Shutdown>) {
    let listener = Listener::bind(&config.listener).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::new(config, pipeline);
    let shutdown = Arc::new(Shutdown::new());
    let signal = shutdown.clone();
    tokio::spawn(async move {
        let _ = server.run(listener, &signal).await;
    });
    (addr, shutdown)
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

/// Write raw bytes and read until the server closes the connection.
pub async fn raw_exchange(addr: SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut out = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut out))
        .await
        .expect("server did not close the connection")
        .unwrap();
    String::from_utf8_lossy(&out).into_owned()
}

/// In-memory text documents keyed by path, with a version per write.
#[derive(Default)]
pub struct MemoryDispatch {
    docs: Mutex<HashMap<String, (u64, String)>>,
}

impl MemoryDispatch {
    pub fn with_doc(path: &str, text: &str) -> Self {
        let dispatch = Self::default();
        dispatch
            .docs
            .lock()
            .unwrap()
            .insert(path.to_string(), (1, text.to_string()));
        dispatch
    }

    pub fn doc(&self, path: &str) -> Option<String> {
        self.docs.lock().unwrap().get(path).map(|(_, t)| t.clone())
    }
}

impl Dispatch for MemoryDispatch {
    fn resolve<'a>(
        &'a self,
        _target: &'a HttpHost,
        parts: &'a Parts,
    ) -> BoxFuture<'a, ChainResult<Option<ResourceState>>> {
        Box::pin(async move {
            let docs = self.docs.lock().unwrap();
            let state = match docs.get(parts.uri.path()) {
                Some((version, _)) => ResourceState::existing(vec![
                    Method::GET,
                    Method::HEAD,
                    Method::PUT,
                    Method::DELETE,
                ])
                .with_version(version.to_string())
                .with_content_type("text/plain"),
                None => ResourceState {
                    allow: vec![Method::PUT],
                    ..ResourceState::default()
                },
            };
            Ok(Some(state))
        })
    }

    fn invoke<'a>(
        &'a self,
        _target: &'a HttpHost,
        request: Request<Body>,
        _ctx: &'a mut RequestContext,
    ) -> BoxFuture<'a, ChainResult<Response<Body>>> {
        Box::pin(async move {
            let path = request.uri().path().to_string();
            let method = request.method().clone();
            let mut response = Response::new(Body::empty());
            match method {
                Method::GET | Method::HEAD => match self.doc(&path) {
                    Some(text) => {
                        response.headers_mut().insert(
                            header::CONTENT_TYPE,
                            header::HeaderValue::from_static("text/plain"),
                        );
                        *response.body_mut() = Body::from(text);
                    }
                    None => *response.status_mut() = StatusCode::NOT_FOUND,
                },
                Method::PUT => {
                    let body = request.into_body().collect().await?.to_bytes();
                    let text = String::from_utf8_lossy(&body).into_owned();
                    let mut docs = self.docs.lock().unwrap();
                    let created = match docs.get_mut(&path) {
                        Some((version, doc)) => {
                            *version += 1;
                            *doc = text;
                            false
                        }
                        None => {
                            docs.insert(path, (1, text));
                            true
                        }
                    };
                    *response.status_mut() = if created {
                        StatusCode::CREATED
                    } else {
                        StatusCode::NO_CONTENT
                    };
                }
                Method::DELETE => {
                    if self.docs.lock().unwrap().remove(&path).is_some() {
                        *response.status_mut() = StatusCode::NO_CONTENT;
                    } else {
                        *response.status_mut() = StatusCode::NOT_FOUND;
                    }
                }
                _ => *response.status_mut() = StatusCode::METHOD_NOT_ALLOWED,
            }
            Ok(response)
        })
    }
}

/// Unit-of-work factory that journals every call.
#[derive(Default)]
pub struct RecordingUnits {
    pub journal: Arc<Mutex<Vec<&'static str>>>,
}

impl RecordingUnits {
    pub fn entries(&self) -> Vec<&'static str> {
        self.journal.lock().unwrap().clone()
    }
}

struct RecordingUnit(Arc<Mutex<Vec<&'static str>>>);

impl UnitOfWork for RecordingUnit {
    fn commit(&self) -> ChainResult<()> {
        self.0.lock().unwrap().push("commit");
        Ok(())
    }

    fn rollback(&self) {
        self.0.lock().unwrap().push("rollback");
    }

    fn end(&self) {
        self.0.lock().unwrap().push("end");
    }
}

impl UnitOfWorkFactory for RecordingUnits {
    fn begin(&self, _ctx: &RequestContext) -> ChainResult<Arc<dyn UnitOfWork>> {
        self.journal.lock().unwrap().push("begin");
        Ok(Arc::new(RecordingUnit(self.journal.clone())))
    }
}
