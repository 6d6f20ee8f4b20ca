//! Wire-level behaviour of the HTTP/1.1 server: ordering, 100-continue,
//! connection persistence and shutdown.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Method, Request, Response, StatusCode};
use futures_util::future::BoxFuture;
use http_body_util::BodyExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use exchange_chain::chain::{Dispatch, Pipeline};
use exchange_chain::exchange::{HttpHost, RequestContext};
use exchange_chain::ChainResult;

mod common;

/// `/slow` answers after a delay, `/forbidden` refuses without reading the
/// body, anything else echoes the body.
struct Scripted;

impl Dispatch for Scripted {
    fn invoke<'a>(
        &'a self,
        _target: &'a HttpHost,
        request: Request<Body>,
        _ctx: &'a mut RequestContext,
    ) -> BoxFuture<'a, ChainResult<Response<Body>>> {
        Box::pin(async move {
            match request.uri().path() {
                "/slow" => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(Response::new(Body::from("slow")))
                }
                "/forbidden" => {
                    let mut response = Response::new(Body::from("no"));
                    *response.status_mut() = StatusCode::FORBIDDEN;
                    Ok(response)
                }
                path => {
                    let label = format!("{} {} ", request.method(), path);
                    let body = request.into_body().collect().await?.to_bytes();
                    let mut text = label.into_bytes();
                    text.extend_from_slice(&body);
                    Ok(Response::new(Body::from(text)))
                }
            }
        })
    }
}

async fn server() -> (std::net::SocketAddr, Arc<exchange_chain::Shutdown>) {
    let config = common::test_config();
    let pipeline = Pipeline::builder(Arc::new(Scripted)).build();
    common::start_server(&config, pipeline).await
}

#[tokio::test]
async fn test_pipelined_responses_follow_request_order() {
    let (addr, _shutdown) = server().await;
    let text = common::raw_exchange(
        addr,
        b"GET /slow HTTP/1.1\r\nHost: t\r\n\r\n\
          GET /fast HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n",
    )
    .await;

    let slow = text.find("slow").expect("first response missing");
    let fast = text.find("GET /fast ").expect("second response missing");
    assert!(slow < fast, "responses out of order: {}", text);
    assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2);
}

#[tokio::test]
async fn test_keep_alive_serves_sequential_requests() {
    let (addr, _shutdown) = server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();

    stream
        .write_all(b"POST /one HTTP/1.1\r\nHost: t\r\nContent-Length: 3\r\n\r\nabc")
        .await
        .unwrap();
    let mut first = String::new();
    let mut buf = vec![0u8; 1024];
    while !first.ends_with("POST /one abc") {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("first response incomplete")
            .unwrap();
        assert!(n > 0, "connection closed early: {}", first);
        first.push_str(&String::from_utf8_lossy(&buf[..n]));
    }
    assert!(!first.contains("connection: close"));

    stream
        .write_all(b"GET /two HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(String::from_utf8_lossy(&rest).ends_with("GET /two "));
}

#[tokio::test]
async fn test_continue_is_sent_before_body_is_read() {
    let (addr, _shutdown) = server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"PUT /upload HTTP/1.1\r\nHost: t\r\nExpect: 100-continue\r\n\
              Content-Length: 5\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();

    let mut interim = [0u8; 25];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut interim))
        .await
        .expect("no interim response")
        .unwrap();
    assert_eq!(&interim, b"HTTP/1.1 100 Continue\r\n\r\n");

    stream.write_all(b"hello").await.unwrap();
    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    let text = String::from_utf8_lossy(&rest);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.ends_with("PUT /upload hello"));
}

#[tokio::test]
async fn test_refusal_without_continue_closes_connection() {
    let (addr, _shutdown) = server().await;
    let text = common::raw_exchange(
        addr,
        b"PUT /forbidden HTTP/1.1\r\nHost: t\r\nExpect: 100-continue\r\nContent-Length: 100\r\n\r\n",
    )
    .await;
    assert!(text.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{}", text);
    assert!(!text.contains("100 Continue"));
    assert!(text.contains("connection: close"));
}

#[tokio::test]
async fn test_http10_without_keep_alive_closes() {
    let (addr, _shutdown) = server().await;
    let text = common::raw_exchange(addr, b"GET /old HTTP/1.0\r\nHost: t\r\n\r\n").await;
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("connection: close"));
    assert!(text.ends_with("GET /old "));
}

#[tokio::test]
async fn test_chunked_upload_is_reassembled() {
    let (addr, _shutdown) = server().await;
    let text = common::raw_exchange(
        addr,
        b"POST /chunks HTTP/1.1\r\nHost: t\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n\
          4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n",
    )
    .await;
    assert!(text.ends_with("POST /chunks wikipedia"), "{}", text);
}

#[tokio::test]
async fn test_malformed_request_gets_400() {
    let (addr, _shutdown) = server().await;
    let text = common::raw_exchange(addr, b"GARBAGE\r\n\r\n").await;
    assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
}

#[tokio::test]
async fn test_unsupported_transfer_coding_gets_400() {
    let (addr, _shutdown) = server().await;
    let text = common::raw_exchange(
        addr,
        b"POST / HTTP/1.1\r\nHost: t\r\nTransfer-Encoding: gzip\r\n\r\n",
    )
    .await;
    assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
}

#[tokio::test]
async fn test_head_has_no_body() {
    let (addr, _shutdown) = server().await;
    let text = common::raw_exchange(
        addr,
        b"HEAD /meta HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.ends_with("\r\n\r\n"));
}

#[tokio::test]
async fn test_shutdown_closes_idle_connections() {
    let (addr, shutdown) = server().await;
    let mut idle = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    shutdown.trigger();
    let mut out = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), idle.read_to_end(&mut out)).await;
    assert!(read.is_ok(), "idle connection not closed");
    assert!(out.is_empty());
}

#[tokio::test]
async fn test_method_is_preserved() {
    let (addr, _shutdown) = server().await;
    let request = format!(
        "{} /verb HTTP/1.1\r\nHost: t\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        Method::DELETE
    );
    let text = common::raw_exchange(addr, request.as_bytes()).await;
    assert!(text.ends_with("DELETE /verb "));
}
