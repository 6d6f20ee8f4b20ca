//! End-to-end scenarios through the full server chain over loopback.

use std::sync::Arc;

use axum::http::{header, StatusCode};

use exchange_chain::client::ConnectionManager;
use exchange_chain::config::ServerConfig;
use exchange_chain::server_pipeline;

mod common;

use common::{MemoryDispatch, RecordingUnits};

struct Harness {
    base: String,
    dispatch: Arc<MemoryDispatch>,
    units: Arc<RecordingUnits>,
    manager: Arc<ConnectionManager>,
    _shutdown: Arc<exchange_chain::Shutdown>,
}

async fn harness(dispatch: MemoryDispatch) -> Harness {
    harness_with(common::test_config(), dispatch).await
}

async fn harness_with(config: ServerConfig, dispatch: MemoryDispatch) -> Harness {
    let dispatch = Arc::new(dispatch);
    let units = Arc::new(RecordingUnits::default());
    let manager = Arc::new(ConnectionManager::new(&config));
    let pipeline = server_pipeline(&config, manager.clone(), units.clone(), dispatch.clone());
    let (addr, shutdown) = common::start_server(&config, pipeline).await;
    Harness {
        base: format!("http://{}", addr),
        dispatch,
        units,
        manager,
        _shutdown: shutdown,
    }
}

#[tokio::test]
async fn test_get_then_revalidate_with_etag() {
    let h = harness(MemoryDispatch::with_doc("/notes", "hello")).await;
    let client = common::client();

    let res = client.get(format!("{}/notes", h.base)).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let etag = res.headers()[header::ETAG].to_str().unwrap().to_string();
    assert_eq!(res.text().await.unwrap(), "hello");

    let res = client
        .get(format!("{}/notes", h.base))
        .header(header::IF_NONE_MATCH, &etag)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_MODIFIED);
    assert_eq!(res.headers()[header::ETAG], etag.as_str());
}

#[tokio::test]
async fn test_stale_if_match_is_rejected_and_rolled_back() {
    let h = harness(MemoryDispatch::with_doc("/notes", "v1")).await;
    let res = common::client()
        .put(format!("{}/notes", h.base))
        .header(header::IF_MATCH, "\"not-the-current-tag\"")
        .body("v2")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::PRECONDITION_FAILED);
    assert_eq!(h.dispatch.doc("/notes").as_deref(), Some("v1"));

    let journal = h.units.entries();
    assert!(journal.contains(&"rollback"));
    assert!(!journal.contains(&"commit"));
    assert_eq!(journal.iter().filter(|e| **e == "end").count(), 1);
}

#[tokio::test]
async fn test_successful_put_commits_once() {
    let h = harness(MemoryDispatch::default()).await;
    let res = common::client()
        .put(format!("{}/fresh", h.base))
        .body("created")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    assert_eq!(h.dispatch.doc("/fresh").as_deref(), Some("created"));
    assert_eq!(h.units.entries(), vec!["begin", "commit", "end"]);
}

#[tokio::test]
async fn test_put_with_current_etag_succeeds() {
    let h = harness(MemoryDispatch::with_doc("/notes", "v1")).await;
    let client = common::client();
    let res = client.get(format!("{}/notes", h.base)).send().await.unwrap();
    let etag = res.headers()[header::ETAG].to_str().unwrap().to_string();
    let _ = res.text().await.unwrap();

    let res = client
        .put(format!("{}/notes", h.base))
        .header(header::IF_MATCH, &etag)
        .body("v2")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    assert_eq!(h.dispatch.doc("/notes").as_deref(), Some("v2"));

    let res = client.get(format!("{}/notes", h.base)).send().await.unwrap();
    assert_ne!(res.headers()[header::ETAG].to_str().unwrap(), etag);
}

#[tokio::test]
async fn test_options_lists_resource_methods() {
    let h = harness(MemoryDispatch::with_doc("/notes", "x")).await;
    let res = common::client()
        .request(reqwest::Method::OPTIONS, format!("{}/notes", h.base))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);
    let allow = res.headers()[header::ALLOW].to_str().unwrap();
    for method in ["GET", "PUT", "DELETE", "OPTIONS", "TRACE"] {
        assert!(allow.contains(method), "{} missing from {}", method, allow);
    }
}

#[tokio::test]
async fn test_trace_echoes_request_head_verbatim() {
    let h = harness(MemoryDispatch::default()).await;
    let addr = h.base.trim_start_matches("http://").parse().unwrap();
    let head = "TRACE /anything?x=1 HTTP/1.1\r\nHost: Example.Local\r\nX-Marker: One\r\n\
                Accept: */*\r\nx-marker: two\r\nConnection: close\r\n\r\n";
    let text = common::raw_exchange(addr, head.as_bytes()).await;

    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{}", text);
    assert!(text.contains("content-type: message/http\r\n"), "{}", text);
    assert!(text.ends_with(head), "{}", text);
}

#[tokio::test]
async fn test_disallowed_method_is_405_with_trace() {
    let h = harness(MemoryDispatch::with_doc("/notes", "x")).await;
    let res = common::client()
        .post(format!("{}/notes", h.base))
        .body("nope")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::METHOD_NOT_ALLOWED);
    let allow = res.headers()[header::ALLOW].to_str().unwrap();
    assert_eq!(allow, "GET, HEAD, PUT, DELETE, TRACE");
    assert_eq!(h.dispatch.doc("/notes").as_deref(), Some("x"));
}

#[tokio::test]
async fn test_large_text_is_gzipped_for_accepting_clients() {
    let body = "compress me ".repeat(200);
    let h = harness(MemoryDispatch::with_doc("/big", &body)).await;
    let client = common::client();

    let res = client
        .get(format!("{}/big", h.base))
        .header(header::ACCEPT_ENCODING, "gzip")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()[header::CONTENT_ENCODING], "gzip");
    let compressed = res.bytes().await.unwrap();
    assert!(compressed.len() < body.len());

    let res = client.get(format!("{}/big", h.base)).send().await.unwrap();
    assert!(res.headers().get(header::CONTENT_ENCODING).is_none());
    assert_eq!(res.text().await.unwrap(), body);
}

#[tokio::test]
async fn test_missing_resource_is_404() {
    let h = harness(MemoryDispatch::default()).await;
    let res = common::client()
        .get(format!("{}/nothing", h.base))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cache_compaction_runs_once_per_interval() {
    let mut config = common::test_config();
    config.cache.enabled = true;
    config.cache.clean_interval = 3;
    let h = harness_with(config, MemoryDispatch::with_doc("/notes", "x")).await;
    let client = common::client();
    let url = format!("{}/notes", h.base);

    for _ in 0..3 {
        let res = client.get(&url).send().await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);
        let _ = res.text().await.unwrap();
    }
    assert_eq!(h.manager.requests(), 3);
    assert_eq!(h.manager.compactions(), 1);

    let res = client.get(&url).send().await.unwrap();
    let _ = res.text().await.unwrap();
    assert_eq!(h.manager.requests(), 4);
    assert_eq!(h.manager.compactions(), 1);
}
