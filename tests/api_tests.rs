//! Chunk endpoint behavior through the axum router.

mod common;

use axum::{body::Body, http::Request, http::StatusCode};
use common::{MAX_CHUNK_SIZE, TestFile, TestServer, chunk_request, send};
use resumable_upload::services::upload_service::{
    ASSEMBLY_FILE, FORBID_MARKER, LOCK_MARKER, METADATA_FILE, UploadLimits,
};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn test_health_probes() {
    let server = TestServer::new();

    let request = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
    let (status, body) = send(&server.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let request = Request::builder().uri("/readyz").body(Body::empty()).unwrap();
    let (status, body) = send(&server.router, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["checks"]["disk"]["ok"], true);
}

#[tokio::test]
async fn test_upload_in_any_order_reassembles_file() {
    let server = TestServer::new();
    let dir = server.authorize("tok1");
    let file = TestFile::new(10_000, 4096);
    assert_eq!(file.max(), 3);

    for count in [2, 0] {
        let (status, body) = send(&server.router, file.request("tok1", count)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], format!("tok1-{:06}", count));
        assert_eq!(body["token"], "tok1");
        assert_eq!(body["done"], false);
    }

    let (status, body) = send(&server.router, file.request("tok1", 1)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["done"], true);
    assert_eq!(body["duplicate"], false);

    let assembled = std::fs::read(dir.join(ASSEMBLY_FILE)).unwrap();
    assert_eq!(assembled, file.data);
    assert!(!dir.join(LOCK_MARKER).exists());

    let meta = server.service.load_metadata(&dir).await.unwrap().unwrap();
    assert_eq!(meta.current, 3);
    assert_eq!(meta.parts.len(), 3);
    assert_eq!(meta.path, "incoming");
}

#[tokio::test]
async fn test_duplicate_chunk_is_acknowledged_once() {
    let server = TestServer::new();
    let dir = server.authorize("dup");
    let file = TestFile::new(5_000, 4096);

    send(&server.router, file.request("dup", 0)).await;
    let (status, body) = send(&server.router, file.request("dup", 0)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["duplicate"], true);
    assert_eq!(body["done"], false);

    let meta = server.service.load_metadata(&dir).await.unwrap().unwrap();
    assert_eq!(meta.current, 1);

    let (_, body) = send(&server.router, file.request("dup", 1)).await;
    assert_eq!(body["done"], true);
    let (_, body) = send(&server.router, file.request("dup", 1)).await;
    assert_eq!(body["done"], false);
    assert_eq!(body["duplicate"], true);
}

#[tokio::test]
async fn test_unknown_token_is_rejected() {
    let server = TestServer::new();
    let file = TestFile::new(100, 64);

    let (status, body) = send(&server.router, file.request("nobody", 0)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body, json!({"id": null, "duplicate": false, "done": false}));
}

#[tokio::test]
async fn test_malformed_headers_are_rejected() {
    let server = TestServer::new();
    server.authorize("tok");

    let request = Request::builder()
        .method("POST")
        .uri("/upload")
        .header("x-upload-token", "tok")
        .body(Body::from(vec![1u8; 8]))
        .unwrap();
    let (status, body) = send(&server.router, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["id"], serde_json::Value::Null);

    let bad_token = chunk_request("../tok", "abc", 0, 1, 8, 8, vec![1u8; 8]);
    let (status, _) = send(&server.router, bad_token).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_oversized_upload_forbids_token() {
    let server = TestServer::new();
    let dir = server.authorize("huge");
    let size = 1_048_576usize;
    let max = 200_000usize;

    let first = chunk_request("huge", "abc", 0, max, size, max * size, vec![0u8; 16]);
    let (status, body) = send(&server.router, first).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["id"], serde_json::Value::Null);
    assert!(dir.join(FORBID_MARKER).exists());
    assert!(!dir.join(METADATA_FILE).exists());

    let file = TestFile::new(100, 64);
    let (status, _) = send(&server.router, file.request("huge", 0)).await;
    assert_eq!(status, StatusCode::GONE);
}

#[tokio::test]
async fn test_hash_mismatch_destroys_upload() {
    let server = TestServer::new();
    let dir = server.authorize("bad");
    let data = vec![5u8; 100];

    let request = chunk_request("bad", "0000", 0, 1, 128, data.len(), data);
    let (status, body) = send(&server.router, request).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["done"], false);
    assert!(!dir.exists());

    let file = TestFile::new(100, 128);
    let (status, _) = send(&server.router, file.request("bad", 0)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_body_over_limit_is_rejected() {
    let server = TestServer::new();
    server.authorize("big");
    let size = MAX_CHUNK_SIZE * 2;
    let body = vec![0u8; size];

    let request = chunk_request("big", "abc", 0, 1, size, size, body);
    let (status, _) = send(&server.router, request).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn test_stale_lock_times_out() {
    let server = TestServer::with_limits(UploadLimits {
        lock_retries: 2,
        lock_interval: Duration::from_millis(10),
        ..UploadLimits::default()
    });
    let dir = server.authorize("locked");
    std::fs::write(dir.join(LOCK_MARKER), b"").unwrap();

    let file = TestFile::new(100, 64);
    let (status, _) = send(&server.router, file.request("locked", 0)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(!dir.join(METADATA_FILE).exists());
}

#[tokio::test]
async fn test_concurrent_chunks_are_all_applied() {
    let server = TestServer::new();
    let dir = server.authorize("race");
    let file = TestFile::new(20 * 1024, 1024);

    let requests = (0..file.max()).map(|count| send(&server.router, file.request("race", count)));
    let results = futures::future::join_all(requests).await;

    let done = results
        .iter()
        .filter(|(status, body)| *status == StatusCode::OK && body["done"] == true)
        .count();
    assert_eq!(done, 1);
    assert!(results.iter().all(|(status, _)| *status == StatusCode::OK));

    let meta = server.service.load_metadata(&dir).await.unwrap().unwrap();
    assert_eq!(meta.current, file.max() as u64);
    assert_eq!(std::fs::read(dir.join(ASSEMBLY_FILE)).unwrap(), file.data);
}
