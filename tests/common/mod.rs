//! Shared helpers for the HTTP-level tests.
#![allow(dead_code)]

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use resumable_upload::{
    models::chunk::headers,
    routes::routes::routes,
    services::{
        digest::sha256_bytes,
        upload_service::{UploadLimits, UploadService},
    },
};
use serde_json::Value;
use std::path::PathBuf;
use tempfile::TempDir;
use tower::ServiceExt;

pub const MAX_CHUNK_SIZE: usize = 64 * 1024;

pub struct TestServer {
    pub dir: TempDir,
    pub service: UploadService,
    pub router: Router,
}

impl TestServer {
    pub fn new() -> Self {
        Self::with_limits(UploadLimits::default())
    }

    pub fn with_limits(limits: UploadLimits) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = UploadService::with_limits(dir.path(), limits);
        let router = routes(MAX_CHUNK_SIZE).with_state(service.clone());
        Self {
            dir,
            service,
            router,
        }
    }

    /// Stand-in for the external authentication step.
    pub fn authorize(&self, token: &str) -> PathBuf {
        let path = self.dir.path().join(token);
        std::fs::create_dir_all(&path).expect("create token dir");
        path
    }
}

/// A file split the way the client slices it.
pub struct TestFile {
    pub data: Vec<u8>,
    pub hash: String,
    pub size: usize,
}

impl TestFile {
    pub fn new(len: usize, size: usize) -> Self {
        let data: Vec<u8> = (0..len).map(|i| (i * 31 % 251) as u8).collect();
        let hash = sha256_bytes(&data);
        Self { data, hash, size }
    }

    pub fn max(&self) -> usize {
        self.data.len().div_ceil(self.size)
    }

    pub fn part(&self, count: usize) -> Vec<u8> {
        let start = count * self.size;
        let end = (start + self.size).min(self.data.len());
        self.data[start..end].to_vec()
    }

    pub fn request(&self, token: &str, count: usize) -> Request<Body> {
        chunk_request(token, &self.hash, count, self.max(), self.size, self.data.len(), self.part(count))
    }
}

pub fn chunk_request(
    token: &str,
    hash: &str,
    count: usize,
    max: usize,
    size: usize,
    filesize: usize,
    body: Vec<u8>,
) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/upload")
        .header(headers::COUNT, count.to_string())
        .header(headers::MAX, max.to_string())
        .header(headers::SIZE, size.to_string())
        .header(headers::FILENAME, "sample.bin")
        .header(headers::FILESIZE, filesize.to_string())
        .header(headers::FILETYPE, "application/octet-stream")
        .header(headers::TOKEN, token)
        .header(headers::HASH, hash)
        .header(headers::PATH, "incoming")
        .body(Body::from(body))
        .expect("request")
}

pub async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.expect("oneshot");
    let status = response.status();
    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let json = if body_bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
    };
    (status, json)
}
