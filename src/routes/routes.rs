//! Defines routes for the upload server.
//!
//! ## Structure
//! - `POST /upload` apply one chunk (metadata in `x-upload-*` headers)
//! - `GET  /healthz` liveness
//! - `GET  /readyz` readiness (disk probe in the upload directory)

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::upload_chunk,
    },
    services::upload_service::UploadService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Build the router carrying `UploadService` as shared state.
///
/// Chunk bodies larger than `max_chunk_size` are rejected before they reach
/// the service.
pub fn routes(max_chunk_size: usize) -> Router<UploadService> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route(
            "/upload",
            post(upload_chunk).layer(DefaultBodyLimit::max(max_chunk_size)),
        )
}
