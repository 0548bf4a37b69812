//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks disk I/O in the upload directory

use crate::services::upload_service::UploadService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;
use tokio::fs;
use uuid::Uuid;

/// `GET /healthz`
///
/// Liveness probe, always 200 OK, never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Performs a write/read/delete round trip on a temp file under the upload
/// base directory. HTTP 200 when it works, 503 otherwise.
pub async fn readyz(State(service): State<UploadService>) -> impl IntoResponse {
    let tmp_path = service
        .base_path
        .join(format!(".readyz-{}", Uuid::new_v4()));
    let disk_check = match fs::write(&tmp_path, b"readyz").await {
        Ok(_) => match fs::read(&tmp_path).await {
            Ok(bytes) if bytes == b"readyz" => match fs::remove_file(&tmp_path).await {
                Ok(_) => (true, None::<String>),
                Err(e) => (true, Some(format!("could not remove tmp file: {}", e))),
            },
            Ok(_) => {
                let _ = fs::remove_file(&tmp_path).await;
                (false, Some("file content mismatch".to_string()))
            }
            Err(e) => {
                let _ = fs::remove_file(&tmp_path).await;
                (false, Some(format!("could not read tmp file: {}", e)))
            }
        },
        Err(e) => (false, Some(format!("could not write tmp file: {}", e))),
    };

    let disk_ok = disk_check.0;
    let mut checks = HashMap::new();
    checks.insert(
        "disk",
        CheckStatus {
            ok: disk_ok,
            error: disk_check.1,
        },
    );

    let body = ReadyResponse {
        status: if disk_ok { "ok".into() } else { "error".into() },
        checks,
    };
    let status = if disk_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
