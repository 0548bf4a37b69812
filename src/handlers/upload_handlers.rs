//! HTTP handler for chunk delivery.
//! Chunk metadata travels in `x-upload-*` headers, the raw bytes in the body;
//! all state handling is delegated to `UploadService`.

use crate::{
    errors::AppError,
    models::{
        chunk::{chunk_id, headers},
        upload::{ChunkDescriptor, ChunkReceipt},
    },
    services::upload_service::UploadService,
};
use axum::{
    Json,
    body::Bytes,
    extract::{State, rejection::BytesRejection},
    http::HeaderMap,
};
use tracing::debug;
use unicode_normalization::UnicodeNormalization;

/// `POST /upload`: apply one chunk to its token directory.
pub async fn upload_chunk(
    State(service): State<UploadService>,
    header_map: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<ChunkReceipt>, AppError> {
    let chunk = descriptor_from_headers(&header_map)?;
    let body = body.map_err(|rejection| AppError::new(rejection.status(), rejection.body_text()))?;

    debug!(id = %chunk.id, bytes = body.len(), "chunk received");
    let receipt = service.accept_chunk(chunk, body).await?;
    Ok(Json(receipt))
}

/// Parse the chunk headers. Missing or non-numeric integers are fatal, as is
/// any character outside `[A-Za-z0-9]` in the token or hash.
pub fn descriptor_from_headers(map: &HeaderMap) -> Result<ChunkDescriptor, AppError> {
    let count = header_u64(map, headers::COUNT)?;
    let token = header_token(map, headers::TOKEN)?;
    Ok(ChunkDescriptor {
        id: chunk_id(&token, count),
        count,
        max: header_u64(map, headers::MAX)?,
        size: header_u64(map, headers::SIZE)?,
        filename: header_text(map, headers::FILENAME)?
            .ok_or_else(|| AppError::bad_request("missing filename"))?,
        filesize: header_u64(map, headers::FILESIZE)?,
        filetype: header_text(map, headers::FILETYPE)?.unwrap_or_default(),
        token,
        hash: header_token(map, headers::HASH)?,
        path: header_text(map, headers::PATH)?.unwrap_or_default(),
    })
}

/// Header value as UTF-8; clients send non-ASCII file names as raw bytes.
fn header_string(map: &HeaderMap, name: &'static str) -> Result<Option<String>, AppError> {
    map.get(name)
        .map(|value| {
            String::from_utf8(value.as_bytes().to_vec())
                .map_err(|_| AppError::bad_request(format!("header {} is not UTF-8", name)))
        })
        .transpose()
}

/// Free-text header in Unicode NFC, so names typed on macOS (NFD) and
/// elsewhere compare equal.
fn header_text(map: &HeaderMap, name: &'static str) -> Result<Option<String>, AppError> {
    Ok(header_string(map, name)?.map(|raw| raw.nfc().collect()))
}

fn header_u64(map: &HeaderMap, name: &'static str) -> Result<u64, AppError> {
    let raw = header_string(map, name)?
        .ok_or_else(|| AppError::bad_request(format!("missing header {}", name)))?;
    raw.trim()
        .parse::<u64>()
        .map_err(|_| AppError::bad_request(format!("header {} is not a number: `{}`", name, raw)))
}

fn header_token(map: &HeaderMap, name: &'static str) -> Result<String, AppError> {
    let raw = header_string(map, name)?.unwrap_or_default();
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(AppError::bad_request(format!(
            "header {} must be alphanumeric",
            name
        )));
    }
    Ok(raw)
}
