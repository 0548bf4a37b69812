//! Delivery of one queued chunk to the upload endpoint.

use crate::models::{
    chunk::{Chunk, headers},
    upload::ChunkReceipt,
};
use reqwest::{
    StatusCode, Url,
    header::{HeaderMap, HeaderValue},
};
use std::{
    future::Future,
    sync::{Arc, RwLock},
    time::Duration,
};
use thiserror::Error;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum TransportError {
    /// The server will never accept this upload (forbidden, too large, hash mismatch).
    #[error("server rejected chunk `{id}` permanently ({status})")]
    Terminal { id: String, status: StatusCode },
    #[error("server refused chunk `{id}` ({status})")]
    Rejected { id: String, status: StatusCode },
    #[error("server acknowledged {actual:?} instead of `{expected}`")]
    Mismatch {
        expected: String,
        actual: Option<String>,
    },
    #[error("chunk `{id}` cannot be sent: invalid {header} header")]
    Header { id: String, header: &'static str },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl TransportError {
    /// Retrying the chunk cannot succeed; the whole upload should be dropped.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Terminal { .. } | Self::Header { .. })
    }
}

/// Statuses the upload endpoint uses for failures that end an upload.
pub fn is_terminal_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::GONE | StatusCode::PAYLOAD_TOO_LARGE | StatusCode::UNPROCESSABLE_ENTITY
    )
}

/// Sends a chunk and returns the server's receipt for it.
///
/// `Ok` means the server acknowledged exactly this chunk id.
pub trait ChunkTransport: Send + Sync + 'static {
    fn send(&self, chunk: &Chunk) -> impl Future<Output = Result<ChunkReceipt, TransportError>> + Send;
}

/// `reqwest` transport posting raw chunk bytes with `x-upload-*` headers.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    http: reqwest::Client,
    endpoint: Arc<RwLock<Url>>,
}

impl HttpTransport {
    pub fn new(endpoint: Url) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            endpoint: Arc::new(RwLock::new(endpoint)),
        })
    }

    pub fn endpoint(&self) -> Url {
        self.endpoint
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Point subsequent requests at `endpoint`; requests in flight are unaffected.
    pub fn set_endpoint(&self, endpoint: Url) {
        *self
            .endpoint
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = endpoint;
    }
}

impl ChunkTransport for HttpTransport {
    async fn send(&self, chunk: &Chunk) -> Result<ChunkReceipt, TransportError> {
        let header_map = chunk_headers(chunk)?;
        let response = self
            .http
            .post(self.endpoint())
            .headers(header_map)
            .body(chunk.part.clone())
            .send()
            .await?;

        let status = response.status();
        debug!(id = %chunk.id, status = status.as_u16(), "chunk posted");
        if !status.is_success() {
            let id = chunk.id.clone();
            return Err(if is_terminal_status(status) {
                TransportError::Terminal { id, status }
            } else {
                TransportError::Rejected { id, status }
            });
        }

        let receipt: ChunkReceipt = response.json().await?;
        if receipt.id.as_deref() != Some(chunk.id.as_str()) {
            return Err(TransportError::Mismatch {
                expected: chunk.id.clone(),
                actual: receipt.id,
            });
        }
        Ok(receipt)
    }
}

/// Header set describing `chunk`. String values go out as raw UTF-8.
pub fn chunk_headers(chunk: &Chunk) -> Result<HeaderMap, TransportError> {
    let fields = [
        (headers::COUNT, chunk.count.to_string()),
        (headers::MAX, chunk.max.to_string()),
        (headers::SIZE, chunk.size.to_string()),
        (headers::FILENAME, chunk.filename.clone()),
        (headers::FILESIZE, chunk.filesize.to_string()),
        (headers::FILETYPE, chunk.filetype.clone()),
        (headers::TOKEN, chunk.token.clone()),
        (headers::HASH, chunk.hash.clone()),
        (headers::PATH, chunk.path.clone()),
    ];

    let mut map = HeaderMap::with_capacity(fields.len());
    for (name, value) in fields {
        let value = HeaderValue::from_bytes(value.as_bytes()).map_err(|_| TransportError::Header {
            id: chunk.id.clone(),
            header: name,
        })?;
        map.insert(name, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(filename: &str) -> Chunk {
        Chunk {
            id: "tok-000001".into(),
            token: "tok".into(),
            count: 1,
            max: 3,
            size: 8,
            filename: filename.into(),
            filesize: 20,
            filetype: String::new(),
            hash: "abcd".into(),
            path: String::new(),
            part: vec![0; 8],
            fail_count: 0,
        }
    }

    #[test]
    fn headers_carry_every_field() {
        let map = chunk_headers(&chunk("naïve.txt")).unwrap();
        assert_eq!(map[headers::COUNT], "1");
        assert_eq!(map[headers::MAX], "3");
        assert_eq!(map[headers::TOKEN], "tok");
        assert_eq!(map[headers::FILENAME].as_bytes(), "naïve.txt".as_bytes());
        assert_eq!(map[headers::PATH], "");
    }

    #[test]
    fn control_characters_cannot_be_sent() {
        let err = chunk_headers(&chunk("evil\nname")).unwrap_err();
        assert!(err.is_terminal());
    }

    #[test]
    fn terminal_statuses() {
        assert!(is_terminal_status(StatusCode::GONE));
        assert!(is_terminal_status(StatusCode::PAYLOAD_TOO_LARGE));
        assert!(is_terminal_status(StatusCode::UNPROCESSABLE_ENTITY));
        assert!(!is_terminal_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_terminal_status(StatusCode::FORBIDDEN));
    }

    #[test]
    fn endpoint_can_be_swapped() {
        let transport = HttpTransport::new(Url::parse("http://a.invalid/upload").unwrap()).unwrap();
        transport.set_endpoint(Url::parse("http://b.invalid/upload").unwrap());
        assert_eq!(transport.endpoint().host_str(), Some("b.invalid"));
    }
}
