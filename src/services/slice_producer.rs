//! src/services/slice_producer.rs
//!
//! SliceProducer hashes a file once, then cuts it into fixed-size chunks and
//! queues each one in the `ChunkStore` as soon as it is read.

use crate::models::{
    chunk::{Chunk, chunk_id, is_token_safe},
    events::{UploadEvent, UploadState},
};
use crate::services::{
    chunk_store::{ChunkStore, StoreError},
    digest::sha256_file,
};
use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::{fs::File, io::AsyncReadExt, sync::mpsc::UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("token `{0}` must be non-empty and alphanumeric")]
    InvalidToken(String),
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,
    #[error("`{0}` is empty")]
    EmptyFile(PathBuf),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A file the host wants uploaded.
#[derive(Clone, Debug)]
pub struct SliceRequest {
    pub file: PathBuf,
    pub token: String,

    /// Destination path hint forwarded to the server.
    pub path: String,

    pub filetype: String,
}

/// What one slicing run produced.
#[derive(Clone, Debug, PartialEq)]
pub struct SliceReport {
    pub token: String,
    pub hash: String,
    pub max: u64,
    pub enqueued: u64,
    pub cancelled: bool,
}

#[derive(Clone, Debug)]
pub struct SliceProducer {
    store: ChunkStore,
    chunk_size: usize,
    events: UnboundedSender<UploadEvent>,
}

impl SliceProducer {
    pub fn new(store: ChunkStore, chunk_size: usize, events: UnboundedSender<UploadEvent>) -> Self {
        Self {
            store,
            chunk_size,
            events,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Slice `request.file` into the store.
    ///
    /// `cancel` is checked before every chunk; chunks queued before it fired
    /// stay in the store.
    pub async fn slice(
        &self,
        request: &SliceRequest,
        cancel: &CancellationToken,
    ) -> Result<SliceReport, ProducerError> {
        if !is_token_safe(&request.token) {
            return Err(ProducerError::InvalidToken(request.token.clone()));
        }
        if self.chunk_size == 0 {
            return Err(ProducerError::InvalidChunkSize);
        }

        let _ = self
            .events
            .send(UploadEvent::State(UploadState::Preparation));

        let filesize = tokio::fs::metadata(&request.file).await?.len();
        if filesize == 0 {
            return Err(ProducerError::EmptyFile(request.file.clone()));
        }

        let hash = sha256_file(&request.file).await?;
        let chunk_size = self.chunk_size as u64;
        let max = filesize.div_ceil(chunk_size);
        let filename = file_name(&request.file);
        info!(
            token = %request.token,
            filename = %filename,
            filesize,
            max,
            "slicing file"
        );

        let mut report = SliceReport {
            token: request.token.clone(),
            hash: hash.clone(),
            max,
            enqueued: 0,
            cancelled: false,
        };

        let mut file = File::open(&request.file).await?;
        for count in 0..max {
            if cancel.is_cancelled() {
                info!(token = %request.token, enqueued = report.enqueued, "slicing cancelled");
                report.cancelled = true;
                return Ok(report);
            }

            let offset = count * chunk_size;
            let len = chunk_size.min(filesize - offset) as usize;
            let mut part = vec![0u8; len];
            file.read_exact(&mut part).await?;

            let chunk = Chunk {
                id: chunk_id(&request.token, count),
                token: request.token.clone(),
                count: count as i64,
                max: max as i64,
                size: chunk_size as i64,
                filename: filename.clone(),
                filesize: filesize as i64,
                filetype: request.filetype.clone(),
                hash: hash.clone(),
                path: request.path.clone(),
                part,
                fail_count: 0,
            };
            self.store.add(&chunk).await?;
            report.enqueued += 1;
            debug!(id = %chunk.id, bytes = len, "chunk queued");
        }

        // The token may settle only from here on.
        self.store.mark_sliced(&request.token).await?;
        Ok(report)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
