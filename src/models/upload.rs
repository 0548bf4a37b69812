//! Server-side records for one upload directory.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata one chunk request declares in its headers.
///
/// Stored verbatim under `UploadMetadata::parts` once the chunk is applied.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChunkDescriptor {
    pub id: String,
    pub count: u64,
    pub max: u64,
    pub size: u64,
    pub filename: String,
    pub filesize: u64,
    pub filetype: String,
    pub token: String,
    pub hash: String,
    pub path: String,
}

/// Contents of `metadata.json` inside a token directory.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct UploadMetadata {
    pub max: u64,
    pub chunksize: u64,

    /// Number of distinct chunk ids applied so far.
    pub current: u64,

    pub filename: String,
    pub filesize: u64,
    pub token: String,
    pub filetype: String,

    /// Declared whole-file SHA-256, compared once `current == max`.
    pub hash: String,

    pub path: String,

    /// Applied chunks keyed by chunk id, used for dedup.
    #[serde(default)]
    pub parts: BTreeMap<String, ChunkDescriptor>,
}

impl UploadMetadata {
    /// Fresh metadata built from the chunk that opens the upload.
    pub fn from_first_chunk(chunk: &ChunkDescriptor) -> Self {
        Self {
            max: chunk.max,
            chunksize: chunk.size,
            current: 0,
            filename: chunk.filename.clone(),
            filesize: chunk.filesize,
            token: chunk.token.clone(),
            filetype: chunk.filetype.clone(),
            hash: chunk.hash.clone(),
            path: chunk.path.clone(),
            parts: BTreeMap::new(),
        }
    }

    /// Total bytes this upload may occupy, `None` on overflow.
    pub fn declared_total(&self) -> Option<u64> {
        self.max.checked_mul(self.chunksize)
    }

    pub fn is_complete(&self) -> bool {
        self.current == self.max
    }
}

/// Response body for an accepted chunk.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ChunkReceipt {
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub duplicate: bool,
    pub done: bool,
}

impl ChunkReceipt {
    pub fn accepted(chunk: &ChunkDescriptor) -> Self {
        Self {
            id: Some(chunk.id.clone()),
            token: Some(chunk.token.clone()),
            duplicate: false,
            done: false,
        }
    }

    /// The minimal body sent back for every rejected request.
    pub fn rejected() -> Self {
        Self {
            id: None,
            token: None,
            duplicate: false,
            done: false,
        }
    }
}
