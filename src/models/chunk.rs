//! Represents a file slice queued on the client and the per-upload token record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Default chunk size: 1 MiB, the same value the server caps chunk bodies at.
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Header names carrying chunk metadata on `POST /upload`.
pub mod headers {
    pub const COUNT: &str = "x-upload-chunk-count";
    pub const MAX: &str = "x-upload-chunk-max";
    pub const SIZE: &str = "x-upload-chunk-size";
    pub const FILENAME: &str = "x-upload-filename";
    pub const FILESIZE: &str = "x-upload-filesize";
    pub const FILETYPE: &str = "x-upload-filetype";
    pub const TOKEN: &str = "x-upload-token";
    pub const HASH: &str = "x-upload-hash";
    pub const PATH: &str = "x-upload-path";
}

/// Build the deterministic chunk id for a (token, sequence) pair.
///
/// The sequence is zero-padded to six digits so ids sort in upload order.
pub fn chunk_id(token: &str, count: u64) -> String {
    format!("{}-{:06}", token, count)
}

/// True when `value` is non-empty and only holds ASCII letters and digits.
///
/// Tokens double as directory names on the server, so nothing else is allowed.
pub fn is_token_safe(value: &str) -> bool {
    !value.is_empty() && value.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// One fixed-size slice of a file plus its transfer metadata.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct Chunk {
    /// `token` followed by the zero-padded sequence number.
    pub id: String,

    /// Upload session this chunk belongs to.
    pub token: String,

    /// 0-based sequence number.
    pub count: i64,

    /// Total number of chunks for the file.
    pub max: i64,

    /// Configured chunk size in bytes (the last chunk may carry fewer).
    pub size: i64,

    pub filename: String,
    pub filesize: i64,
    pub filetype: String,

    /// Whole-file SHA-256, lowercase hex.
    pub hash: String,

    /// Destination path hint echoed to the server.
    pub path: String,

    /// Raw bytes of this slice.
    #[serde(skip)]
    pub part: Vec<u8>,

    /// Number of failed delivery attempts. Diagnostic only.
    pub fail_count: i64,
}

impl Chunk {
    /// Byte offset of this chunk inside the original file.
    pub fn offset(&self) -> i64 {
        self.count * self.size
    }
}

/// Per-upload bookkeeping created on the first chunk enqueue for a token.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct TokenRecord {
    pub token: String,

    /// When the first chunk of this upload was queued.
    pub start: DateTime<Utc>,

    pub path: String,
    pub filename: String,
    pub filesize: i64,
    pub max: i64,
    pub hash: String,
}

impl TokenRecord {
    /// Build the record registered alongside the first chunk of a token.
    pub fn from_chunk(chunk: &Chunk) -> Self {
        Self {
            token: chunk.token.clone(),
            start: Utc::now(),
            path: chunk.path.clone(),
            filename: chunk.filename.clone(),
            filesize: chunk.filesize,
            max: chunk.max,
            hash: chunk.hash.clone(),
        }
    }
}

/// Partial update applied by `ChunkStore::set_token`. `None` keeps the stored value.
#[derive(Clone, Debug, Default)]
pub struct TokenPatch {
    pub start: Option<DateTime<Utc>>,
    pub path: Option<String>,
    pub filename: Option<String>,
    pub filesize: Option<i64>,
    pub max: Option<i64>,
    pub hash: Option<String>,
}

/// A token record with its derived completion figures.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TokenProgress {
    #[serde(flatten)]
    pub record: TokenRecord,

    /// Percent complete, `100 - round(left * 100 / max)`, held at 99 while
    /// any chunk is left.
    pub progress: i64,

    /// Chunks still queued for this token.
    pub left: i64,
}

impl TokenProgress {
    pub fn new(record: TokenRecord, left: i64) -> Self {
        let progress = if left <= 0 {
            100
        } else if record.max <= 0 {
            0
        } else {
            let done = 100 - ((left as f64) * 100.0 / (record.max as f64)).round() as i64;
            done.clamp(0, 99)
        };
        Self {
            record,
            progress,
            left,
        }
    }
}
