//! src/services/upload_service.rs
//!
//! UploadService: the per-token state machine behind `POST /upload`.
//!
//! Every token owns a directory beneath `base_path` that an external
//! authentication step creates before the first chunk arrives. The directory
//! holds `metadata.json`, the assembly file `upload.part`, a transient `.lock`
//! marker and, once an upload is rejected for good, a `.forbid` marker.
//! One request applies one chunk inside a critical section guarded by an
//! in-process mutex keyed by token plus the `.lock` marker for other processes.

use crate::models::{
    chunk::is_token_safe,
    upload::{ChunkDescriptor, ChunkReceipt, UploadMetadata},
};
use crate::services::digest::sha256_file;
use bytes::Bytes;
use std::{
    collections::HashMap,
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;
use tokio::{
    fs::{self, OpenOptions},
    io::{AsyncSeekExt, AsyncWriteExt},
    sync::{Mutex as AsyncMutex, OwnedMutexGuard},
    time::Instant,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const METADATA_FILE: &str = "metadata.json";
pub const ASSEMBLY_FILE: &str = "upload.part";
pub const LOCK_MARKER: &str = ".lock";
pub const FORBID_MARKER: &str = ".forbid";

/// 100 GiB.
pub const DEFAULT_MAX_TOTAL_SIZE: u64 = 100 * 1024 * 1024 * 1024;
pub const DEFAULT_LOCK_RETRIES: u32 = 20;
pub const DEFAULT_LOCK_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("invalid chunk: {0}")]
    InvalidChunk(String),
    #[error("upload directory for token `{0}` is missing or not writable")]
    Unauthorized(String),
    #[error("token `{0}` is forbidden")]
    Forbidden(String),
    #[error("timed out waiting for the lock on token `{0}`")]
    LockTimeout(String),
    #[error("declared upload size exceeds the {limit} byte limit for token `{token}`")]
    TooLarge { token: String, limit: u64 },
    #[error("hash mismatch for token `{token}`: expected {expected}, got {actual}")]
    HashMismatch {
        token: String,
        expected: String,
        actual: String,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

/// Callbacks the deployment environment receives when an upload ends.
pub trait UploadHooks: Send + Sync {
    /// The assembly file matched the declared hash.
    fn upload_done(&self, meta: &UploadMetadata);

    /// The assembly file did not match; its directory is already gone.
    fn upload_failed(&self, meta: &UploadMetadata);
}

/// Hooks that only log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHooks;

impl UploadHooks for LogHooks {
    fn upload_done(&self, meta: &UploadMetadata) {
        info!(
            token = %meta.token,
            filename = %meta.filename,
            filesize = meta.filesize,
            "upload complete"
        );
    }

    fn upload_failed(&self, meta: &UploadMetadata) {
        warn!(token = %meta.token, filename = %meta.filename, "upload discarded");
    }
}

/// Tunables for the upload state machine.
#[derive(Clone, Debug)]
pub struct UploadLimits {
    /// Upper bound for `max * chunksize`, checked on the first chunk.
    pub max_total_size: u64,
    /// Together with `lock_interval`, bounds the total wait for the token lock
    /// to `lock_retries * lock_interval`.
    pub lock_retries: u32,
    pub lock_interval: Duration,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_total_size: DEFAULT_MAX_TOTAL_SIZE,
            lock_retries: DEFAULT_LOCK_RETRIES,
            lock_interval: DEFAULT_LOCK_INTERVAL,
        }
    }
}

/// UploadService applies chunks to token directories.
///
/// Cheap to clone; clones share the in-process lock table.
#[derive(Clone)]
pub struct UploadService {
    /// Directory containing one sub-directory per token.
    pub base_path: PathBuf,

    limits: UploadLimits,
    hooks: Arc<dyn UploadHooks>,
    locks: TokenLocks,
}

impl UploadService {
    /// Create a service rooted at `base_path` with default limits and logging hooks.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self::with_limits(base_path, UploadLimits::default())
    }

    pub fn with_limits(base_path: impl Into<PathBuf>, limits: UploadLimits) -> Self {
        Self {
            base_path: base_path.into(),
            limits,
            hooks: Arc::new(LogHooks),
            locks: TokenLocks::default(),
        }
    }

    /// Replace the completion/failure callbacks.
    pub fn with_hooks(mut self, hooks: Arc<dyn UploadHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn limits(&self) -> &UploadLimits {
        &self.limits
    }

    /// Directory owned by `token`. The token must already be validated.
    pub fn token_dir(&self, token: &str) -> PathBuf {
        self.base_path.join(token)
    }

    /// Apply one chunk.
    ///
    /// - Rejects malformed chunks before touching disk.
    /// - Requires the token directory to exist, be writable and not forbidden.
    /// - Holds the token lock across load, write and persist.
    /// - Answers `duplicate = true` for a chunk id that was already applied.
    /// - Verifies the whole-file hash once the last distinct chunk lands.
    pub async fn accept_chunk(
        &self,
        chunk: ChunkDescriptor,
        body: Bytes,
    ) -> UploadResult<ChunkReceipt> {
        validate_chunk(&chunk, &body)?;

        let dir = self.token_dir(&chunk.token);
        self.ensure_writable_dir(&dir, &chunk.token).await?;
        if self.is_forbidden(&dir).await? {
            return Err(UploadError::Forbidden(chunk.token));
        }

        let lock = self.lock(&dir, &chunk.token).await?;
        // A request that held the lock before us may have forbidden the token.
        if self.is_forbidden(&dir).await? {
            return Err(UploadError::Forbidden(chunk.token));
        }

        let mut meta = match self.load_metadata(&dir).await? {
            Some(meta) => {
                if meta.max != chunk.max || meta.chunksize != chunk.size {
                    return Err(UploadError::InvalidChunk(format!(
                        "chunk declares max={} size={}, upload has max={} size={}",
                        chunk.max, chunk.size, meta.max, meta.chunksize
                    )));
                }
                meta
            }
            None => {
                let meta = UploadMetadata::from_first_chunk(&chunk);
                match meta.declared_total() {
                    Some(total) if total <= self.limits.max_total_size => meta,
                    declared => {
                        warn!(
                            token = %chunk.token,
                            declared = ?declared,
                            limit = self.limits.max_total_size,
                            "upload too big, forbidding token"
                        );
                        self.forbid(&dir).await?;
                        drop(lock);
                        return Err(UploadError::TooLarge {
                            token: chunk.token,
                            limit: self.limits.max_total_size,
                        });
                    }
                }
            }
        };

        let mut receipt = ChunkReceipt::accepted(&chunk);
        if meta.parts.contains_key(&chunk.id) {
            debug!(id = %chunk.id, "duplicate chunk");
            receipt.duplicate = true;
            return Ok(receipt);
        }

        let offset = chunk.count.checked_mul(meta.chunksize).ok_or_else(|| {
            UploadError::InvalidChunk(format!("offset of chunk {} overflows", chunk.id))
        })?;
        self.write_part(&dir, offset, &body).await?;

        meta.current += 1;
        debug!(
            id = %chunk.id,
            current = meta.current,
            max = meta.max,
            "chunk applied"
        );
        meta.parts.insert(chunk.id.clone(), chunk);
        self.save_metadata(&dir, &meta).await?;

        if meta.is_complete() {
            let actual = sha256_file(&dir.join(ASSEMBLY_FILE)).await?;
            if !actual.eq_ignore_ascii_case(&meta.hash) {
                error!(
                    token = %meta.token,
                    expected = %meta.hash,
                    actual = %actual,
                    "hash mismatch, discarding upload"
                );
                // Held until the directory is gone so no waiter sees its metadata.
                self.discard(&dir).await;
                drop(lock);
                self.hooks.upload_failed(&meta);
                return Err(UploadError::HashMismatch {
                    token: meta.token.clone(),
                    expected: meta.hash.clone(),
                    actual,
                });
            }
            receipt.done = true;
            self.hooks.upload_done(&meta);
        }

        Ok(receipt)
    }

    /// Read `metadata.json` if the upload has started.
    pub async fn load_metadata(&self, dir: &Path) -> UploadResult<Option<UploadMetadata>> {
        match fs::read(dir.join(METADATA_FILE)).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Persist metadata through a temp file and rename so readers never see
    /// a half-written document.
    async fn save_metadata(&self, dir: &Path, meta: &UploadMetadata) -> UploadResult<()> {
        let raw = serde_json::to_vec(meta)?;
        let tmp_path = dir.join(format!(".metadata-{}.tmp", Uuid::new_v4()));
        let result: io::Result<()> = async {
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(&raw).await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, dir.join(METADATA_FILE)).await
        }
        .await;
        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        Ok(())
    }

    /// Write `body` into the assembly file at `offset` without truncating it.
    async fn write_part(&self, dir: &Path, offset: u64, body: &[u8]) -> UploadResult<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(dir.join(ASSEMBLY_FILE))
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(body).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn ensure_writable_dir(&self, dir: &Path, token: &str) -> UploadResult<()> {
        match fs::metadata(dir).await {
            Ok(meta) if meta.is_dir() && !meta.permissions().readonly() => Ok(()),
            Ok(_) => Err(UploadError::Unauthorized(token.to_string())),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(UploadError::Unauthorized(token.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn is_forbidden(&self, dir: &Path) -> UploadResult<bool> {
        Ok(fs::try_exists(dir.join(FORBID_MARKER)).await?)
    }

    async fn forbid(&self, dir: &Path) -> UploadResult<()> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dir.join(FORBID_MARKER))
            .await
        {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Remove every artifact of a failed upload, directory included.
    async fn discard(&self, dir: &Path) {
        if let Err(err) = fs::remove_dir_all(dir).await {
            if err.kind() != ErrorKind::NotFound {
                warn!("failed to remove upload directory {}: {}", dir.display(), err);
            }
        }
    }

    /// Take the token lock: the in-process mutex first, then the `.lock`
    /// marker, retried every `lock_interval`. Both stages share one deadline of
    /// `lock_retries * lock_interval`.
    async fn lock(&self, dir: &Path, token: &str) -> UploadResult<DirLock> {
        let deadline = Instant::now() + self.limits.lock_interval * self.limits.lock_retries;
        let local =
            match tokio::time::timeout_at(deadline, self.locks.handle(token).lock_owned()).await {
                Ok(guard) => guard,
                Err(_) => {
                    self.locks.prune(token);
                    warn!(token, "gave up waiting for in-process upload lock");
                    return Err(UploadError::LockTimeout(token.to_string()));
                }
            };

        let marker = dir.join(LOCK_MARKER);
        let mut attempts = 0;
        let failure = loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&marker)
                .await
            {
                Ok(_) => {
                    return Ok(DirLock {
                        marker,
                        token: token.to_string(),
                        locks: self.locks.clone(),
                        local: Some(local),
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    attempts += 1;
                    if Instant::now() + self.limits.lock_interval > deadline {
                        warn!(token, attempts, "gave up waiting for upload lock");
                        break UploadError::LockTimeout(token.to_string());
                    }
                    tokio::time::sleep(self.limits.lock_interval).await;
                }
                // The directory vanished while we waited (e.g. a failed finalize).
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    break UploadError::Unauthorized(token.to_string());
                }
                Err(err) => break err.into(),
            }
        };
        drop(local);
        self.locks.prune(token);
        Err(failure)
    }
}

/// Reject chunks whose declared fields cannot describe a valid upload.
fn validate_chunk(chunk: &ChunkDescriptor, body: &[u8]) -> UploadResult<()> {
    let invalid = |msg: String| -> UploadResult<()> { Err(UploadError::InvalidChunk(msg)) };
    if !is_token_safe(&chunk.token) {
        return invalid("token must be alphanumeric".into());
    }
    if !is_token_safe(&chunk.hash) {
        return invalid("hash must be alphanumeric".into());
    }
    if chunk.max == 0 || chunk.size == 0 {
        return invalid("max and size must be positive".into());
    }
    if chunk.count >= chunk.max {
        return invalid(format!("count {} out of range 0..{}", chunk.count, chunk.max));
    }
    if chunk.filesize.div_ceil(chunk.size) != chunk.max {
        return invalid(format!(
            "filesize {} does not split into {} chunks of {}",
            chunk.filesize, chunk.max, chunk.size
        ));
    }
    if body.is_empty() || body.len() as u64 > chunk.size {
        return invalid(format!(
            "body of {} bytes does not fit chunk size {}",
            body.len(),
            chunk.size
        ));
    }
    Ok(())
}

/// In-process lock table, one async mutex per token currently in use.
#[derive(Clone, Default)]
struct TokenLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl TokenLocks {
    fn handle(&self, token: &str) -> Arc<AsyncMutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(token.to_string()).or_default().clone()
    }

    /// Drop the entry once nobody else holds or waits on it.
    fn prune(&self, token: &str) {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if map
            .get(token)
            .is_some_and(|handle| Arc::strong_count(handle) == 1)
        {
            map.remove(token);
        }
    }
}

/// Held token lock. Dropping it removes the `.lock` marker and wakes the next
/// in-process waiter, so every exit path of a request releases it.
struct DirLock {
    marker: PathBuf,
    token: String,
    locks: TokenLocks,
    local: Option<OwnedMutexGuard<()>>,
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.marker) {
            if err.kind() != ErrorKind::NotFound {
                warn!("failed to remove lock {}: {}", self.marker.display(), err);
            }
        }
        self.local.take();
        self.locks.prune(&self.token);
    }
}
