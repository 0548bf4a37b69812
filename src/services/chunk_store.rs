//! src/services/chunk_store.rs
//!
//! ChunkStore: the client's durable upload queue, backed by SQLite.
//!
//! `chunks` holds every slice not yet acknowledged by the server (indexed by
//! token), `tokens` holds one bookkeeping row per upload. The slicer only
//! appends and the synchronizer only reads and removes; each operation below
//! is a single statement or a single transaction, which is all the
//! coordination the two workers need.

use crate::models::chunk::{Chunk, TokenPatch, TokenProgress, TokenRecord};
use sqlx::{
    FromRow, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
};
use std::{io, path::Path, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::debug;

const SCHEMA: &str = include_str!("../../migrations/0001_client_cache.sql");

const CHUNK_COLUMNS: &str =
    "id, token, count, max, size, filename, filesize, filetype, hash, path, part, fail_count";
const TOKEN_COLUMNS: &str = "token, start, path, filename, filesize, max, hash";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("chunk has no id")]
    MissingId,
    #[error("chunk `{0}` is already queued")]
    DuplicateChunk(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(FromRow)]
struct ProgressRow {
    #[sqlx(flatten)]
    record: TokenRecord,
    left_count: i64,
}

/// Durable keyed storage for queued chunks and token records.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Clone, Debug)]
pub struct ChunkStore {
    pool: SqlitePool,
}

impl ChunkStore {
    /// Open (or create) the cache database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        // One connection: every operation is serialized by the pool itself.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        debug!("opened chunk cache at {}", path.display());
        Ok(store)
    }

    async fn migrate(&self) -> StoreResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty());
        for stmt in statements {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Queue a chunk and register its token on first sight.
    ///
    /// Both inserts share one transaction, so a token record exists iff at
    /// least one of its chunks was ever stored, and is inserted only once.
    pub async fn add(&self, chunk: &Chunk) -> StoreResult<()> {
        if chunk.id.is_empty() {
            return Err(StoreError::MissingId);
        }

        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(&format!(
            "INSERT INTO chunks ({CHUNK_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)"
        ))
        .bind(&chunk.id)
        .bind(&chunk.token)
        .bind(chunk.count)
        .bind(chunk.max)
        .bind(chunk.size)
        .bind(&chunk.filename)
        .bind(chunk.filesize)
        .bind(&chunk.filetype)
        .bind(&chunk.hash)
        .bind(&chunk.path)
        .bind(&chunk.part)
        .execute(&mut *tx)
        .await;
        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(StoreError::DuplicateChunk(chunk.id.clone()));
            }
            Err(err) => return Err(err.into()),
        }

        let record = TokenRecord::from_chunk(chunk);
        sqlx::query(&format!(
            "INSERT OR IGNORE INTO tokens ({TOKEN_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&record.token)
        .bind(record.start)
        .bind(&record.path)
        .bind(&record.filename)
        .bind(record.filesize)
        .bind(record.max)
        .bind(&record.hash)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Delete a chunk by id and return the token it belonged to.
    pub async fn remove(&self, chunk_id: &str) -> StoreResult<Option<String>> {
        let token = sqlx::query_scalar::<_, String>("DELETE FROM chunks WHERE id = ? RETURNING token")
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(token)
    }

    pub async fn get(&self, chunk_id: &str) -> StoreResult<Option<Chunk>> {
        let chunk = sqlx::query_as::<_, Chunk>(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE id = ?"
        ))
        .bind(chunk_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(chunk)
    }

    /// Up to `limit` queued chunk ids, lowest sequence number first.
    pub async fn chunk_ids(&self, limit: usize) -> StoreResult<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT id FROM chunks ORDER BY count ASC, token ASC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Number of queued chunks for `token`.
    pub async fn has_chunk_count(&self, token: &str) -> StoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM chunks WHERE token = ?")
            .bind(token)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn is_empty(&self) -> StoreResult<bool> {
        let any = sqlx::query_scalar::<_, i64>("SELECT EXISTS(SELECT 1 FROM chunks)")
            .fetch_one(&self.pool)
            .await?;
        Ok(any == 0)
    }

    /// Bump the diagnostic failure counter of a chunk. False if it is gone.
    pub async fn inc_fail(&self, chunk_id: &str) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE chunks SET fail_count = fail_count + 1 WHERE id = ?")
            .bind(chunk_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Drop every queued chunk of `token`, returning how many were removed.
    pub async fn remove_token_chunks(&self, token: &str) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM chunks WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn isset_token(&self, token: &str) -> StoreResult<bool> {
        let exists =
            sqlx::query_scalar::<_, i64>("SELECT EXISTS(SELECT 1 FROM tokens WHERE token = ?)")
                .bind(token)
                .fetch_one(&self.pool)
                .await?;
        Ok(exists != 0)
    }

    pub async fn get_token(&self, token: &str) -> StoreResult<Option<TokenRecord>> {
        let record = sqlx::query_as::<_, TokenRecord>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens WHERE token = ?"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Merge `patch` into the record of `token`, creating it if needed.
    ///
    /// A single upsert statement: fields absent from the patch keep their
    /// stored value, and concurrent merges cannot overwrite each other.
    pub async fn set_token(&self, token: &str, patch: TokenPatch) -> StoreResult<TokenRecord> {
        let start = patch.start.unwrap_or_else(chrono::Utc::now);
        let record = sqlx::query_as::<_, TokenRecord>(&format!(
            r#"
            INSERT INTO tokens ({TOKEN_COLUMNS})
            VALUES (?1, ?2, COALESCE(?3, ''), COALESCE(?4, ''), COALESCE(?5, 0),
                    COALESCE(?6, 0), COALESCE(?7, ''))
            ON CONFLICT(token) DO UPDATE SET
                start = COALESCE(?8, start),
                path = COALESCE(?3, path),
                filename = COALESCE(?4, filename),
                filesize = COALESCE(?5, filesize),
                max = COALESCE(?6, max),
                hash = COALESCE(?7, hash)
            RETURNING {TOKEN_COLUMNS}
            "#
        ))
        .bind(token)
        .bind(start)
        .bind(patch.path)
        .bind(patch.filename)
        .bind(patch.filesize)
        .bind(patch.max)
        .bind(patch.hash)
        .bind(patch.start)
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }

    /// Delete the record of `token` and return what it held.
    ///
    /// `None` when another caller already removed it, so completion is
    /// observed exactly once.
    pub async fn remove_token(&self, token: &str) -> StoreResult<Option<TokenRecord>> {
        let record = sqlx::query_as::<_, TokenRecord>(&format!(
            "DELETE FROM tokens WHERE token = ? RETURNING {TOKEN_COLUMNS}"
        ))
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Record that every chunk of `token` has been queued. False if the token is unknown.
    pub async fn mark_sliced(&self, token: &str) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE tokens SET sliced = 1 WHERE token = ?")
            .bind(token)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete and return every fully sliced token with no chunk left in the queue.
    ///
    /// Each record comes back from exactly one call.
    pub async fn take_completed(&self) -> StoreResult<Vec<TokenRecord>> {
        let records = sqlx::query_as::<_, TokenRecord>(&format!(
            r#"
            DELETE FROM tokens
            WHERE sliced = 1
              AND NOT EXISTS (SELECT 1 FROM chunks c WHERE c.token = tokens.token)
            RETURNING {TOKEN_COLUMNS}
            "#
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Drop every token whose slicing never finished, with its queued chunks.
    /// Only safe while no producer is running.
    pub async fn discard_unsliced(&self) -> StoreResult<Vec<TokenRecord>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM chunks WHERE token IN (SELECT token FROM tokens WHERE sliced = 0)",
        )
        .execute(&mut *tx)
        .await?;
        let records = sqlx::query_as::<_, TokenRecord>(&format!(
            "DELETE FROM tokens WHERE sliced = 0 RETURNING {TOKEN_COLUMNS}"
        ))
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(records)
    }

    pub async fn list_tokens(&self) -> StoreResult<Vec<TokenRecord>> {
        let records = sqlx::query_as::<_, TokenRecord>(&format!(
            "SELECT {TOKEN_COLUMNS} FROM tokens ORDER BY start ASC, token ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// Every token record with its remaining chunk count and percent complete.
    pub async fn get_progress(&self) -> StoreResult<Vec<TokenProgress>> {
        let rows = sqlx::query_as::<_, ProgressRow>(
            r#"
            SELECT t.token, t.start, t.path, t.filename, t.filesize, t.max, t.hash,
                   (SELECT COUNT(*) FROM chunks c WHERE c.token = t.token) AS left_count
            FROM tokens t
            ORDER BY t.start ASC, t.token ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| TokenProgress::new(row.record, row.left_count))
            .collect())
    }

    /// Delete all chunks and all token records.
    pub async fn clear(&self) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM tokens").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Close the pool, flushing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.is_unique_violation()
    )
}
