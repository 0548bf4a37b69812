//! Core data models shared by the upload client and the upload server.
//!
//! Client-side records (`Chunk`, `TokenRecord`) map to SQLite rows via
//! `sqlx::FromRow`; server-side records (`UploadMetadata`, `ChunkReceipt`)
//! serialize as JSON via `serde`.

pub mod chunk;
pub mod events;
pub mod upload;
