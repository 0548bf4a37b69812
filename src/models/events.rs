//! Events the client workers report to their host.

use serde::{Deserialize, Serialize};

use crate::models::chunk::{TokenProgress, TokenRecord};

/// Aggregate upload state, reported on a fixed cadence.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "state", content = "files", rename_all = "lowercase")]
pub enum UploadState {
    /// Hashing/slicing in progress, nothing to report per token yet.
    Preparation,
    /// A whole synchronization batch failed; uploads are paused.
    Disconnected,
    /// Nothing queued.
    None,
    Progress(Vec<TokenProgress>),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "operation", content = "content", rename_all = "camelCase")]
pub enum UploadEvent {
    State(UploadState),

    /// Every chunk of the token was acknowledged by the server.
    UploadDone(TokenRecord),

    /// The server permanently rejected the upload; its queued chunks were dropped.
    UploadFailed { record: TokenRecord, reason: String },
}
