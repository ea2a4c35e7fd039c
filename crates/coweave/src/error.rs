//! Error types for the node and the pipeline.

use coweave_core::{AppendError, CoreError, RawCoID};
use coweave_keys::KeysError;
use coweave_store::StoreError;
use coweave_sync::SyncError;
use thiserror::Error;

/// Errors that can occur during node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Core primitive error.
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Append or ingest was rejected.
    #[error("append rejected: {0}")]
    Append(#[from] AppendError),

    /// Group, key or permission error.
    #[error("keys error: {0}")]
    Keys(#[from] KeysError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// The CoValue is not tracked by this node.
    #[error("unknown covalue: {0}")]
    UnknownCoValue(RawCoID),

    /// No peer or storage could provide the CoValue.
    #[error("covalue unavailable: {0}")]
    Unavailable(RawCoID),

    /// Local writer is not allowed to write.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// A lock was poisoned by a panicking holder.
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
