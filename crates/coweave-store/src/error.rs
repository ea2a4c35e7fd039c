//! Error types for the store module.

use coweave_core::{RawCoID, SessionID};
use thiserror::Error;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Header or transaction (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A write would leave a gap in a session.
    #[error("non-contiguous write to {id} session {session}: after {after}, stored {have}")]
    NonContiguous {
        id: RawCoID,
        session: SessionID,
        after: u32,
        have: u32,
    },

    /// A different transaction is already stored at this position.
    #[error("conflict in {id} session {session} at index {index}")]
    Conflict {
        id: RawCoID,
        session: SessionID,
        index: u32,
    },

    /// A write carried a header that does not hash to the id.
    #[error("header does not match {0}")]
    HeaderMismatch(RawCoID),

    /// Invalid data in storage.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// A lock was poisoned by a panicking holder.
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),

    /// The blocking task running a query failed.
    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
