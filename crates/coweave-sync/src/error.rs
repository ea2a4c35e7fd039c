//! Error types for the sync module.

use thiserror::Error;

use coweave_core::{AppendError, RawCoID};

use crate::messages::PeerID;

/// Errors that can occur during sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Protocol version mismatch with peer.
    #[error("protocol version mismatch: local={local}, peer={peer}")]
    VersionMismatch { local: u8, peer: u8 },

    /// Message validation failed.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Message (de)serialization failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// Transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// Peer is not connected.
    #[error("peer not connected: {0}")]
    PeerNotConnected(PeerID),

    /// Received content was rejected.
    #[error("rejected content: {0}")]
    Rejected(#[from] AppendError),

    /// No peer could provide the CoValue within policy.
    #[error("{0} is unavailable")]
    Unavailable(RawCoID),

    /// A lock was poisoned by a panicking holder.
    #[error("lock poisoned: {0}")]
    LockPoisoned(String),

    /// Load was cancelled.
    #[error("sync cancelled")]
    Cancelled,
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
