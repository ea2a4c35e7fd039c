//! Error types for the CoValue core.

use thiserror::Error;

use crate::crypto::Hash;
use crate::types::{RawCoID, SessionID};

/// Errors from identifiers, encoding and primitive crypto.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("malformed id: {0}")]
    MalformedId(String),

    #[error("encoding error: {0}")]
    EncodingError(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

/// Why the signer of an account session could not be determined.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveAccountAgentError {
    #[error("account {0} is not loaded")]
    AccountNotLoaded(RawCoID),

    #[error("account {0} has no agent key")]
    NoAgent(RawCoID),

    #[error("account {0} has {1} agent keys")]
    Ambiguous(RawCoID, usize),

    #[error("session id is malformed: {0}")]
    MalformedSession(String),
}

/// Rejection of a batch of transactions offered to a session log.
///
/// A rejected batch leaves the log untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AppendError {
    #[error("claimed hash {claimed} does not match computed {computed} in {session}")]
    InvalidHash {
        session: SessionID,
        claimed: Hash,
        computed: Hash,
    },

    #[error("signature does not verify for {session}")]
    InvalidSignature { session: SessionID },

    #[error(transparent)]
    ResolveAccountAgent(#[from] ResolveAccountAgentError),

    #[error("segment for {session} starts after {after} but log has {have}")]
    NonContiguous {
        session: SessionID,
        after: u32,
        have: u32,
    },

    #[error("content for {0} arrived without a header")]
    MissingHeader(RawCoID),

    #[error("header hashes to a different id than {0}")]
    HeaderMismatch(RawCoID),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
