//! Transaction: one ordered unit of change within a session.
//!
//! A transaction is either trusting (plaintext JSON changes) or private
//! (changes encrypted under a group read key). Both carry the author-claimed
//! `made_at` timestamp in Unix milliseconds.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::types::KeyID;

/// Size threshold in bytes for checkpoint signatures and sync chunks.
pub const MAX_RECOMMENDED_TX_SIZE: usize = 100 * 1024;

/// Privacy mode requested when creating a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Privacy {
    Trusting,
    Private,
}

/// A transaction as stored in a session log and sent over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "privacy", rename_all = "camelCase")]
pub enum Transaction {
    /// Plaintext change-set.
    #[serde(rename_all = "camelCase")]
    Trusting {
        made_at: u64,
        /// JSON array of change operations.
        changes: String,
    },

    /// Encrypted change-set.
    #[serde(rename_all = "camelCase")]
    Private {
        made_at: u64,
        key_used: KeyID,
        encrypted_changes: Bytes,
    },
}

impl Transaction {
    /// Build a trusting transaction.
    pub fn trusting(made_at: u64, changes: impl Into<String>) -> Self {
        Transaction::Trusting {
            made_at,
            changes: changes.into(),
        }
    }

    /// Build a private transaction from already-encrypted changes.
    pub fn private(made_at: u64, key_used: KeyID, encrypted_changes: impl Into<Bytes>) -> Self {
        Transaction::Private {
            made_at,
            key_used,
            encrypted_changes: encrypted_changes.into(),
        }
    }

    /// Author-claimed timestamp (Unix ms). Untrusted.
    pub fn made_at(&self) -> u64 {
        match self {
            Transaction::Trusting { made_at, .. } | Transaction::Private { made_at, .. } => {
                *made_at
            }
        }
    }

    /// Byte size counted against the checkpoint and chunk thresholds.
    pub fn size(&self) -> usize {
        match self {
            Transaction::Trusting { changes, .. } => changes.len(),
            Transaction::Private {
                encrypted_changes, ..
            } => encrypted_changes.len(),
        }
    }

    /// The key a private transaction was encrypted with.
    pub fn key_used(&self) -> Option<&KeyID> {
        match self {
            Transaction::Private { key_used, .. } => Some(key_used),
            Transaction::Trusting { .. } => None,
        }
    }

    /// Check if this transaction is private.
    pub fn is_private(&self) -> bool {
        matches!(self, Transaction::Private { .. })
    }
}
