//! Error types for keys, groups and the decrypted view.

use thiserror::Error;

/// Errors that can occur during key and group operations.
#[derive(Debug, Error)]
pub enum KeysError {
    /// Permission denied.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Encryption error.
    #[error("encryption error: {0}")]
    EncryptionError(String),

    /// Decryption error.
    #[error("decryption error: {0}")]
    DecryptionError(String),

    /// A key secret or sealed value is malformed.
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    /// Changes are not a JSON array of operations.
    #[error("invalid changes: {0}")]
    InvalidChanges(String),

    /// The group has no current read key, or it is not available to us.
    #[error("no read key available for {0}")]
    MissingReadKey(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Core error.
    #[error("core error: {0}")]
    Core(#[from] coweave_core::CoreError),

    /// Append rejected.
    #[error(transparent)]
    Append(#[from] coweave_core::AppendError),
}

impl From<serde_json::Error> for KeysError {
    fn from(e: serde_json::Error) -> Self {
        KeysError::InvalidChanges(e.to_string())
    }
}

/// Result type for key operations.
pub type Result<T> = std::result::Result<T, KeysError>;
