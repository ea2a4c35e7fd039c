//! Symmetric read keys and transaction encryption.
//!
//! Private transactions are encrypted with ChaCha20-Poly1305 under a group
//! read key. The nonce is derived from the transaction's position, so it is
//! unique per (CoValue, session, index) and never stored.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use std::fmt;
use std::str::FromStr;

use coweave_core::{KeyID, RawCoID, TransactionID};

use crate::error::{KeysError, Result};

/// A 256-bit symmetric read key.
#[derive(Clone, PartialEq, Eq)]
pub struct KeySecret([u8; 32]);

impl KeySecret {
    /// Generate a new random key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn encrypt(&self, plaintext: &[u8], nonce: &[u8; 12]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| KeysError::EncryptionError(e.to_string()))?;
        cipher
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|e| KeysError::EncryptionError(e.to_string()))
    }

    fn decrypt(&self, ciphertext: &[u8], nonce: &[u8; 12]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| KeysError::DecryptionError(e.to_string()))?;
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| KeysError::DecryptionError(e.to_string()))
    }
}

/// Textual form `keySecret_z<hex>`, used as a group content value.
impl fmt::Display for KeySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "keySecret_z{}", hex::encode(self.0))
    }
}

impl fmt::Debug for KeySecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeySecret(..)")
    }
}

impl FromStr for KeySecret {
    type Err = KeysError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || KeysError::InvalidKey(s.chars().take(16).collect());
        let body = s.strip_prefix("keySecret_z").ok_or_else(invalid)?;
        let bytes = hex::decode(body).map_err(|_| invalid())?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| invalid())?;
        Ok(Self(arr))
    }
}

/// Derive a 96-bit nonce from labelled context parts.
pub(crate) fn derive_nonce(context: &str, parts: &[&[u8]]) -> [u8; 12] {
    let mut hasher = blake3::Hasher::new_derive_key(context);
    for part in parts {
        hasher.update(&(part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&hasher.finalize().as_bytes()[..12]);
    nonce
}

fn transaction_nonce(co_id: &RawCoID, tx_id: &TransactionID) -> [u8; 12] {
    derive_nonce(
        "coweave-tx-nonce-v0",
        &[
            co_id.as_bytes(),
            tx_id.session_id.as_str().as_bytes(),
            &tx_id.tx_index.to_be_bytes(),
        ],
    )
}

/// Encrypt a transaction's JSON changes.
pub fn encrypt_for_transaction(
    changes: &str,
    key: &KeySecret,
    co_id: &RawCoID,
    tx_id: &TransactionID,
) -> Result<Vec<u8>> {
    key.encrypt(changes.as_bytes(), &transaction_nonce(co_id, tx_id))
}

/// Decrypt a transaction's JSON changes.
pub fn decrypt_for_transaction(
    ciphertext: &[u8],
    key: &KeySecret,
    co_id: &RawCoID,
    tx_id: &TransactionID,
) -> Result<String> {
    let plaintext = key.decrypt(ciphertext, &transaction_nonce(co_id, tx_id))?;
    String::from_utf8(plaintext).map_err(|e| KeysError::DecryptionError(e.to_string()))
}

/// Wrap `secret` (identified by `key_id`) under another read key.
///
/// Textual form `encrypted_z<hex>`, stored at `<key_id>_for_<wrapping_id>`.
pub fn wrap_key_secret(
    secret: &KeySecret,
    key_id: &KeyID,
    wrapping: &KeySecret,
    wrapping_id: &KeyID,
) -> Result<String> {
    let nonce = derive_nonce("coweave-key-wrap-v0", &[&key_id.0, &wrapping_id.0]);
    let ciphertext = wrapping.encrypt(&secret.0, &nonce)?;
    Ok(format!("encrypted_z{}", hex::encode(ciphertext)))
}

/// Unwrap a secret produced by [`wrap_key_secret`].
pub fn unwrap_key_secret(
    wrapped: &str,
    key_id: &KeyID,
    wrapping: &KeySecret,
    wrapping_id: &KeyID,
) -> Result<KeySecret> {
    let invalid = || KeysError::InvalidKey(format!("wrapped {}", key_id));
    let body = wrapped.strip_prefix("encrypted_z").ok_or_else(invalid)?;
    let ciphertext = hex::decode(body).map_err(|_| invalid())?;
    let nonce = derive_nonce("coweave-key-wrap-v0", &[&key_id.0, &wrapping_id.0]);
    let bytes = wrapping.decrypt(&ciphertext, &nonce)?;
    let arr: [u8; 32] = bytes.try_into().map_err(|_| invalid())?;
    Ok(KeySecret(arr))
}
