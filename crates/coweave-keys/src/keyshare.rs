//! Sealing read keys for individual recipients.
//!
//! A revelation `<keyID>_for_<accountOrAgent>` holds the read key sealed with
//! X25519 agreement between the revealer's sealer secret and the recipient's
//! sealer ID. The recipient reverses it with its own secret and the
//! revealer's public sealer, which it learns from the revealing transaction's
//! author.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};

use coweave_core::{KeyID, RawCoID, SealerID, SealerSecret};

use crate::crypto::{derive_nonce, KeySecret};
use crate::error::{KeysError, Result};

/// Context that binds a sealed key to where it is revealed.
#[derive(Debug, Clone, Copy)]
pub struct SealContext<'a> {
    pub group: &'a RawCoID,
    pub key_id: &'a KeyID,
    /// Textual id of the recipient (account, agent).
    pub recipient: &'a str,
}

impl SealContext<'_> {
    fn nonce(&self) -> [u8; 12] {
        derive_nonce(
            "coweave-seal-nonce-v0",
            &[self.group.as_bytes(), &self.key_id.0, self.recipient.as_bytes()],
        )
    }
}

fn wrap_cipher(shared: [u8; 32]) -> Result<ChaCha20Poly1305> {
    let key = blake3::derive_key("coweave-seal-v0", &shared);
    ChaCha20Poly1305::new_from_slice(&key).map_err(|e| KeysError::EncryptionError(e.to_string()))
}

/// Seal a read key for a recipient. Textual form `sealed_z<hex>`.
pub fn seal_key(
    secret: &KeySecret,
    from: &SealerSecret,
    to: &SealerID,
    context: SealContext<'_>,
) -> Result<String> {
    let cipher = wrap_cipher(from.diffie_hellman(to))?;
    let sealed = cipher
        .encrypt(Nonce::from_slice(&context.nonce()), secret.as_bytes().as_slice())
        .map_err(|e| KeysError::EncryptionError(e.to_string()))?;
    Ok(format!("sealed_z{}", hex::encode(sealed)))
}

/// Unseal a read key revealed to us.
pub fn unseal_key(
    sealed: &str,
    to: &SealerSecret,
    from: &SealerID,
    context: SealContext<'_>,
) -> Result<KeySecret> {
    let invalid = || KeysError::InvalidKey(format!("sealed {}", context.key_id));
    let body = sealed.strip_prefix("sealed_z").ok_or_else(invalid)?;
    let ciphertext = hex::decode(body).map_err(|_| invalid())?;

    let cipher = wrap_cipher(to.diffie_hellman(from))?;
    let bytes = cipher
        .decrypt(Nonce::from_slice(&context.nonce()), ciphertext.as_slice())
        .map_err(|e| KeysError::DecryptionError(e.to_string()))?;
    let arr: [u8; 32] = bytes.try_into().map_err(|_| invalid())?;
    Ok(KeySecret::from_bytes(arr))
}
