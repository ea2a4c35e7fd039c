//! Building, signing and appending local transactions.

use serde_json::Value as JsonValue;

use coweave_core::{CoValueCore, Hash, KeyID, Privacy, Transaction, TransactionID};

use crate::account::LocalIdentity;
use crate::crypto::{encrypt_for_transaction, KeySecret};
use crate::error::{KeysError, Result};

/// Append `changes` to `core` in the identity's session.
///
/// Private transactions are encrypted under `read_key`, bound to the index
/// the transaction will occupy. The chain hash and signature are computed
/// locally and the append skips verification, since the local writer is
/// trusted by construction. Returns the session's new chain hash.
pub fn make_transaction(
    core: &mut CoValueCore,
    identity: &LocalIdentity,
    changes: &[JsonValue],
    privacy: Privacy,
    read_key: Option<(&KeyID, &KeySecret)>,
    made_at: u64,
) -> Result<Hash> {
    let changes = serde_json::to_string(changes)?;

    let tx = match privacy {
        Privacy::Trusting => Transaction::trusting(made_at, changes),
        Privacy::Private => {
            let (key_id, secret) =
                read_key.ok_or_else(|| KeysError::MissingReadKey(core.id().to_string()))?;
            let tx_id = TransactionID {
                session_id: identity.session.clone(),
                tx_index: core.session(&identity.session).map_or(0, |log| log.len()),
            };
            let encrypted = encrypt_for_transaction(&changes, secret, &core.id(), &tx_id)?;
            Transaction::private(made_at, *key_id, encrypted)
        }
    };

    Ok(core.append_signed(&identity.session, vec![tx], &identity.agent.signer)?)
}
