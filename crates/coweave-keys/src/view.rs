//! The decrypted view: valid transactions in canonical replication order.

use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::debug;

use coweave_core::{ActorID, CoValueCore, KnownState, RawCoID, Ruleset, Transaction, TransactionID};

use crate::crypto::decrypt_for_transaction;
use crate::group::GroupSource;
use crate::permissions::is_author_permitted;
use crate::resolver::KeyResolver;

/// Canonical order: `made_at`, then session id, then index.
pub fn compare_transactions(a: (u64, &TransactionID), b: (u64, &TransactionID)) -> Ordering {
    a.0.cmp(&b.0)
        .then_with(|| a.1.session_id.cmp(&b.1.session_id))
        .then_with(|| a.1.tx_index.cmp(&b.1.tx_index))
}

/// A transaction that passed permission checks and could be read.
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedTransaction {
    pub tx_id: TransactionID,
    pub author: ActorID,
    pub made_at: u64,
    pub changes: Vec<JsonValue>,
}

/// Parsed changes of private transactions, for one CoValue.
///
/// Append-only: a transaction id always names the same ciphertext.
#[derive(Debug, Default, Clone)]
pub struct DecryptCache {
    changes: HashMap<TransactionID, Vec<JsonValue>>,
    decryptions: u64,
}

impl DecryptCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Ciphertexts decrypted so far.
    pub fn decryptions(&self) -> u64 {
        self.decryptions
    }
}

/// Options for [`get_valid_transactions`].
#[derive(Debug, Clone, Default)]
pub struct ValidTransactionsOptions {
    /// Skip private transactions entirely.
    pub ignore_private: bool,
    /// Only return transactions beyond this state.
    pub since: Option<KnownState>,
}

/// The group whose read keys decrypt this value's private transactions.
pub fn key_group(core: &CoValueCore) -> Option<RawCoID> {
    match &core.header().ruleset {
        Ruleset::OwnedByGroup { group } => Some(*group),
        Ruleset::Group { .. } => Some(core.id()),
        Ruleset::UnsafeAllowAll => None,
    }
}

/// Valid, readable transactions of `core` in canonical order.
///
/// Transactions by authors without permission are dropped. Private
/// transactions whose key cannot be resolved are skipped silently: the
/// reader is not (yet) authorized.
pub fn get_valid_transactions(
    core: &CoValueCore,
    groups: &dyn GroupSource,
    keys: &mut KeyResolver<'_>,
    cache: &mut DecryptCache,
    options: &ValidTransactionsOptions,
) -> Vec<DecryptedTransaction> {
    let key_group = key_group(core);
    let mut out = Vec::new();

    for (tx_id, tx) in core.transactions() {
        if let Some(since) = &options.since {
            if tx_id.tx_index < since.count(&tx_id.session_id) {
                continue;
            }
        }
        let Ok(author) = tx_id.session_id.actor() else {
            continue;
        };
        if !is_author_permitted(core.header(), &author, groups) {
            continue;
        }

        let changes = match tx {
            Transaction::Trusting { changes, .. } => match serde_json::from_str(changes) {
                Ok(changes) => changes,
                Err(e) => {
                    debug!(id = %core.id(), tx = %tx_id, error = %e, "unparseable changes");
                    continue;
                }
            },
            Transaction::Private {
                key_used,
                encrypted_changes,
                ..
            } => {
                if options.ignore_private {
                    continue;
                }
                if let Some(changes) = cache.changes.get(&tx_id) {
                    changes.clone()
                } else {
                    let Some(group) = key_group else {
                        continue;
                    };
                    let Some(secret) = keys.read_key(&group, key_used) else {
                        continue;
                    };
                    cache.decryptions += 1;
                    let parsed = decrypt_for_transaction(encrypted_changes, &secret, &core.id(), &tx_id)
                        .ok()
                        .and_then(|plaintext| serde_json::from_str::<Vec<JsonValue>>(&plaintext).ok());
                    let Some(changes) = parsed else {
                        debug!(id = %core.id(), tx = %tx_id, "undecryptable transaction");
                        continue;
                    };
                    cache.changes.insert(tx_id.clone(), changes.clone());
                    changes
                }
            }
        };

        out.push(DecryptedTransaction {
            made_at: tx.made_at(),
            tx_id,
            author,
            changes,
        });
    }

    out.sort_by(|a, b| compare_transactions((a.made_at, &a.tx_id), (b.made_at, &b.tx_id)));
    out
}
