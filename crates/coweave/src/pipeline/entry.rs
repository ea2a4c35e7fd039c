//! Per-CoValue bookkeeping for the pipeline.

use std::collections::{BTreeMap, BTreeSet};

use coweave_core::{
    CoValueCore, CoValueHeader, Hash, KnownState, RawCoID, SessionID, Signature, StreamingHash,
    Transaction,
};
use coweave_keys::DecryptCache;
use coweave_sync::PeerID;

/// Handle for one subscription.
pub type ListenerID = u64;

/// Permission check result for a verified transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    Unknown,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptionState {
    NotDecrypted,
    Decrypted,
    /// Valid but no readable key yet.
    Undecryptable,
}

/// Where one transaction stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxState {
    AvailableInStorage,
    LoadingFromStorage,
    Available,
    Verified {
        validity: Validity,
        decryption: DecryptionState,
    },
    VerificationFailed {
        reason: String,
        /// Computed chain hash, on the transaction whose signature failed.
        hash: Option<Hash>,
    },
}

impl TxState {
    /// Holds data that is verified or ready to verify.
    pub fn is_usable(&self) -> bool {
        matches!(self, TxState::Available | TxState::Verified { .. })
    }

    /// Can take data from a new source.
    pub(crate) fn accepts_data(&self) -> bool {
        matches!(
            self,
            TxState::AvailableInStorage
                | TxState::LoadingFromStorage
                | TxState::VerificationFailed { .. }
        )
    }
}

/// One transaction slot.
#[derive(Debug, Clone)]
pub struct TxEntry {
    pub state: TxState,
    pub transaction: Option<Transaction>,
    /// Signature over the chain hash ending at this transaction.
    pub signature: Option<Signature>,
}

impl TxEntry {
    fn in_storage() -> Self {
        Self {
            state: TxState::AvailableInStorage,
            transaction: None,
            signature: None,
        }
    }
}

/// One session's slots.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub(crate) transactions: Vec<TxEntry>,
    /// Length of the verified prefix.
    pub(crate) verified: u32,
    /// Chain state after the verified prefix.
    pub(crate) hash: StreamingHash,
    /// Transactions the store already holds.
    pub(crate) stored: u32,
}

impl Default for SessionEntry {
    fn default() -> Self {
        Self {
            transactions: Vec::new(),
            verified: 0,
            hash: StreamingHash::new(),
            stored: 0,
        }
    }
}

impl SessionEntry {
    pub fn len(&self) -> u32 {
        self.transactions.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn verified(&self) -> u32 {
        self.verified
    }

    /// Length of the prefix holding usable data.
    pub fn last_available(&self) -> u32 {
        self.transactions
            .iter()
            .take_while(|entry| entry.state.is_usable())
            .count() as u32
    }

    pub fn state(&self, index: u32) -> Option<&TxState> {
        self.transactions.get(index as usize).map(|entry| &entry.state)
    }

    /// Reserve slots for transactions the store holds.
    pub(crate) fn extend_in_storage(&mut self, count: u32) {
        while self.len() < count {
            self.transactions.push(TxEntry::in_storage());
        }
    }

    /// Place received data from index `after` on. Slots that already hold
    /// usable data are kept.
    pub(crate) fn fill(
        &mut self,
        after: u32,
        transactions: &[Transaction],
        signatures: &BTreeMap<u32, Signature>,
    ) -> u32 {
        let mut filled = 0;
        for (offset, tx) in transactions.iter().enumerate() {
            let index = after + offset as u32;
            let signature = signatures.get(&index).copied();
            match self.transactions.get_mut(index as usize) {
                Some(slot) if slot.state.accepts_data() => {
                    *slot = TxEntry {
                        state: TxState::Available,
                        transaction: Some(tx.clone()),
                        signature,
                    };
                    filled += 1;
                }
                Some(slot) => {
                    if slot.signature.is_none() && slot.state == TxState::Available {
                        slot.signature = signature;
                    }
                }
                None => {
                    self.transactions.push(TxEntry {
                        state: TxState::Available,
                        transaction: Some(tx.clone()),
                        signature,
                    });
                    filled += 1;
                }
            }
        }
        filled
    }
}

/// What one peer holds of this value, as far as we know.
#[derive(Debug, Clone, Default)]
pub struct PeerKnowledge {
    pub confirmed: Option<KnownState>,
    pub optimistic: Option<KnownState>,
    /// The peer sent a load we have not answered.
    pub awaiting_reply: bool,
}

/// Where the store stands on this value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageState {
    Unknown,
    Pending,
    Known(KnownState),
    Unavailable,
}

/// Everything the pipeline tracks for one CoValue.
#[derive(Debug)]
pub struct CoValueEntry {
    pub(crate) id: RawCoID,
    pub(crate) header: Option<CoValueHeader>,
    pub(crate) sessions: BTreeMap<SessionID, SessionEntry>,
    pub(crate) storage: StorageState,
    pub(crate) peers: BTreeMap<PeerID, PeerKnowledge>,
    /// Listener -> verified state it was last notified of.
    pub(crate) listeners: BTreeMap<ListenerID, Option<KnownState>>,
    /// Values that need this one loaded.
    pub(crate) dependents: BTreeSet<RawCoID>,
    /// Verified content, extended one signed run at a time.
    pub(crate) verified: Option<CoValueCore>,
    pub(crate) decrypted: DecryptCache,
    /// A load went out to peers for the missing header.
    pub(crate) requested_from_peers: bool,
    /// A group this value depends on changed; verdicts need a second look.
    pub(crate) stale_verdicts: bool,
}

impl CoValueEntry {
    pub(crate) fn new(id: RawCoID) -> Self {
        Self {
            id,
            header: None,
            sessions: BTreeMap::new(),
            storage: StorageState::Unknown,
            peers: BTreeMap::new(),
            listeners: BTreeMap::new(),
            dependents: BTreeSet::new(),
            verified: None,
            decrypted: DecryptCache::new(),
            requested_from_peers: false,
            stale_verdicts: false,
        }
    }

    pub fn id(&self) -> RawCoID {
        self.id
    }

    pub fn header(&self) -> Option<&CoValueHeader> {
        self.header.as_ref()
    }

    pub fn storage(&self) -> &StorageState {
        &self.storage
    }

    pub fn session(&self, session: &SessionID) -> Option<&SessionEntry> {
        self.sessions.get(session)
    }

    pub fn sessions(&self) -> impl Iterator<Item = (&SessionID, &SessionEntry)> {
        self.sessions.iter()
    }

    pub fn dependents(&self) -> &BTreeSet<RawCoID> {
        &self.dependents
    }

    /// The verified part of the value, once the header is known.
    pub fn verified_core(&self) -> Option<&CoValueCore> {
        self.verified.as_ref()
    }

    /// Somebody needs this value: a listener, a dependent value, or a peer
    /// waiting on an answer.
    pub fn has_demand(&self) -> bool {
        !self.listeners.is_empty()
            || !self.dependents.is_empty()
            || self.peers.values().any(|p| p.awaiting_reply)
    }

    /// Set the header once, creating the verified core for it.
    pub(crate) fn set_header(&mut self, header: CoValueHeader) {
        if self.header.is_none() {
            self.verified = Some(CoValueCore::new(header.clone()));
            self.header = Some(header);
        }
    }

    pub(crate) fn peer(&mut self, peer: &PeerID) -> &mut PeerKnowledge {
        self.peers.entry(peer.clone()).or_default()
    }

    /// Transactions known to storage that have not arrived yet.
    pub(crate) fn has_pending_storage(&self) -> bool {
        self.sessions.values().any(|s| {
            s.transactions.iter().any(|t| {
                matches!(
                    t.state,
                    TxState::AvailableInStorage | TxState::LoadingFromStorage
                )
            })
        })
    }

    /// Whether the validate stage has anything to decide.
    pub(crate) fn needs_validation(&self) -> bool {
        self.stale_verdicts || self.has_unvalidated()
    }

    /// Verified transactions still lacking a permission verdict.
    pub(crate) fn has_unvalidated(&self) -> bool {
        self.sessions.values().any(|s| {
            s.transactions.iter().any(|t| {
                matches!(
                    t.state,
                    TxState::Verified {
                        validity: Validity::Unknown,
                        ..
                    }
                )
            })
        })
    }
}
