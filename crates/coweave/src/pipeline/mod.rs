//! The staged reconciliation pipeline.
//!
//! The pipeline does no I/O of its own. Inputs (storage answers, peer
//! messages, subscriptions) update per-value bookkeeping; each [`Pipeline::tick`]
//! then runs every tracked value through the stages in order and returns
//! the [`Effect`]s the caller must carry out:
//!
//! ```text
//!   dependencies ─► load ─► verify ─► validate ─► notify ─► sync ─► store
//! ```
//!
//! Values nobody needs (no listener, no dependent, no peer waiting on an
//! answer) stop after the metadata load. [`Pipeline::settle`] drives ticks
//! against a [`Store`] and a [`Transport`] until nothing moves.

pub mod entry;
mod verify;

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use coweave_core::{
    AppendError, CoValueCore, CoValueHeader, ContentChunk, KnownState, RawCoID, SessionID,
    Signature, Transaction,
};
use coweave_keys::{
    dependencies, get_valid_transactions, is_author_permitted, key_group, DecryptedTransaction, Directory,
    KeyCaches, KeyResolver, LocalIdentity, ValidTransactionsOptions,
};
use coweave_store::{SessionWrite, Store, StoredMetadata, StoredTransactions};
use coweave_sync::{HighLevelState, Peer, PeerID, PeerRole, SyncMessage, Transport};

use crate::config::PipelineConfig;

pub use entry::{
    CoValueEntry, DecryptionState, ListenerID, PeerKnowledge, SessionEntry, StorageState, TxEntry,
    TxState, Validity,
};
use verify::{verify_session, SessionVerify};

/// Bound on ticks in one [`Pipeline::settle`] call.
const MAX_SETTLE_ROUNDS: usize = 256;

/// New content for one listener.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerUpdate {
    pub id: RawCoID,
    /// Verified state the update brings the listener to.
    pub known: KnownState,
    /// Valid, readable transactions beyond what the listener last saw.
    pub transactions: Vec<DecryptedTransaction>,
}

/// Work a tick asks its driver to carry out.
#[derive(Debug, Clone)]
pub enum Effect {
    LoadMetadata {
        id: RawCoID,
    },
    LoadTransactions {
        id: RawCoID,
        session: SessionID,
        from: u32,
        to: u32,
    },
    Write {
        id: RawCoID,
        header: CoValueHeader,
        sessions: Vec<SessionWrite>,
    },
    Send {
        peer: PeerID,
        message: SyncMessage,
    },
    Notify {
        listener: ListenerID,
        update: ListenerUpdate,
    },
}

/// Scheduler over every tracked CoValue.
pub struct Pipeline {
    config: PipelineConfig,
    reader: Option<LocalIdentity>,
    has_storage: bool,
    entries: BTreeMap<RawCoID, CoValueEntry>,
    peers: BTreeMap<PeerID, Peer>,
    directory: Directory,
    key_caches: KeyCaches,
    next_listener: ListenerID,
    /// Something changed state during the last tick.
    progressed: bool,
}

impl Pipeline {
    /// `reader` unseals keys revealed to it; `has_storage` says whether
    /// metadata loads will be answered.
    pub fn new(config: PipelineConfig, reader: Option<LocalIdentity>, has_storage: bool) -> Self {
        Self {
            config,
            reader,
            has_storage,
            entries: BTreeMap::new(),
            peers: BTreeMap::new(),
            directory: Directory::new(),
            key_caches: KeyCaches::new(),
            next_listener: 0,
            progressed: false,
        }
    }

    pub fn entry(&self, id: &RawCoID) -> Option<&CoValueEntry> {
        self.entries.get(id)
    }

    pub fn entries(&self) -> impl Iterator<Item = &CoValueEntry> {
        self.entries.values()
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Where `id` stands: available once its header is known, unavailable
    /// once storage and every asked peer came up empty.
    pub fn availability(&self, id: &RawCoID) -> HighLevelState {
        let Some(entry) = self.entries.get(id) else {
            return HighLevelState::Unknown;
        };
        if entry.header.is_some() {
            return HighLevelState::Available;
        }
        match entry.storage {
            StorageState::Unknown => HighLevelState::Unknown,
            StorageState::Pending | StorageState::Known(_) => HighLevelState::Loading,
            StorageState::Unavailable if waiting_on_peers(entry, &self.peers) => HighLevelState::Loading,
            StorageState::Unavailable => HighLevelState::Unavailable,
        }
    }

    /// Start tracking `id` without creating demand for it.
    pub fn track(&mut self, id: RawCoID) {
        self.entries.entry(id).or_insert_with(|| CoValueEntry::new(id));
    }

    /// Register a listener; it is notified on the first tick that has
    /// validated content and on every later change.
    pub fn subscribe(&mut self, id: RawCoID) -> ListenerID {
        let listener = self.next_listener;
        self.next_listener += 1;
        self.entries
            .entry(id)
            .or_insert_with(|| CoValueEntry::new(id))
            .listeners
            .insert(listener, None);
        listener
    }

    pub fn unsubscribe(&mut self, id: &RawCoID, listener: ListenerID) -> bool {
        self.entries
            .get_mut(id)
            .map_or(false, |entry| entry.listeners.remove(&listener).is_some())
    }

    pub fn add_peer(&mut self, peer: Peer) {
        info!(peer = %peer.id, role = ?peer.config.role, "pipeline peer added");
        self.peers.insert(peer.id.clone(), peer);
    }

    /// Forget a peer and everything recorded about it.
    pub fn remove_peer(&mut self, peer: &PeerID) {
        if self.peers.remove(peer).is_some() {
            info!(peer = %peer, "pipeline peer removed");
        }
        for entry in self.entries.values_mut() {
            entry.peers.remove(peer);
        }
    }

    /// Hand a locally written core to the pipeline. Its content goes through
    /// the same verify stage as anything received.
    pub fn insert_local(&mut self, core: &CoValueCore) -> Result<(), AppendError> {
        let entry = self
            .entries
            .entry(core.id())
            .or_insert_with(|| CoValueEntry::new(core.id()));
        entry.set_header(core.header().clone());
        for chunk in core.new_content_since(None).unwrap_or_default() {
            place_chunk(entry, &chunk)?;
        }
        Ok(())
    }

    /// Storage answered a metadata load.
    pub fn on_metadata(&mut self, id: &RawCoID, metadata: Option<StoredMetadata>) {
        let Some(entry) = self.entries.get_mut(id) else {
            return;
        };
        match metadata {
            Some(metadata) => {
                if metadata.header.id() != *id {
                    warn!(id = %id, "stored header does not match id");
                    entry.storage = StorageState::Unavailable;
                    return;
                }
                entry.set_header(metadata.header);
                for (session_id, count) in &metadata.known_state.sessions {
                    let session = entry.sessions.entry(session_id.clone()).or_default();
                    session.extend_in_storage(*count);
                    session.stored = session.stored.max(*count);
                }
                debug!(id = %id, total = metadata.known_state.total(), "metadata loaded");
                entry.storage = StorageState::Known(metadata.known_state);
            }
            None => {
                debug!(id = %id, "not in storage");
                entry.storage = StorageState::Unavailable;
            }
        }
    }

    /// Storage answered a transaction-range load.
    pub fn on_transactions(
        &mut self,
        id: &RawCoID,
        session: &SessionID,
        from: u32,
        stored: StoredTransactions,
    ) {
        let Some(session) = self.entries.get_mut(id).and_then(|e| e.sessions.get_mut(session)) else {
            return;
        };
        session.fill(from, &stored.transactions, &stored.signatures);
    }

    /// A storage request for `id` failed; the store is not asked again.
    pub fn on_storage_failed(&mut self, id: &RawCoID, reason: &str) {
        warn!(id = %id, reason = %reason, "storage request failed");
        if let Some(entry) = self.entries.get_mut(id) {
            entry.storage = StorageState::Unavailable;
        }
    }

    /// A peer sent a message. Content that leaves a gap or carries a
    /// mismatched header is rejected whole.
    pub fn on_message(&mut self, from: &PeerID, message: SyncMessage) -> Result<(), AppendError> {
        match message {
            SyncMessage::Load { known } => {
                let entry = self
                    .entries
                    .entry(known.id)
                    .or_insert_with(|| CoValueEntry::new(known.id));
                let peer = entry.peer(from);
                record_known(&mut peer.confirmed, &known);
                record_known(&mut peer.optimistic, &known);
                peer.awaiting_reply = true;
            }
            SyncMessage::Content { chunk } => {
                let entry = self
                    .entries
                    .entry(chunk.id)
                    .or_insert_with(|| CoValueEntry::new(chunk.id));
                if let Some(header) = &chunk.header {
                    if header.id() != chunk.id {
                        return Err(AppendError::HeaderMismatch(chunk.id));
                    }
                    entry.set_header(header.clone());
                }
                place_chunk(entry, &chunk)?;

                let delivered = delivered_state(&chunk);
                let peer = entry.peer(from);
                record_known(&mut peer.confirmed, &delivered);
                record_known(&mut peer.optimistic, &delivered);
                peer.awaiting_reply = true;
            }
            SyncMessage::Known { known } => {
                let entry = self
                    .entries
                    .entry(known.id)
                    .or_insert_with(|| CoValueEntry::new(known.id));
                let peer = entry.peer(from);
                record_known(&mut peer.confirmed, &known);
                record_known(&mut peer.optimistic, &known);
            }
            SyncMessage::Close => self.remove_peer(from),
        }
        Ok(())
    }

    /// Run every stage once over every tracked value.
    pub fn tick(&mut self) -> Vec<Effect> {
        self.progressed = false;
        let mut effects = Vec::new();
        self.stage_dependencies();
        self.stage_load(&mut effects);
        self.stage_verify();
        self.stage_validate();
        self.stage_notify(&mut effects);
        self.stage_sync(&mut effects);
        self.stage_store(&mut effects);
        effects
    }

    /// Tick and carry out effects until a tick neither changes state nor
    /// asks for anything. Returns the listener updates in emission order.
    ///
    /// Without a store, storage is never consulted; without a transport,
    /// outgoing messages are dropped.
    pub async fn settle(
        &mut self,
        store: Option<&dyn Store>,
        transport: Option<&dyn Transport>,
    ) -> Vec<ListenerUpdate> {
        let mut updates = Vec::new();
        for _ in 0..MAX_SETTLE_ROUNDS {
            let effects = self.tick();
            if effects.is_empty() && !self.progressed {
                return updates;
            }
            for effect in effects {
                self.execute(effect, store, transport, &mut updates).await;
            }
        }
        warn!(rounds = MAX_SETTLE_ROUNDS, "pipeline did not settle");
        updates
    }

    async fn execute(
        &mut self,
        effect: Effect,
        store: Option<&dyn Store>,
        transport: Option<&dyn Transport>,
        updates: &mut Vec<ListenerUpdate>,
    ) {
        match effect {
            Effect::LoadMetadata { id } => match store {
                Some(store) => match store.load_metadata(&id).await {
                    Ok(metadata) => self.on_metadata(&id, metadata),
                    Err(e) => self.on_storage_failed(&id, &e.to_string()),
                },
                None => self.on_metadata(&id, None),
            },
            Effect::LoadTransactions { id, session, from, to } => {
                let Some(store) = store else {
                    return self.on_storage_failed(&id, "no store");
                };
                match store.load_transactions(&id, &session, from, to).await {
                    Ok(stored) => self.on_transactions(&id, &session, from, stored),
                    Err(e) => self.on_storage_failed(&id, &e.to_string()),
                }
            }
            Effect::Write { id, header, sessions } => {
                if let Some(store) = store {
                    if let Err(e) = store.write(&id, &header, &sessions).await {
                        warn!(id = %id, error = %e, "pipeline write failed");
                    }
                }
            }
            Effect::Send { peer, message } => match transport {
                Some(transport) => {
                    if let Err(e) = transport.send(&peer, message).await {
                        warn!(peer = %peer, error = %e, "pipeline send failed");
                    }
                }
                None => debug!(peer = %peer, "no transport, message dropped"),
            },
            Effect::Notify { update, .. } => updates.push(update),
        }
    }

    /// Valid, readable transactions of `id` as verified so far.
    pub fn valid_transactions(&mut self, id: &RawCoID) -> Vec<DecryptedTransaction> {
        let Some(entry) = self.entries.get_mut(id) else {
            return Vec::new();
        };
        let Some(core) = entry.verified.as_ref() else {
            return Vec::new();
        };
        let mut keys = KeyResolver::new(
            &self.directory,
            &self.directory,
            self.reader.as_ref(),
            &mut self.key_caches,
        );
        get_valid_transactions(
            core,
            &self.directory,
            &mut keys,
            &mut entry.decrypted,
            &ValidTransactionsOptions::default(),
        )
    }

    /// Register the groups and accounts each needed value depends on.
    fn stage_dependencies(&mut self) {
        let mut edges: Vec<(RawCoID, RawCoID)> = Vec::new();
        for entry in self.entries.values() {
            if !entry.has_demand() {
                continue;
            }
            let Some(header) = &entry.header else {
                continue;
            };
            for dependency in dependencies(&entry.id, header, entry.sessions.keys(), &self.directory) {
                edges.push((dependency, entry.id));
            }
        }

        for (dependency, dependent) in edges {
            let entry = self.entries.entry(dependency).or_insert_with(|| {
                debug!(id = %dependency, dependent = %dependent, "tracking dependency");
                CoValueEntry::new(dependency)
            });
            if entry.dependents.insert(dependent) {
                self.progressed = true;
            }
        }
    }

    /// Metadata loads, transaction-range loads and peer loads.
    fn stage_load(&mut self, effects: &mut Vec<Effect>) {
        let max = self.config.max_transactions_per_load.max(1);
        for entry in self.entries.values_mut() {
            match entry.storage {
                StorageState::Unknown => {
                    if self.has_storage {
                        entry.storage = StorageState::Pending;
                        effects.push(Effect::LoadMetadata { id: entry.id });
                    } else {
                        entry.storage = StorageState::Unavailable;
                        self.progressed = true;
                    }
                    continue;
                }
                StorageState::Pending => continue,
                StorageState::Known(_) | StorageState::Unavailable => {}
            }
            if !entry.has_demand() {
                continue;
            }

            let storage_busy = entry.has_pending_storage();
            for (session_id, session) in entry.sessions.iter_mut() {
                let pending = session
                    .transactions
                    .iter()
                    .position(|t| t.state == TxState::AvailableInStorage);
                let Some(from) = pending else {
                    continue;
                };
                let from = from as u32;
                let mut to = from;
                while to < session.len()
                    && to - from < max
                    && session.transactions[to as usize].state == TxState::AvailableInStorage
                {
                    session.transactions[to as usize].state = TxState::LoadingFromStorage;
                    to += 1;
                }
                effects.push(Effect::LoadTransactions {
                    id: entry.id,
                    session: session_id.clone(),
                    from,
                    to,
                });
            }

            if storage_busy || entry.requested_from_peers {
                continue;
            }
            let known = entry
                .verified
                .as_ref()
                .map_or_else(|| KnownState::empty(entry.id), |core| core.known_state().clone());
            for peer in self.peers.values() {
                if peer.config.role == PeerRole::Client {
                    continue;
                }
                let knowledge = entry.peer(&peer.id);
                if knowledge.awaiting_reply {
                    continue;
                }
                effects.push(Effect::Send {
                    peer: peer.id.clone(),
                    message: SyncMessage::Load { known: known.clone() },
                });
            }
            entry.requested_from_peers = true;
        }
    }

    /// Extend each needed value's verified core as far as signatures reach.
    fn stage_verify(&mut self) {
        let mut waiting: Vec<(RawCoID, RawCoID)> = Vec::new();
        let mut groups: Vec<RawCoID> = Vec::new();

        for entry in self.entries.values_mut() {
            if !entry.has_demand() {
                continue;
            }
            let Some(core) = entry.verified.as_mut() else {
                continue;
            };
            let mut advanced = false;
            for (session_id, session) in entry.sessions.iter_mut() {
                match verify_session(&entry.id, session_id, session, core, &self.directory) {
                    SessionVerify::Idle => {}
                    SessionVerify::Advanced(_) => advanced = true,
                    SessionVerify::WaitingFor(account) => waiting.push((account, entry.id)),
                    SessionVerify::Failed => self.progressed = true,
                }
            }
            if advanced {
                self.progressed = true;
                if core.header().ruleset.is_group() {
                    groups.push(entry.id);
                }
            }
        }

        for id in groups {
            let Some(entry) = self.entries.get(&id) else {
                continue;
            };
            let Some(core) = entry.verified.as_ref() else {
                continue;
            };
            if let Err(e) = self.directory.refresh(core) {
                warn!(id = %id, error = %e, "group did not materialize");
                continue;
            }
            let dependents: Vec<RawCoID> = entry.dependents.iter().copied().collect();
            for dependent in dependents {
                if let Some(entry) = self.entries.get_mut(&dependent) {
                    entry.stale_verdicts = true;
                }
            }
        }
        for (account, dependent) in waiting {
            let entry = self
                .entries
                .entry(account)
                .or_insert_with(|| CoValueEntry::new(account));
            if entry.dependents.insert(dependent) {
                self.progressed = true;
            }
        }
    }

    /// Give verified transactions a permission verdict. Values owned by a
    /// group that is not loaded yet wait. When a group changed, every
    /// verdict of its dependents is taken again; listeners of a value whose
    /// verdicts flipped get its content resent in full.
    fn stage_validate(&mut self) {
        for entry in self.entries.values_mut() {
            if !entry.needs_validation() {
                continue;
            }
            let Some(header) = &entry.header else {
                continue;
            };
            if let Some(group) = header.ruleset.owning_group() {
                if !self.directory.contains(group) {
                    continue;
                }
            }
            let recheck = entry.stale_verdicts;
            let mut flipped = false;
            for (session_id, session) in entry.sessions.iter_mut() {
                let permitted = session_id
                    .actor()
                    .map_or(false, |author| is_author_permitted(header, &author, &self.directory));
                let verdict = if permitted {
                    Validity::Valid
                } else {
                    Validity::Invalid
                };
                for slot in &mut session.transactions {
                    let TxState::Verified { validity, .. } = &mut slot.state else {
                        continue;
                    };
                    if *validity == verdict || (*validity != Validity::Unknown && !recheck) {
                        continue;
                    }
                    flipped |= *validity != Validity::Unknown;
                    *validity = verdict;
                    self.progressed = true;
                }
            }
            entry.stale_verdicts = false;
            if flipped {
                debug!(id = %entry.id, "verdicts changed after a group update");
                for last in entry.listeners.values_mut() {
                    *last = None;
                }
            }
        }
    }

    /// Decrypt what can be read and tell listeners about new content.
    fn stage_notify(&mut self, effects: &mut Vec<Effect>) {
        for entry in self.entries.values_mut() {
            if entry.listeners.is_empty() || entry.has_unvalidated() || entry.has_pending_storage() {
                continue;
            }
            let Some(core) = entry.verified.as_ref() else {
                continue;
            };
            let mut keys = KeyResolver::new(
                &self.directory,
                &self.directory,
                self.reader.as_ref(),
                &mut self.key_caches,
            );

            let group = key_group(core);
            let mut unlocked = false;
            for session in entry.sessions.values_mut() {
                for slot in &mut session.transactions {
                    let TxState::Verified {
                        validity: Validity::Valid,
                        decryption,
                    } = &mut slot.state
                    else {
                        continue;
                    };
                    if *decryption == DecryptionState::Decrypted {
                        continue;
                    }
                    let readable = match &slot.transaction {
                        Some(Transaction::Private { key_used, .. }) => {
                            group.map_or(false, |g| keys.read_key(&g, key_used).is_some())
                        }
                        _ => true,
                    };
                    let next = if readable {
                        DecryptionState::Decrypted
                    } else {
                        DecryptionState::Undecryptable
                    };
                    if *decryption == DecryptionState::Undecryptable && readable {
                        unlocked = true;
                    }
                    if *decryption != next {
                        *decryption = next;
                        self.progressed = true;
                    }
                }
            }

            // Content that was unreadable before is re-sent in full.
            if unlocked {
                for last in entry.listeners.values_mut() {
                    *last = None;
                }
            }

            let known = core.known_state();
            for (listener, last) in entry.listeners.iter_mut() {
                if last.as_ref() == Some(known) {
                    continue;
                }
                let options = ValidTransactionsOptions {
                    ignore_private: false,
                    since: last.clone(),
                };
                let transactions =
                    get_valid_transactions(core, &self.directory, &mut keys, &mut entry.decrypted, &options);
                *last = Some(known.clone());
                effects.push(Effect::Notify {
                    listener: *listener,
                    update: ListenerUpdate {
                        id: entry.id,
                        known: known.clone(),
                        transactions,
                    },
                });
            }
        }
    }

    /// Answer peers' loads and push verified content they lack.
    fn stage_sync(&mut self, effects: &mut Vec<Effect>) {
        for entry in self.entries.values_mut() {
            let demanded = entry.has_demand();
            let Some(core) = entry.verified.as_ref() else {
                answer_not_found(entry, &self.peers, effects);
                continue;
            };
            for peer in self.peers.values() {
                let tracked = entry.peers.contains_key(&peer.id);
                if !tracked && (peer.config.role == PeerRole::Client || !demanded) {
                    continue;
                }
                let knowledge = entry.peers.entry(peer.id.clone()).or_default();
                let chunks = core
                    .new_content_since(knowledge.optimistic.as_ref())
                    .unwrap_or_default();
                for chunk in &chunks {
                    record_known(&mut knowledge.optimistic, &delivered_state(chunk));
                }
                let pushed = !chunks.is_empty();
                effects.extend(chunks.into_iter().map(|chunk| Effect::Send {
                    peer: peer.id.clone(),
                    message: SyncMessage::Content { chunk },
                }));
                if knowledge.awaiting_reply {
                    knowledge.awaiting_reply = false;
                    if !pushed {
                        effects.push(Effect::Send {
                            peer: peer.id.clone(),
                            message: SyncMessage::Known {
                                known: core.known_state().clone(),
                            },
                        });
                    }
                }
            }
        }
    }

    /// Persist verified content the store does not hold yet.
    fn stage_store(&mut self, effects: &mut Vec<Effect>) {
        if !self.has_storage {
            return;
        }
        for entry in self.entries.values_mut() {
            let Some(core) = entry.verified.as_ref() else {
                continue;
            };
            if !matches!(entry.storage, StorageState::Known(_) | StorageState::Unavailable) {
                continue;
            }
            let mut writes = Vec::new();
            for log in core.sessions() {
                let Some(session) = entry.sessions.get_mut(log.session_id()) else {
                    continue;
                };
                if log.len() > session.stored {
                    writes.push(SessionWrite::since(log, session.stored));
                    session.stored = log.len();
                }
            }
            if writes.is_empty() && entry.storage != StorageState::Unavailable {
                continue;
            }
            entry.storage = StorageState::Known(core.known_state().clone());
            effects.push(Effect::Write {
                id: entry.id,
                header: core.header().clone(),
                sessions: writes,
            });
        }
    }
}

/// Reply "not found" to peers asking for a value we cannot get, once no
/// other peer can still provide it.
fn answer_not_found(entry: &mut CoValueEntry, peers: &BTreeMap<PeerID, Peer>, effects: &mut Vec<Effect>) {
    if entry.storage != StorageState::Unavailable || waiting_on_peers(entry, peers) {
        return;
    }
    let demanded = !entry.listeners.is_empty() || !entry.dependents.is_empty();
    if demanded && !entry.requested_from_peers {
        return;
    }
    for (peer, knowledge) in entry.peers.iter_mut() {
        if knowledge.awaiting_reply {
            knowledge.awaiting_reply = false;
            effects.push(Effect::Send {
                peer: peer.clone(),
                message: SyncMessage::Known {
                    known: KnownState::empty(entry.id),
                },
            });
        }
    }
}

/// A load went out and some server or storage peer has not answered it.
fn waiting_on_peers(entry: &CoValueEntry, peers: &BTreeMap<PeerID, Peer>) -> bool {
    entry.requested_from_peers
        && peers.values().any(|peer| {
            peer.config.role != PeerRole::Client
                && entry
                    .peers
                    .get(&peer.id)
                    .map_or(true, |k| !k.awaiting_reply && k.confirmed.is_none())
        })
}

/// Place a chunk's segments into the entry's slots. Checked whole before
/// anything is placed.
fn place_chunk(entry: &mut CoValueEntry, chunk: &ContentChunk) -> Result<(), AppendError> {
    if entry.header.is_none() {
        return Err(AppendError::MissingHeader(chunk.id));
    }
    for (session_id, segment) in &chunk.new {
        let have = entry.sessions.get(session_id).map_or(0, SessionEntry::len);
        if segment.after > have {
            return Err(AppendError::NonContiguous {
                session: session_id.clone(),
                after: segment.after,
                have,
            });
        }
    }
    for (session_id, segment) in &chunk.new {
        if segment.transactions.is_empty() {
            continue;
        }
        let signatures: BTreeMap<u32, Signature> = segment
            .last_signature
            .map(|signature| (segment.end() - 1, signature))
            .into_iter()
            .collect();
        entry
            .sessions
            .entry(session_id.clone())
            .or_default()
            .fill(segment.after, &segment.transactions, &signatures);
    }
    Ok(())
}

/// The state a peer is known to hold after sending or receiving `chunk`.
fn delivered_state(chunk: &ContentChunk) -> KnownState {
    let mut known = KnownState::empty(chunk.id);
    known.header = true;
    for (session_id, segment) in &chunk.new {
        known.update_session(session_id, segment.end());
    }
    known
}

fn record_known(slot: &mut Option<KnownState>, known: &KnownState) {
    match slot {
        Some(existing) => existing.combine_with(known),
        None => *slot = Some(known.clone()),
    }
}
