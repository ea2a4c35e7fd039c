//! LocalNode: one replica's CoValues, peers and storage.
//!
//! Each CoValue is a [`CoValueCore`] paired with a [`CoValueState`] that
//! tracks where it is being loaded from. Inbound messages are applied as
//! they arrive; local writes are persisted and pushed to interested peers.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde_json::Value as JsonValue;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use coweave_core::{
    ActorID, AgentID, AppendError, CoValueCore, CoValueHeader, ContentChunk, Hash, KnownState, Privacy,
    RawCoID, ResolveAccountAgentError, Verification,
};
use coweave_keys::{
    dependencies, get_valid_transactions, is_author_permitted, key_group, make_transaction,
    DecryptCache, DecryptedTransaction, Directory, KeyCaches, KeyResolver, LocalIdentity, Role,
    ValidTransactionsOptions,
};
use coweave_store::{load_value, pending_writes, SessionWrite, Store};
use coweave_sync::{
    apply_content, load_from_peers, lock, respond_to_load, Applied, CoValueState, HighLevelState,
    Peer, PeerConfig, PeerID, PeerRole, PeerState, PeerStatus, SharedCoValueState, StateCounters,
    StateSnapshot, SyncError, SyncMessage, Transport,
};

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};

fn poisoned<T>(e: PoisonError<T>) -> NodeError {
    NodeError::LockPoisoned(e.to_string())
}

/// Read-key and decryption caches, owned by the node.
#[derive(Default)]
struct ReadCaches {
    keys: KeyCaches,
    decrypted: HashMap<RawCoID, DecryptCache>,
}

/// What one change to a value persists and sends, collected while the value
/// is locked.
struct Outgoing {
    id: RawCoID,
    write: Option<(CoValueHeader, Vec<SessionWrite>)>,
    messages: Vec<(PeerID, SyncMessage)>,
}

/// Result of handling one content message.
struct ContentHandled {
    replies: Vec<(PeerID, SyncMessage)>,
    /// The value is held now; content waiting on it can be applied.
    available: bool,
}

type Replies = Vec<(PeerID, SyncMessage)>;

/// A local replica.
pub struct LocalNode {
    identity: LocalIdentity,
    config: NodeConfig,
    transport: Arc<dyn Transport>,
    store: Option<Arc<dyn Store>>,
    values: Mutex<HashMap<RawCoID, SharedCoValueState>>,
    peers: Mutex<BTreeMap<PeerID, PeerState>>,
    /// Materialized groups and accounts, for permissions, keys and signers.
    directory: RwLock<Directory>,
    caches: Mutex<ReadCaches>,
    counters: Arc<StateCounters>,
    /// Content whose signing account is not loaded yet, by account.
    parked: Mutex<HashMap<RawCoID, Vec<(PeerID, ContentChunk)>>>,
}

impl LocalNode {
    /// Create a node writing as `identity` over `transport`.
    pub fn new(identity: LocalIdentity, transport: Arc<dyn Transport>, config: NodeConfig) -> Self {
        Self {
            identity,
            config,
            transport,
            store: None,
            values: Mutex::new(HashMap::new()),
            peers: Mutex::new(BTreeMap::new()),
            directory: RwLock::new(Directory::new()),
            caches: Mutex::new(ReadCaches::default()),
            counters: StateCounters::new(),
            parked: Mutex::new(HashMap::new()),
        }
    }

    /// Persist to (and load from) `store`.
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn peer_id(&self) -> PeerID {
        self.transport.local_peer_id()
    }

    /// CoValues per high-level state.
    pub fn counters(&self) -> &Arc<StateCounters> {
        &self.counters
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Peers
    // ─────────────────────────────────────────────────────────────────────────

    /// Start talking to a peer.
    pub fn add_peer(&self, peer: Peer) -> Result<()> {
        let mut peers = self.peers.lock().map_err(poisoned)?;
        peers.insert(peer.id.clone(), PeerState::new(peer));
        Ok(())
    }

    /// Close the connection to a peer.
    pub async fn remove_peer(&self, peer: &PeerID) -> Result<()> {
        if let Err(err) = self.transport.disconnect(peer).await {
            debug!(peer = %peer, error = %err, "disconnect");
        }
        self.on_close(peer)?;
        self.peers.lock().map_err(poisoned)?.remove(peer);
        Ok(())
    }

    pub fn peers(&self) -> Result<Vec<Peer>> {
        let peers = self.peers.lock().map_err(poisoned)?;
        Ok(peers.values().map(|p| p.peer().clone()).collect())
    }

    fn with_peer<R>(&self, peer: &PeerID, f: impl FnOnce(&mut PeerState) -> R) -> Result<R> {
        let mut peers = self.peers.lock().map_err(poisoned)?;
        let state = peers
            .entry(peer.clone())
            .or_insert_with(|| PeerState::new(Peer::new(peer.clone(), PeerConfig::client())));
        Ok(f(state))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // CoValue State
    // ─────────────────────────────────────────────────────────────────────────

    fn state(&self, id: &RawCoID) -> Result<Option<SharedCoValueState>> {
        let values = self.values.lock().map_err(poisoned)?;
        Ok(values.get(id).cloned())
    }

    fn state_or_unknown(&self, id: RawCoID) -> Result<SharedCoValueState> {
        let mut values = self.values.lock().map_err(poisoned)?;
        let counters = &self.counters;
        Ok(values
            .entry(id)
            .or_insert_with(|| CoValueState::unknown(id, Arc::clone(counters)).into_shared())
            .clone())
    }

    /// Start tracking `id` unless it already is. Returns whether it was new.
    fn track_new(&self, id: RawCoID) -> Result<bool> {
        let mut values = self.values.lock().map_err(poisoned)?;
        if values.contains_key(&id) {
            return Ok(false);
        }
        let state = CoValueState::unknown(id, Arc::clone(&self.counters)).into_shared();
        values.insert(id, state);
        Ok(true)
    }

    /// Overall state of a CoValue. Untracked values are unknown.
    pub fn high_level_state(&self, id: &RawCoID) -> Result<HighLevelState> {
        match self.state(id)? {
            Some(state) => Ok(lock(&state)?.high_level_state()),
            None => Ok(HighLevelState::Unknown),
        }
    }

    /// Status of the load from one peer.
    pub fn peer_status(&self, id: &RawCoID, peer: &PeerID) -> Result<PeerStatus> {
        match self.state(id)? {
            Some(state) => Ok(lock(&state)?.peer_status(peer)),
            None => Ok(PeerStatus::Unknown),
        }
    }

    pub fn known_state(&self, id: &RawCoID) -> Result<Option<KnownState>> {
        self.with_core(id, |core| core.known_state().clone())
    }

    /// Run `f` on the local content, if any.
    pub fn with_core<R>(&self, id: &RawCoID, f: impl FnOnce(&CoValueCore) -> R) -> Result<Option<R>> {
        let Some(state) = self.state(id)? else {
            return Ok(None);
        };
        let guard = lock(&state)?;
        Ok(guard.core().map(f))
    }

    /// Watch a CoValue's state. Starts tracking it if needed.
    pub fn subscribe(&self, id: RawCoID) -> Result<watch::Receiver<StateSnapshot>> {
        let state = self.state_or_unknown(id)?;
        let guard = lock(&state)?;
        Ok(guard.subscribe())
    }

    /// Valid transactions the local identity can read, in canonical order.
    pub fn valid_transactions(&self, id: &RawCoID) -> Result<Vec<DecryptedTransaction>> {
        let state = self.state(id)?.ok_or(NodeError::UnknownCoValue(*id))?;
        let guard = lock(&state)?;
        let core = guard.core().ok_or(NodeError::Unavailable(*id))?;
        let directory = self.directory.read().map_err(poisoned)?;
        let mut caches = self.caches.lock().map_err(poisoned)?;
        let ReadCaches { keys, decrypted } = &mut *caches;
        let cache = decrypted.entry(*id).or_default();
        let mut resolver = KeyResolver::new(&*directory, &*directory, Some(&self.identity), keys);
        Ok(get_valid_transactions(
            core,
            &*directory,
            &mut resolver,
            cache,
            &ValidTransactionsOptions::default(),
        ))
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Track a new, empty CoValue.
    pub async fn create_covalue(&self, header: CoValueHeader) -> Result<RawCoID> {
        self.insert_core(CoValueCore::new(header)).await
    }

    /// Track a CoValue built elsewhere (an account created before the node,
    /// for instance).
    pub async fn insert_core(&self, core: CoValueCore) -> Result<RawCoID> {
        let id = core.id();
        let targets = self.push_targets(&id).await?;
        let stored = self.stored_state(&id).await?;
        let state = self.state_or_unknown(id)?;
        let outgoing = {
            let mut guard = lock(&state)?;
            let outgoing = self.outgoing(&core, &targets, stored)?;
            guard.mark_available(core, None);
            outgoing
        };
        self.flush(outgoing).await?;
        info!(id = %id, "covalue created");
        Ok(id)
    }

    /// Create a group administered by the local identity.
    pub async fn create_group(&self, made_at: u64) -> Result<RawCoID> {
        let (core, key_id, secret) = coweave_keys::create_group(&self.identity, made_at)?;
        self.caches
            .lock()
            .map_err(poisoned)?
            .keys
            .insert(core.id(), key_id, secret);
        self.insert_core(core).await
    }

    /// Give `member` a role in `group`, revealing the current read key.
    pub async fn add_member(
        &self,
        group: RawCoID,
        member: &ActorID,
        member_agent: &AgentID,
        role: Role,
        made_at: u64,
    ) -> Result<Hash> {
        self.edit_group(group, &[], |core, identity, keys, _| {
            let (key_id, secret) = keys
                .current_read_key(&core.id())
                .ok_or_else(|| coweave_keys::KeysError::MissingReadKey(core.id().to_string()))?;
            coweave_keys::add_member(core, identity, member, member_agent, role, (&key_id, &secret), made_at)
        })
        .await
    }

    /// Grant a role to everyone.
    pub async fn add_everyone(&self, group: RawCoID, role: Role, made_at: u64) -> Result<Hash> {
        self.edit_group(group, &[], |core, identity, keys, _| {
            let (key_id, secret) = keys
                .current_read_key(&core.id())
                .ok_or_else(|| coweave_keys::KeysError::MissingReadKey(core.id().to_string()))?;
            coweave_keys::add_everyone(core, identity, role, (&key_id, &secret), made_at)
        })
        .await
    }

    /// Make `child` extend `parent`.
    pub async fn extend_parent(&self, child: RawCoID, parent: RawCoID, made_at: u64) -> Result<Hash> {
        self.edit_group(child, &[parent], |core, identity, keys, _| {
            let missing = |id: RawCoID| coweave_keys::KeysError::MissingReadKey(id.to_string());
            let child_key = keys.current_read_key(&core.id()).ok_or_else(|| missing(core.id()))?;
            let parent_key = keys.current_read_key(&parent).ok_or_else(|| missing(parent))?;
            coweave_keys::extend_parent(
                core,
                identity,
                &parent,
                (&child_key.0, &child_key.1),
                (&parent_key.0, &parent_key.1),
                made_at,
            )
        })
        .await
    }

    /// Rotate a group's read key.
    pub async fn rotate_read_key(&self, group: RawCoID, made_at: u64) -> Result<Hash> {
        self.edit_group(group, &[], |core, identity, keys, accounts| {
            let (key_id, secret) = keys
                .current_read_key(&core.id())
                .ok_or_else(|| coweave_keys::KeysError::MissingReadKey(core.id().to_string()))?;
            coweave_keys::rotate_read_key(core, identity, accounts, (&key_id, &secret), made_at)?;
            Ok(core.session_hash(&identity.session))
        })
        .await
    }

    async fn edit_group<F>(&self, group: RawCoID, also_needs: &[RawCoID], edit: F) -> Result<Hash>
    where
        F: FnOnce(
            &mut CoValueCore,
            &LocalIdentity,
            &mut KeyResolver<'_>,
            &Directory,
        ) -> coweave_keys::Result<Hash>,
    {
        let state = self.state(&group)?.ok_or(NodeError::UnknownCoValue(group))?;
        for id in also_needs {
            if self.high_level_state(id)? != HighLevelState::Available {
                return Err(NodeError::Unavailable(*id));
            }
        }
        let targets = self.push_targets(&group).await?;
        let stored = self.stored_state(&group).await?;
        let (hash, outgoing) = {
            let mut guard = lock(&state)?;
            let core = guard.core_mut().ok_or(NodeError::Unavailable(group))?;
            if !core.header().ruleset.is_group() {
                return Err(NodeError::NotAuthorized(format!("{} is not a group", group)));
            }
            let hash = {
                let directory = self.directory.read().map_err(poisoned)?;
                let mut caches = self.caches.lock().map_err(poisoned)?;
                let mut keys =
                    KeyResolver::new(&*directory, &*directory, Some(&self.identity), &mut caches.keys);
                edit(core, &self.identity, &mut keys, &directory)?
            };
            let outgoing = self.outgoing(core, &targets, stored)?;
            guard.notify_changed();
            (hash, outgoing)
        };
        self.flush(outgoing).await?;
        Ok(hash)
    }

    /// Append a transaction in the local session.
    ///
    /// Private transactions are encrypted under the key group's current read
    /// key.
    pub async fn make_transaction(
        &self,
        id: RawCoID,
        changes: &[JsonValue],
        privacy: Privacy,
        made_at: u64,
    ) -> Result<Hash> {
        let state = self.state(&id)?.ok_or(NodeError::UnknownCoValue(id))?;
        let targets = self.push_targets(&id).await?;
        let stored = self.stored_state(&id).await?;
        let (hash, outgoing) = {
            let mut guard = lock(&state)?;
            let core = guard.core_mut().ok_or(NodeError::Unavailable(id))?;
            let hash = {
                let directory = self.directory.read().map_err(poisoned)?;
                if !is_author_permitted(core.header(), &self.identity.actor, &*directory) {
                    return Err(NodeError::NotAuthorized(format!(
                        "{} cannot write to {}",
                        self.identity.actor, id
                    )));
                }

                let read_key = match privacy {
                    Privacy::Trusting => None,
                    Privacy::Private => {
                        let group = key_group(core).ok_or_else(|| {
                            NodeError::NotAuthorized(format!("{} has no key group", id))
                        })?;
                        let mut caches = self.caches.lock().map_err(poisoned)?;
                        let mut keys =
                            KeyResolver::new(&*directory, &*directory, Some(&self.identity), &mut caches.keys);
                        keys.current_read_key(&group)
                    }
                };
                make_transaction(
                    core,
                    &self.identity,
                    changes,
                    privacy,
                    read_key.as_ref().map(|(key_id, secret)| (key_id, secret)),
                    made_at,
                )?
            };
            let outgoing = self.outgoing(core, &targets, stored)?;
            guard.notify_changed();
            (hash, outgoing)
        };
        self.flush(outgoing).await?;
        Ok(hash)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Outgoing Changes
    // ─────────────────────────────────────────────────────────────────────────

    /// Peers a change to `id` should reach: server and storage peers, and
    /// any peer that asked about it. Peers the transport lost are skipped.
    async fn push_targets(&self, id: &RawCoID) -> Result<Vec<PeerID>> {
        let candidates: Vec<PeerID> = {
            let peers = self.peers.lock().map_err(poisoned)?;
            peers
                .values()
                .filter(|p| p.is_tracking(id) || p.peer().config.role != PeerRole::Client)
                .map(|p| p.id().clone())
                .collect()
        };
        let mut targets = Vec::with_capacity(candidates.len());
        for peer in candidates {
            if self.transport.is_connected(&peer).await {
                targets.push(peer);
            } else {
                debug!(id = %id, peer = %peer, "peer not connected, push skipped");
            }
        }
        Ok(targets)
    }

    /// The stored known state of `id`. `None` when the node has no store.
    async fn stored_state(&self, id: &RawCoID) -> Result<Option<Option<KnownState>>> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        let metadata = store.load_metadata(id).await?;
        Ok(Some(metadata.map(|m| m.known_state)))
    }

    /// Collect what a change to `core` persists and pushes. Called with the
    /// value locked; a changed group is re-materialized here.
    fn outgoing(
        &self,
        core: &CoValueCore,
        targets: &[PeerID],
        stored: Option<Option<KnownState>>,
    ) -> Result<Outgoing> {
        if core.header().ruleset.is_group() {
            self.directory.write().map_err(poisoned)?.refresh(core)?;
        }
        let write = stored.and_then(|stored| {
            let sessions = pending_writes(core, stored.as_ref());
            (stored.is_none() || !sessions.is_empty()).then(|| (core.header().clone(), sessions))
        });
        let mut messages = Vec::new();
        let mut peers = self.peers.lock().map_err(poisoned)?;
        for target in targets {
            if let Some(peer) = peers.get_mut(target) {
                let content = peer.content_to_send(core);
                messages.extend(content.into_iter().map(|m| (target.clone(), m)));
            }
        }
        Ok(Outgoing {
            id: core.id(),
            write,
            messages,
        })
    }

    /// Persist, then send the value's dependencies ahead of its content.
    async fn flush(&self, outgoing: Outgoing) -> Result<()> {
        if let (Some(store), Some((header, sessions))) = (&self.store, &outgoing.write) {
            let outcome = store.write(&outgoing.id, header, sessions).await?;
            debug!(id = %outgoing.id, appended = outcome.appended, created = outcome.created, "persisted");
        }
        let receiving: Vec<PeerID> = outgoing
            .messages
            .iter()
            .map(|(peer, _)| peer.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let dependencies = self.dependency_content(&outgoing.id, &receiving).await?;
        for (peer, message) in dependencies.into_iter().chain(outgoing.messages) {
            if let Err(err) = self.transport.send(&peer, message).await {
                warn!(id = %outgoing.id, peer = %peer, error = %err, "sync push failed");
            }
        }
        Ok(())
    }

    /// Groups and accounts `id` depends on directly, from what is held.
    fn direct_dependencies(&self, id: &RawCoID) -> Result<BTreeSet<RawCoID>> {
        let Some(state) = self.state(id)? else {
            return Ok(BTreeSet::new());
        };
        let guard = lock(&state)?;
        let Some(core) = guard.core() else {
            return Ok(BTreeSet::new());
        };
        let directory = self.directory.read().map_err(poisoned)?;
        Ok(dependencies(id, core.header(), core.known_state().sessions.keys(), &*directory))
    }

    /// Everything `id` depends on, transitively, deepest first. Dependencies
    /// held only in storage are loaded on the way.
    async fn dependency_order(&self, id: &RawCoID) -> Result<Vec<RawCoID>> {
        let mut order = Vec::new();
        let mut visited = BTreeSet::from([*id]);
        let mut stack: Vec<(RawCoID, bool)> = self
            .direct_dependencies(id)?
            .into_iter()
            .map(|dependency| (dependency, false))
            .collect();
        while let Some((dependency, expanded)) = stack.pop() {
            if expanded {
                order.push(dependency);
                continue;
            }
            if !visited.insert(dependency) {
                continue;
            }
            if self.store.is_some() {
                let state = self.state_or_unknown(dependency)?;
                self.load_local(&state, &dependency).await?;
            }
            stack.push((dependency, true));
            for next in self.direct_dependencies(&dependency)? {
                if !visited.contains(&next) {
                    stack.push((next, false));
                }
            }
        }
        Ok(order)
    }

    /// Content of the values `id` depends on that `targets` were not sent
    /// yet, deepest dependencies first.
    async fn dependency_content(&self, id: &RawCoID, targets: &[PeerID]) -> Result<Replies> {
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        let mut messages = Vec::new();
        for dependency in self.dependency_order(id).await? {
            let Some(state) = self.state(&dependency)? else {
                continue;
            };
            let guard = lock(&state)?;
            let Some(core) = guard.core() else {
                continue;
            };
            let mut peers = self.peers.lock().map_err(poisoned)?;
            for target in targets {
                if let Some(peer) = peers.get_mut(target) {
                    let content = peer.content_to_send(core);
                    messages.extend(content.into_iter().map(|m| (target.clone(), m)));
                }
            }
        }
        Ok(messages)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Loading
    // ─────────────────────────────────────────────────────────────────────────

    /// Make a CoValue available: from memory, then storage, then peers.
    pub async fn load(&self, id: RawCoID) -> Result<HighLevelState> {
        let state = self.state_or_unknown(id)?;
        if self.load_local(&state, &id).await? {
            return Ok(HighLevelState::Available);
        }

        let peers = self.peers()?;
        if peers.is_empty() {
            return Ok(lock(&state)?.high_level_state());
        }
        Ok(load_from_peers(&state, &peers, &self.config.load, Arc::clone(&self.transport)).await?)
    }

    /// Load and return a CoValue, failing if it cannot be found.
    pub async fn load_required(&self, id: RawCoID) -> Result<CoValueCore> {
        match self.load(id).await? {
            HighLevelState::Available => self
                .with_core(&id, CoValueCore::clone)?
                .ok_or(NodeError::Unavailable(id)),
            _ => Err(NodeError::Unavailable(id)),
        }
    }

    /// Whether the value is held in memory, reading it from storage if not.
    async fn load_local(&self, state: &SharedCoValueState, id: &RawCoID) -> Result<bool> {
        if lock(state)?.core().is_some() {
            return Ok(true);
        }
        let Some(store) = &self.store else {
            return Ok(false);
        };
        let Some(stored) = load_value(store.as_ref(), id).await? else {
            return Ok(false);
        };
        // Storage only ever receives verified content.
        let core = stored.into_core(Verification::Skip)?;
        info!(id = %id, transactions = core.known_state().total(), "loaded from storage");
        if core.header().ruleset.is_group() {
            self.directory.write().map_err(poisoned)?.refresh(&core)?;
        }
        lock(state)?.mark_available(core, None);
        Ok(true)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Inbound Messages
    // ─────────────────────────────────────────────────────────────────────────

    /// Apply one message from `from` and send any replies.
    pub async fn handle_message(&self, from: &PeerID, message: SyncMessage) -> Result<()> {
        if let Err(reason) = message.validate_limits() {
            warn!(peer = %from, reason, "message over limits");
            return Err(SyncError::InvalidMessage(reason.into()).into());
        }
        let replies = match message {
            SyncMessage::Load { known } => self.on_load(from, &known).await?,
            SyncMessage::Content { chunk } => self.on_content_and_released(from, chunk).await?,
            SyncMessage::Known { known } => self.on_known(from, &known)?,
            SyncMessage::Close => {
                self.on_close(from)?;
                Vec::new()
            }
        };
        for (to, reply) in replies {
            self.transport.send(&to, reply).await?;
        }
        Ok(())
    }

    /// Answer a load, sending what the value depends on ahead of it.
    async fn on_load(&self, from: &PeerID, known: &KnownState) -> Result<Replies> {
        self.with_peer(from, |p| p.set_confirmed(known))?;
        let state = self.state_or_unknown(known.id)?;
        self.load_local(&state, &known.id).await?;

        let mut replies = self.dependency_content(&known.id, std::slice::from_ref(from)).await?;
        let answer = {
            let guard = lock(&state)?;
            respond_to_load(guard.core(), known)
        };
        self.with_peer(from, |p| {
            for reply in &answer {
                if let SyncMessage::Content { chunk } = reply {
                    p.record_sent(chunk);
                }
            }
        })?;
        replies.extend(answer.into_iter().map(|reply| (from.clone(), reply)));
        debug!(id = %known.id, peer = %from, replies = replies.len(), "answered load");
        Ok(replies)
    }

    /// Apply a chunk, then any content that was waiting for its value.
    async fn on_content_and_released(&self, from: &PeerID, chunk: ContentChunk) -> Result<Replies> {
        let handled = self.on_content(from, &chunk).await?;
        let mut replies = handled.replies;
        let mut released = if handled.available {
            self.take_parked(&chunk.id)?
        } else {
            VecDeque::new()
        };
        while let Some((peer, chunk)) = released.pop_front() {
            match self.on_content(&peer, &chunk).await {
                Ok(handled) => {
                    replies.extend(handled.replies);
                    if handled.available {
                        released.extend(self.take_parked(&chunk.id)?);
                    }
                }
                Err(err) => warn!(id = %chunk.id, peer = %peer, error = %err, "released content failed"),
            }
        }
        Ok(replies)
    }

    async fn on_content(&self, from: &PeerID, chunk: &ContentChunk) -> Result<ContentHandled> {
        let id = chunk.id;
        let mut seen = KnownState::empty(id);
        seen.header = chunk.header.is_some();
        for (session, segment) in &chunk.new {
            seen.update_session(session, segment.end());
        }
        self.with_peer(from, |p| p.set_confirmed(&seen))?;

        let state = self.state_or_unknown(id)?;
        let targets = self.push_targets(&id).await?;
        let stored = self.stored_state(&id).await?;
        let (outgoing, ack) = {
            let mut guard = lock(&state)?;
            let applied = {
                let directory = self.directory.read().map_err(poisoned)?;
                apply_content(guard.core_mut(), chunk, &*directory)
            };
            match applied {
                Ok(Applied::Created(core, _)) => guard.mark_available(core, Some(from)),
                Ok(Applied::Existing(outcome)) => {
                    if outcome.changed() {
                        guard.notify_changed();
                    }
                    if guard.peer_status(from) == PeerStatus::Pending {
                        guard.mark_peer_available(from);
                    }
                }
                Err(AppendError::ResolveAccountAgent(ResolveAccountAgentError::AccountNotLoaded(account))) => {
                    drop(guard);
                    return self.park(from, chunk, account);
                }
                Err(err) => {
                    warn!(id = %id, peer = %from, error = %err, "content rejected");
                    if guard.core().is_none() {
                        guard.mark_errored(from, err.to_string());
                    }
                    return Err(SyncError::Rejected(err).into());
                }
            }
            let Some(core) = guard.core() else {
                return Ok(ContentHandled {
                    replies: Vec::new(),
                    available: false,
                });
            };
            (self.outgoing(core, &targets, stored)?, core.known_state().clone())
        };
        self.flush(outgoing).await?;

        let mut replies = self.request_missing(from, &id)?;
        replies.push((from.clone(), SyncMessage::Known { known: ack }));
        Ok(ContentHandled {
            replies,
            available: true,
        })
    }

    /// Hold `chunk` until `account` arrives, asking `from` for the account
    /// the first time anything waits on it.
    fn park(&self, from: &PeerID, chunk: &ContentChunk, account: RawCoID) -> Result<ContentHandled> {
        let first = {
            let mut parked = self.parked.lock().map_err(poisoned)?;
            let waiting = parked.entry(account).or_default();
            waiting.push((from.clone(), chunk.clone()));
            waiting.len() == 1
        };
        debug!(id = %chunk.id, account = %account, peer = %from, "content waits for its signer");
        let mut replies = Vec::new();
        if first {
            self.track_new(account)?;
            replies.push((
                from.clone(),
                SyncMessage::Load {
                    known: KnownState::empty(account),
                },
            ));
        }
        Ok(ContentHandled {
            replies,
            available: false,
        })
    }

    fn take_parked(&self, id: &RawCoID) -> Result<VecDeque<(PeerID, ContentChunk)>> {
        let mut parked = self.parked.lock().map_err(poisoned)?;
        Ok(parked.remove(id).map(VecDeque::from).unwrap_or_default())
    }

    /// `from` does not have `id`: content from it that waited on `id` fails.
    fn drop_parked(&self, from: &PeerID, id: &RawCoID) -> Result<()> {
        let dropped: Vec<ContentChunk> = {
            let mut parked = self.parked.lock().map_err(poisoned)?;
            let Some(waiting) = parked.remove(id) else {
                return Ok(());
            };
            let (dropped, kept): (Vec<_>, Vec<_>) = waiting.into_iter().partition(|(peer, _)| peer == from);
            if !kept.is_empty() {
                parked.insert(*id, kept);
            }
            dropped.into_iter().map(|(_, chunk)| chunk).collect()
        };
        for chunk in dropped {
            warn!(id = %chunk.id, account = %id, peer = %from, "signer unavailable, content dropped");
            if let Some(state) = self.state(&chunk.id)? {
                let mut guard = lock(&state)?;
                if guard.core().is_none() {
                    guard.mark_errored(from, format!("account {} is not available", id));
                }
            }
        }
        Ok(())
    }

    /// Ask `from` for the groups and accounts `id` needs that this node has
    /// never seen.
    fn request_missing(&self, from: &PeerID, id: &RawCoID) -> Result<Replies> {
        let mut requests = Vec::new();
        for dependency in self.direct_dependencies(id)? {
            if self.track_new(dependency)? {
                debug!(id = %id, dependency = %dependency, peer = %from, "requesting dependency");
                requests.push((
                    from.clone(),
                    SyncMessage::Load {
                        known: KnownState::empty(dependency),
                    },
                ));
            }
        }
        Ok(requests)
    }

    fn on_known(&self, from: &PeerID, known: &KnownState) -> Result<Replies> {
        self.with_peer(from, |p| p.set_confirmed(known))?;
        let Some(state) = self.state(&known.id)? else {
            return Ok(Vec::new());
        };
        let pushes = {
            let mut guard = lock(&state)?;
            let pending = guard.peer_status(from) == PeerStatus::Pending;
            let pushes = match guard.core() {
                Some(core) => Some(self.with_peer(from, |p| p.content_to_send(core))?),
                None => None,
            };
            match &pushes {
                Some(_) if pending => guard.mark_peer_available(from),
                None if pending && !known.header => guard.mark_not_found_in_peer(from),
                _ => {}
            }
            pushes
        };
        match pushes {
            Some(pushes) => Ok(pushes.into_iter().map(|m| (from.clone(), m)).collect()),
            None => {
                if !known.header {
                    self.drop_parked(from, &known.id)?;
                }
                Ok(Vec::new())
            }
        }
    }

    fn on_close(&self, from: &PeerID) -> Result<()> {
        let states: Vec<SharedCoValueState> = self.values.lock().map_err(poisoned)?.values().cloned().collect();
        for state in states {
            lock(&state)?.mark_peer_closed(from);
        }
        if let Some(peer) = self.peers.lock().map_err(poisoned)?.get_mut(from) {
            peer.reset();
        }
        info!(peer = %from, "peer closed");
        Ok(())
    }

    /// Process inbound messages until `shutdown` fires or the transport
    /// closes.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(peer = %self.peer_id(), "node running");
        loop {
            let received = tokio::select! {
                _ = shutdown.cancelled() => break,
                received = self.transport.recv() => received,
            };
            match received {
                Ok((from, message)) => {
                    if let Err(err) = self.handle_message(&from, message).await {
                        warn!(peer = %from, error = %err, "message failed");
                    }
                }
                Err(err) => {
                    warn!(error = %err, "transport closed");
                    break;
                }
            }
        }
        info!(peer = %self.peer_id(), "node stopped");
    }
}
