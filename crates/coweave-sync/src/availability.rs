//! Availability of one CoValue across peers.
//!
//! Tracks, per peer, whether a load is pending and what came of it, and
//! derives the value's overall state from that. Every transition is
//! published on a `watch` channel and counted in [`StateCounters`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use coweave_core::{CoValueCore, KnownState, RawCoID};

use crate::error::{Result, SyncError};
use crate::messages::PeerID;

/// Where a load from one peer stands.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PeerStatus {
    #[default]
    Unknown,
    Pending,
    Available,
    Unavailable,
    Errored(String),
}

impl PeerStatus {
    /// The peer has answered, one way or another.
    pub fn is_settled(&self) -> bool {
        !matches!(self, PeerStatus::Unknown | PeerStatus::Pending)
    }
}

/// Overall state of a CoValue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HighLevelState {
    Unknown,
    Loading,
    Available,
    Unavailable,
}

impl HighLevelState {
    pub fn as_str(self) -> &'static str {
        match self {
            HighLevelState::Unknown => "unknown",
            HighLevelState::Loading => "loading",
            HighLevelState::Available => "available",
            HighLevelState::Unavailable => "unavailable",
        }
    }
}

/// What subscribers see after each transition.
#[derive(Debug, Clone, PartialEq)]
pub struct StateSnapshot {
    pub state: HighLevelState,
    pub peers: BTreeMap<PeerID, PeerStatus>,
    /// Local known state, once the value is available.
    pub known: Option<KnownState>,
}

/// Number of CoValues in each high-level state.
#[derive(Debug, Default)]
pub struct StateCounters {
    unknown: AtomicU64,
    loading: AtomicU64,
    available: AtomicU64,
    unavailable: AtomicU64,
}

impl StateCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn counter(&self, state: HighLevelState) -> &AtomicU64 {
        match state {
            HighLevelState::Unknown => &self.unknown,
            HighLevelState::Loading => &self.loading,
            HighLevelState::Available => &self.available,
            HighLevelState::Unavailable => &self.unavailable,
        }
    }

    pub fn get(&self, state: HighLevelState) -> u64 {
        self.counter(state).load(Ordering::Relaxed)
    }

    fn enter(&self, state: HighLevelState) {
        self.counter(state).fetch_add(1, Ordering::Relaxed);
    }

    fn leave(&self, state: HighLevelState) {
        // Saturating: never wrap below zero.
        let _ = self
            .counter(state)
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }
}

/// One CoValue's local content (if any) and per-peer load state.
#[derive(Debug)]
pub struct CoValueState {
    id: RawCoID,
    core: Option<CoValueCore>,
    peers: BTreeMap<PeerID, PeerStatus>,
    load_tokens: HashMap<PeerID, CancellationToken>,
    counted: HighLevelState,
    counters: Arc<StateCounters>,
    notify: watch::Sender<StateSnapshot>,
}

/// A CoValueState shared between the node and its load tasks.
pub type SharedCoValueState = Arc<Mutex<CoValueState>>;

/// Lock a shared state, mapping poisoning to an error.
pub fn lock(state: &SharedCoValueState) -> Result<MutexGuard<'_, CoValueState>> {
    state
        .lock()
        .map_err(|e| SyncError::LockPoisoned(e.to_string()))
}

impl CoValueState {
    /// A value nothing is known about yet.
    pub fn unknown(id: RawCoID, counters: Arc<StateCounters>) -> Self {
        counters.enter(HighLevelState::Unknown);
        let (notify, _) = watch::channel(StateSnapshot {
            state: HighLevelState::Unknown,
            peers: BTreeMap::new(),
            known: None,
        });
        Self {
            id,
            core: None,
            peers: BTreeMap::new(),
            load_tokens: HashMap::new(),
            counted: HighLevelState::Unknown,
            counters,
            notify,
        }
    }

    /// A value created or loaded locally.
    pub fn available(core: CoValueCore, counters: Arc<StateCounters>) -> Self {
        let mut state = Self::unknown(core.id(), counters);
        state.mark_available(core, None);
        state
    }

    pub fn into_shared(self) -> SharedCoValueState {
        Arc::new(Mutex::new(self))
    }

    pub fn id(&self) -> RawCoID {
        self.id
    }

    pub fn core(&self) -> Option<&CoValueCore> {
        self.core.as_ref()
    }

    /// Mutable access to the local content. Call [`Self::notify_changed`]
    /// after changing it.
    pub fn core_mut(&mut self) -> Option<&mut CoValueCore> {
        self.core.as_mut()
    }

    /// What to put in a load request: the local known state, or empty.
    pub fn known_state(&self) -> KnownState {
        self.core
            .as_ref()
            .map_or_else(|| KnownState::empty(self.id), |core| core.known_state().clone())
    }

    pub fn peer_status(&self, peer: &PeerID) -> PeerStatus {
        self.peers.get(peer).cloned().unwrap_or_default()
    }

    /// Available if materialized locally; unavailable if every known peer
    /// failed; loading while any peer is pending.
    pub fn high_level_state(&self) -> HighLevelState {
        if self.core.is_some() {
            return HighLevelState::Available;
        }
        if !self.peers.is_empty()
            && self
                .peers
                .values()
                .all(|s| matches!(s, PeerStatus::Unavailable | PeerStatus::Errored(_)))
        {
            return HighLevelState::Unavailable;
        }
        if self.peers.values().any(|s| *s == PeerStatus::Pending) {
            return HighLevelState::Loading;
        }
        HighLevelState::Unknown
    }

    pub fn subscribe(&self) -> watch::Receiver<StateSnapshot> {
        self.notify.subscribe()
    }

    /// Start a load from `peer`. Returns the token that cancels its wait.
    pub fn mark_pending(&mut self, peer: &PeerID) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self.load_tokens.insert(peer.clone(), token.clone()) {
            previous.cancel();
        }
        self.set_peer(peer, PeerStatus::Pending);
        token
    }

    /// The value is now materialized locally. Outstanding loads are
    /// cancelled. Content already held is kept.
    pub fn mark_available(&mut self, core: CoValueCore, from: Option<&PeerID>) {
        if self.core.is_none() {
            self.core = Some(core);
        }
        for (_, token) in self.load_tokens.drain() {
            token.cancel();
        }
        match from {
            Some(peer) => self.set_peer(peer, PeerStatus::Available),
            None => self.notify_changed(),
        }
    }

    /// `peer` has (at least) what we have.
    pub fn mark_peer_available(&mut self, peer: &PeerID) {
        self.settle(peer, PeerStatus::Available);
    }

    /// `peer` answered that it does not have the value.
    pub fn mark_not_found_in_peer(&mut self, peer: &PeerID) {
        self.settle(peer, PeerStatus::Unavailable);
    }

    /// Loading from `peer` failed.
    pub fn mark_errored(&mut self, peer: &PeerID, error: impl Into<String>) {
        self.settle(peer, PeerStatus::Errored(error.into()));
    }

    /// The connection to `peer` closed. A load still waiting on it is
    /// unavailable.
    pub fn mark_peer_closed(&mut self, peer: &PeerID) {
        if !self.peer_status(peer).is_settled() && self.peers.contains_key(peer) {
            self.settle(peer, PeerStatus::Unavailable);
        }
    }

    fn settle(&mut self, peer: &PeerID, status: PeerStatus) {
        if let Some(token) = self.load_tokens.remove(peer) {
            token.cancel();
        }
        self.set_peer(peer, status);
    }

    fn set_peer(&mut self, peer: &PeerID, status: PeerStatus) {
        debug!(id = %self.id, peer = %peer, status = ?status, "peer status");
        self.peers.insert(peer.clone(), status);
        self.notify_changed();
    }

    /// Recount and publish the current snapshot.
    pub fn notify_changed(&mut self) {
        let state = self.high_level_state();
        if state != self.counted {
            debug!(id = %self.id, from = self.counted.as_str(), to = state.as_str(), "state transition");
            self.counters.leave(self.counted);
            self.counters.enter(state);
            self.counted = state;
        }
        self.notify.send_replace(StateSnapshot {
            state,
            peers: self.peers.clone(),
            known: self.core.as_ref().map(|core| core.known_state().clone()),
        });
    }
}

impl Drop for CoValueState {
    fn drop(&mut self) {
        self.counters.leave(self.counted);
        for (_, token) in self.load_tokens.drain() {
            token.cancel();
        }
    }
}
