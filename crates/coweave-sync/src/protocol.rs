//! Per-peer replication bookkeeping and message handling.
//!
//! Nothing here does I/O. Handlers take the local state of one CoValue and
//! an inbound message and return the messages to send back; the caller owns
//! the transport.
//!
//! ## Message Flow
//!
//! ```text
//! Node A                              Node B
//!   |-------- Load {known} ----------->|
//!   |<------- Content {chunk} ---------|   (one per chunk)
//!   |-------- Known {known} ---------->|   (ack after ingest)
//!   |                                  |
//!   |-------- Load {known} ----------->|   (value unknown to B)
//!   |<------- Known {header: false} ---|
//! ```

use std::collections::HashMap;

use tracing::debug;

use coweave_core::{
    AppendError, CoValueCore, ContentChunk, IngestOutcome, KnownState, RawCoID, SignerResolver,
};

use crate::messages::{PeerID, SyncMessage};
use crate::peer::Peer;

/// What we believe one peer holds, per CoValue.
///
/// `confirmed` is what the peer told us. `optimistic` also counts content
/// we sent but the peer has not acknowledged yet, so it is never resent.
#[derive(Debug, Clone)]
pub struct PeerState {
    peer: Peer,
    confirmed: HashMap<RawCoID, KnownState>,
    optimistic: HashMap<RawCoID, KnownState>,
}

impl PeerState {
    pub fn new(peer: Peer) -> Self {
        Self {
            peer,
            confirmed: HashMap::new(),
            optimistic: HashMap::new(),
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn id(&self) -> &PeerID {
        &self.peer.id
    }

    pub fn confirmed(&self, id: &RawCoID) -> Option<&KnownState> {
        self.confirmed.get(id)
    }

    pub fn optimistic(&self, id: &RawCoID) -> Option<&KnownState> {
        self.optimistic.get(id)
    }

    /// Is the peer interested in this value at all?
    pub fn is_tracking(&self, id: &RawCoID) -> bool {
        self.optimistic.contains_key(id)
    }

    /// The peer reported its state, in a load or an ack.
    pub fn set_confirmed(&mut self, known: &KnownState) {
        self.confirmed
            .entry(known.id)
            .and_modify(|have| have.combine_with(known))
            .or_insert_with(|| known.clone());
        self.optimistic
            .entry(known.id)
            .and_modify(|have| have.combine_with(known))
            .or_insert_with(|| known.clone());
    }

    /// Count a chunk as delivered.
    pub fn record_sent(&mut self, chunk: &ContentChunk) {
        let known = self
            .optimistic
            .entry(chunk.id)
            .or_insert_with(|| KnownState::empty(chunk.id));
        if chunk.header.is_some() {
            known.header = true;
        }
        for (session, segment) in &chunk.new {
            known.update_session(session, segment.end());
        }
    }

    /// Content messages that bring the peer up to date with `core`, based on
    /// what it optimistically holds. Records them as sent.
    pub fn content_to_send(&mut self, core: &CoValueCore) -> Vec<SyncMessage> {
        let chunks = core
            .new_content_since(self.optimistic.get(&core.id()))
            .unwrap_or_default();
        chunks
            .into_iter()
            .map(|chunk| {
                self.record_sent(&chunk);
                SyncMessage::Content { chunk }
            })
            .collect()
    }

    /// Drop everything recorded about the peer.
    pub fn reset(&mut self) {
        self.confirmed.clear();
        self.optimistic.clear();
    }
}

/// Answer a load request.
///
/// Sends everything the requester lacks, or our known state when it lacks
/// nothing. A value we do not have gets `Known { header: false }`.
pub fn respond_to_load(core: Option<&CoValueCore>, their_known: &KnownState) -> Vec<SyncMessage> {
    let Some(core) = core else {
        return vec![SyncMessage::Known {
            known: KnownState::empty(their_known.id),
        }];
    };
    match core.new_content_since(Some(their_known)) {
        Some(chunks) => chunks
            .into_iter()
            .map(|chunk| SyncMessage::Content { chunk })
            .collect(),
        None => vec![SyncMessage::Known {
            known: core.known_state().clone(),
        }],
    }
}

/// Apply received content, creating the core from the chunk's header when
/// nothing is held locally yet.
pub fn apply_content(
    core: Option<&mut CoValueCore>,
    chunk: &ContentChunk,
    resolver: &dyn SignerResolver,
) -> Result<Applied, AppendError> {
    match core {
        Some(core) => Ok(Applied::Existing(core.ingest(chunk, resolver)?)),
        None => {
            let header = chunk
                .header
                .clone()
                .ok_or(AppendError::MissingHeader(chunk.id))?;
            let mut core = CoValueCore::from_header_for(chunk.id, header)?;
            let outcome = core.ingest(chunk, resolver)?;
            debug!(id = %chunk.id, sessions = outcome.appended.len(), "materialized from content");
            Ok(Applied::Created(core, outcome))
        }
    }
}

/// Result of [`apply_content`].
#[derive(Debug)]
pub enum Applied {
    /// Ingested into the existing core.
    Existing(IngestOutcome),
    /// First content for this value; the new core.
    Created(CoValueCore, IngestOutcome),
}

impl Applied {
    pub fn outcome(&self) -> &IngestOutcome {
        match self {
            Applied::Existing(outcome) | Applied::Created(_, outcome) => outcome,
        }
    }
}
