//! Store trait: the abstract interface for CoValue persistence.
//!
//! The node and the pipeline are storage-agnostic. Implementations are SQLite
//! (primary) and in-memory (for tests).

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::debug;

use coweave_core::{
    AppendError, CoValueCore, CoValueHeader, KnownState, RawCoID, SessionID, SessionLog, Signature,
    Transaction, Verification,
};

use crate::error::{Result, StoreError};

/// What a store knows about a CoValue without reading its transactions.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMetadata {
    pub header: CoValueHeader,
    pub known_state: KnownState,
}

/// A range of one session's transactions with the signatures inside it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredTransactions {
    pub transactions: Vec<Transaction>,
    /// Index of the last covered transaction -> signature.
    pub signatures: BTreeMap<u32, Signature>,
}

/// New transactions of one session, as handed to [`Store::write`].
#[derive(Debug, Clone, PartialEq)]
pub struct SessionWrite {
    pub session_id: SessionID,
    /// Index of the first transaction in `transactions`.
    pub after: u32,
    pub transactions: Vec<Transaction>,
    /// Index of the last covered transaction -> signature.
    pub signatures: BTreeMap<u32, Signature>,
}

impl SessionWrite {
    /// Everything a log holds from index `after` on.
    ///
    /// Checkpoints are carried as stored, and the signature over the whole
    /// log is recorded at its last index.
    pub fn since(log: &SessionLog, after: u32) -> Self {
        let mut signatures: BTreeMap<u32, Signature> = log
            .signature_after()
            .range(after..)
            .map(|(idx, sig)| (*idx, *sig))
            .collect();
        if let (Some(last), Some(sig)) = (log.len().checked_sub(1), log.last_signature()) {
            if last >= after {
                signatures.insert(last, *sig);
            }
        }
        Self {
            session_id: log.session_id().clone(),
            after,
            transactions: log.transactions().iter().skip(after as usize).cloned().collect(),
            signatures,
        }
    }

    /// Index one past the last transaction.
    pub fn end(&self) -> u32 {
        self.after + self.transactions.len() as u32
    }
}

/// Result of a write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Whether the header was stored by this write.
    pub created: bool,
    /// Transactions that were new to the store.
    pub appended: u32,
}

/// The Store trait: async interface for CoValue persistence.
///
/// All methods are async to support both sync (SQLite) and async backends.
/// For SQLite, `spawn_blocking` keeps queries off the runtime.
///
/// # Design Notes
///
/// - **Append-only**: sessions only grow. Rewriting stored transactions is
///   idempotent; a different transaction at a stored index is a `Conflict`.
/// - **Contiguous**: a session write starting past the stored end is
///   rejected with `NonContiguous`.
#[async_trait]
pub trait Store: Send + Sync {
    /// Header and per-session counts, or `None` if the value is unknown.
    async fn load_metadata(&self, id: &RawCoID) -> Result<Option<StoredMetadata>>;

    /// Transactions `from..to` of one session, ordered by index.
    ///
    /// Indices beyond what is stored are simply absent from the result.
    async fn load_transactions(
        &self,
        id: &RawCoID,
        session: &SessionID,
        from: u32,
        to: u32,
    ) -> Result<StoredTransactions>;

    /// Persist the header (if new) and appended session content.
    async fn write(
        &self,
        id: &RawCoID,
        header: &CoValueHeader,
        sessions: &[SessionWrite],
    ) -> Result<WriteOutcome>;
}

/// A CoValue's complete stored content.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredValue {
    pub id: RawCoID,
    pub header: CoValueHeader,
    pub sessions: BTreeMap<SessionID, StoredTransactions>,
}

impl StoredValue {
    /// Rebuild a CoValueCore by replaying the stored runs.
    ///
    /// Runs are replayed in index order, each ending at a stored signature;
    /// trailing transactions without a signature are not restored.
    pub fn into_core(self, verification: Verification<'_>) -> Result<CoValueCore> {
        let id = self.id;
        let mut core =
            CoValueCore::from_header_for(id, self.header).map_err(|_| StoreError::HeaderMismatch(id))?;

        for (session, stored) in self.sessions {
            let mut start = 0u32;
            for (&idx, sig) in &stored.signatures {
                let run: Vec<Transaction> = stored
                    .transactions
                    .get(start as usize..=idx as usize)
                    .map(<[Transaction]>::to_vec)
                    .ok_or_else(|| StoreError::InvalidData(format!("signature past end of {}", session)))?;
                core.append(&session, run, None, *sig, verification)
                    .map_err(|e| invalid_run(&id, &session, e))?;
                start = idx + 1;
            }
            if (start as usize) < stored.transactions.len() {
                debug!(id = %id, session = %session, from = start, "dropping unsigned stored tail");
            }
        }

        Ok(core)
    }
}

/// Read a CoValue's header and all of its sessions.
pub async fn load_value<S: Store + ?Sized>(store: &S, id: &RawCoID) -> Result<Option<StoredValue>> {
    let Some(metadata) = store.load_metadata(id).await? else {
        return Ok(None);
    };
    let mut sessions = BTreeMap::new();
    for (session, count) in &metadata.known_state.sessions {
        let stored = store.load_transactions(id, session, 0, *count).await?;
        sessions.insert(session.clone(), stored);
    }
    Ok(Some(StoredValue {
        id: *id,
        header: metadata.header,
        sessions,
    }))
}

/// Session writes that bring a store holding `stored` up to `core`.
pub fn pending_writes(core: &CoValueCore, stored: Option<&KnownState>) -> Vec<SessionWrite> {
    core.sessions()
        .filter_map(|log| {
            let have = stored.map_or(0, |k| k.count(log.session_id()));
            (log.len() > have).then(|| SessionWrite::since(log, have))
        })
        .collect()
}

/// Write everything in `core` the store does not have yet.
pub async fn store_core<S: Store + ?Sized>(store: &S, core: &CoValueCore) -> Result<WriteOutcome> {
    let stored = store.load_metadata(&core.id()).await?;
    let sessions = pending_writes(core, stored.as_ref().map(|m| &m.known_state));
    if stored.is_some() && sessions.is_empty() {
        return Ok(WriteOutcome::default());
    }
    store.write(&core.id(), core.header(), &sessions).await
}

fn invalid_run(id: &RawCoID, session: &SessionID, e: AppendError) -> StoreError {
    StoreError::InvalidData(format!("stored run of {} in {} rejected: {}", session, id, e))
}

/// Check a write against what is stored: the session's stored count.
///
/// Returns the number of leading transactions already stored.
pub(crate) fn overlap(id: &RawCoID, write: &SessionWrite, have: u32) -> Result<u32> {
    if write.after > have {
        return Err(StoreError::NonContiguous {
            id: *id,
            session: write.session_id.clone(),
            after: write.after,
            have,
        });
    }
    Ok((have - write.after).min(write.transactions.len() as u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use coweave_core::{ActorID, AgentSecret, CoValueType, NoAccounts, Ruleset};
    use serde_json::json;

    fn written(count: u64) -> (CoValueCore, AgentSecret, SessionID) {
        let agent = AgentSecret::from_seed(&[9; 32]);
        let session = SessionID::new(&ActorID::Agent(agent.agent_id()), [1; 8]);
        let header = CoValueHeader::new(CoValueType::Comap, Ruleset::UnsafeAllowAll).with_uniqueness(json!("traits"));
        let mut core = CoValueCore::new(header);
        for made_at in 0..count {
            core.append_signed(&session, vec![Transaction::trusting(made_at, "[]")], &agent.signer)
                .unwrap();
        }
        (core, agent, session)
    }

    #[test]
    fn test_session_write_since_ends_signed() {
        let (core, _, session) = written(5);
        let log = core.session(&session).unwrap();

        let write = SessionWrite::since(log, 3);
        assert_eq!(write.after, 3);
        assert_eq!(write.end(), 5);
        assert_eq!(write.transactions, log.transactions()[3..].to_vec());
        assert_eq!(write.signatures.get(&4), log.last_signature());
    }

    #[tokio::test]
    async fn test_store_core_appends_only_new() {
        let store = MemoryStore::new();
        let (mut core, agent, session) = written(3);

        let first = store_core(&store, &core).await.unwrap();
        assert!(first.created);
        assert_eq!(first.appended, 3);
        assert_eq!(store_core(&store, &core).await.unwrap(), WriteOutcome::default());

        core.append_signed(&session, vec![Transaction::trusting(3, "[]")], &agent.signer)
            .unwrap();
        let second = store_core(&store, &core).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.appended, 1);

        let stored = load_value(&store, &core.id()).await.unwrap().unwrap();
        let loaded = stored.into_core(Verification::Verify(&NoAccounts)).unwrap();
        assert_eq!(loaded.known_state(), core.known_state());
        assert_eq!(loaded.session_hash(&session), core.session_hash(&session));
    }

    #[test]
    fn test_pending_writes_start_at_stored_count() {
        let (core, _, session) = written(4);
        let all = pending_writes(&core, None);
        assert_eq!(all.len(), 1);
        assert_eq!((all[0].after, all[0].end()), (0, 4));

        let mut stored = KnownState::empty(core.id());
        stored.header = true;
        stored.update_session(&session, 3);
        let rest = pending_writes(&core, Some(&stored));
        assert_eq!((rest[0].after, rest[0].transactions.len()), (3, 1));
        assert!(pending_writes(&core, Some(core.known_state())).is_empty());
    }
}
