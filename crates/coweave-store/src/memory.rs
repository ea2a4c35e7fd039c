//! In-memory implementation of the Store trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use coweave_core::{CoValueHeader, KnownState, RawCoID, SessionID, Signature, Transaction};

use crate::error::{Result, StoreError};
use crate::traits::{
    overlap, SessionWrite, Store, StoredMetadata, StoredTransactions, WriteOutcome,
};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<HashMap<RawCoID, StoredCoValue>>,
}

struct StoredCoValue {
    header: CoValueHeader,
    sessions: BTreeMap<SessionID, StoredSession>,
}

#[derive(Default)]
struct StoredSession {
    transactions: Vec<Transaction>,
    signatures: BTreeMap<u32, Signature>,
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored CoValues.
    pub fn len(&self) -> usize {
        self.inner.read().map_or(0, |inner| inner.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::LockPoisoned(e.to_string())
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_metadata(&self, id: &RawCoID) -> Result<Option<StoredMetadata>> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.get(id).map(|value| StoredMetadata {
            header: value.header.clone(),
            known_state: KnownState {
                id: *id,
                header: true,
                sessions: value
                    .sessions
                    .iter()
                    .map(|(session, stored)| (session.clone(), stored.transactions.len() as u32))
                    .collect(),
            },
        }))
    }

    async fn load_transactions(
        &self,
        id: &RawCoID,
        session: &SessionID,
        from: u32,
        to: u32,
    ) -> Result<StoredTransactions> {
        let inner = self.inner.read().map_err(poisoned)?;
        let Some(stored) = inner.get(id).and_then(|v| v.sessions.get(session)) else {
            return Ok(StoredTransactions::default());
        };
        if from >= to {
            return Ok(StoredTransactions::default());
        }
        let end = (to as usize).min(stored.transactions.len());
        let start = (from as usize).min(end);
        Ok(StoredTransactions {
            transactions: stored.transactions[start..end].to_vec(),
            signatures: stored
                .signatures
                .range(from..to)
                .map(|(idx, sig)| (*idx, *sig))
                .collect(),
        })
    }

    async fn write(
        &self,
        id: &RawCoID,
        header: &CoValueHeader,
        sessions: &[SessionWrite],
    ) -> Result<WriteOutcome> {
        if header.id() != *id {
            return Err(StoreError::HeaderMismatch(*id));
        }
        let mut inner = self.inner.write().map_err(poisoned)?;

        // Validate every session before mutating anything.
        let existing = inner.get(id);
        let mut skips = Vec::with_capacity(sessions.len());
        for write in sessions {
            let stored = existing.and_then(|v| v.sessions.get(&write.session_id));
            let have = stored.map_or(0, |s| s.transactions.len() as u32);
            let skip = overlap(id, write, have)?;
            if let Some(stored) = stored {
                for i in 0..skip {
                    let index = write.after + i;
                    if stored.transactions.get(index as usize) != write.transactions.get(i as usize) {
                        return Err(StoreError::Conflict {
                            id: *id,
                            session: write.session_id.clone(),
                            index,
                        });
                    }
                }
            }
            skips.push(skip);
        }

        let mut outcome = WriteOutcome::default();
        let value = inner.entry(*id).or_insert_with(|| {
            outcome.created = true;
            StoredCoValue {
                header: header.clone(),
                sessions: BTreeMap::new(),
            }
        });
        for (write, skip) in sessions.iter().zip(skips) {
            let stored = value.sessions.entry(write.session_id.clone()).or_default();
            let new = &write.transactions[skip as usize..];
            stored.transactions.extend_from_slice(new);
            stored.signatures.extend(write.signatures.iter().map(|(i, s)| (*i, *s)));
            outcome.appended += new.len() as u32;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{load_value, store_core};
    use coweave_core::{
        ActorID, AgentSecret, CoValueCore, CoValueType, Ruleset, Verification,
    };

    fn populated(n: u64) -> (AgentSecret, SessionID, CoValueCore) {
        let agent = AgentSecret::from_seed(&[4; 32]);
        let session = SessionID::new(&ActorID::Agent(agent.agent_id()), [0; 8]);
        let mut core = CoValueCore::new(CoValueHeader::new(CoValueType::Comap, Ruleset::UnsafeAllowAll));
        for i in 0..n {
            core.append_signed(&session, vec![Transaction::trusting(i, format!("[{}]", i))], &agent.signer)
                .unwrap();
        }
        (agent, session, core)
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        let (_, session, core) = populated(3);

        let outcome = store_core(&store, &core).await.unwrap();
        assert!(outcome.created);
        assert_eq!(outcome.appended, 3);

        let metadata = store.load_metadata(&core.id()).await.unwrap().unwrap();
        assert_eq!(&metadata.known_state, core.known_state());

        let loaded = load_value(&store, &core.id())
            .await
            .unwrap()
            .unwrap()
            .into_core(Verification::Skip)
            .unwrap();
        assert_eq!(loaded.session_hash(&session), core.session_hash(&session));
    }

    #[tokio::test]
    async fn test_memory_store_idempotent() {
        let store = MemoryStore::new();
        let (_, _, core) = populated(2);
        store_core(&store, &core).await.unwrap();

        let session = core.sessions().next().unwrap();
        let again = store
            .write(&core.id(), core.header(), &[SessionWrite::since(session, 0)])
            .await
            .unwrap();
        assert_eq!(again, WriteOutcome { created: false, appended: 0 });
    }

    #[tokio::test]
    async fn test_memory_store_rejects_gap() {
        let store = MemoryStore::new();
        let (_, _, core) = populated(3);
        let session = core.sessions().next().unwrap();
        let err = store
            .write(&core.id(), core.header(), &[SessionWrite::since(session, 2)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NonContiguous { after: 2, have: 0, .. }));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_range() {
        let store = MemoryStore::new();
        let (_, session, core) = populated(5);
        store_core(&store, &core).await.unwrap();

        let range = store.load_transactions(&core.id(), &session, 1, 3).await.unwrap();
        assert_eq!(range.transactions.len(), 2);
        assert_eq!(range.transactions[0], Transaction::trusting(1, "[1]"));

        let past_end = store.load_transactions(&core.id(), &session, 4, 10).await.unwrap();
        assert_eq!(past_end.transactions.len(), 1);
        assert_eq!(past_end.signatures.keys().copied().collect::<Vec<_>>(), vec![4]);
    }
}
