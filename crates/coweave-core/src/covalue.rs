//! CoValueCore: all sessions of one CoValue.
//!
//! Owns the header and session logs, verifies incoming transactions against
//! the hash chain and the session's signer, and answers "what is new since
//! state X" for sync. Derived state (known state, the fresh-subscribe diff)
//! is cached and dropped on every append.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use tracing::{debug, warn};

use crate::content::{new_content_since, ContentChunk, SessionView};
use crate::crypto::{AgentID, Hash, Signature, SignerSecret};
use crate::error::{AppendError, ResolveAccountAgentError};
use crate::header::CoValueHeader;
use crate::known_state::KnownState;
use crate::session_log::{PreparedAppend, SessionLog};
use crate::transaction::Transaction;
use crate::types::{ActorID, RawCoID, SessionID, TransactionID};

/// Looks up the agent behind an account, so account sessions can be verified.
pub trait SignerResolver {
    fn resolve_account_agent(&self, account: &RawCoID) -> Result<AgentID, ResolveAccountAgentError>;
}

/// Resolver for contexts without any loaded accounts.
///
/// Agent sessions still verify; account sessions fail with `AccountNotLoaded`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAccounts;

impl SignerResolver for NoAccounts {
    fn resolve_account_agent(&self, account: &RawCoID) -> Result<AgentID, ResolveAccountAgentError> {
        Err(ResolveAccountAgentError::AccountNotLoaded(*account))
    }
}

/// How an append is checked.
#[derive(Clone, Copy)]
pub enum Verification<'a> {
    /// Trusted local write: the chain is extended but not signature-checked.
    Skip,
    /// Verify against the signer resolved from the session's actor.
    Verify(&'a dyn SignerResolver),
}

/// Resolve the agent that signs for a session.
pub fn session_agent(
    session: &SessionID,
    resolver: &dyn SignerResolver,
) -> Result<AgentID, ResolveAccountAgentError> {
    match session
        .actor()
        .map_err(|_| ResolveAccountAgentError::MalformedSession(session.to_string()))?
    {
        ActorID::Agent(agent) => Ok(agent),
        ActorID::Account(account) => resolver.resolve_account_agent(&account),
    }
}

/// Result of ingesting a content chunk.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    /// Sessions that gained verified transactions.
    pub appended: Vec<SessionID>,
    /// Sessions whose new transactions are held until a signature arrives.
    pub buffered: Vec<SessionID>,
}

impl IngestOutcome {
    pub fn changed(&self) -> bool {
        !self.appended.is_empty()
    }
}

/// All sessions of one CoValue.
#[derive(Debug)]
pub struct CoValueCore {
    id: RawCoID,
    header: CoValueHeader,
    sessions: BTreeMap<SessionID, SessionLog>,
    /// Received transactions not yet covered by a signature, per session.
    pending_tails: BTreeMap<SessionID, Vec<Transaction>>,
    known_state: OnceLock<KnownState>,
    fresh_content: OnceLock<Option<Vec<ContentChunk>>>,
}

impl Clone for CoValueCore {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            header: self.header.clone(),
            sessions: self.sessions.clone(),
            pending_tails: self.pending_tails.clone(),
            known_state: OnceLock::new(),
            fresh_content: OnceLock::new(),
        }
    }
}

impl CoValueCore {
    /// Create an empty CoValue from its header.
    pub fn new(header: CoValueHeader) -> Self {
        Self {
            id: header.id(),
            header,
            sessions: BTreeMap::new(),
            pending_tails: BTreeMap::new(),
            known_state: OnceLock::new(),
            fresh_content: OnceLock::new(),
        }
    }

    /// Create from a header that must hash to `id`.
    pub fn from_header_for(id: RawCoID, header: CoValueHeader) -> Result<Self, AppendError> {
        if header.id() != id {
            return Err(AppendError::HeaderMismatch(id));
        }
        Ok(Self::new(header))
    }

    pub fn id(&self) -> RawCoID {
        self.id
    }

    pub fn header(&self) -> &CoValueHeader {
        &self.header
    }

    /// Session logs in session order.
    pub fn sessions(&self) -> impl Iterator<Item = &SessionLog> {
        self.sessions.values()
    }

    pub fn session(&self, session: &SessionID) -> Option<&SessionLog> {
        self.sessions.get(session)
    }

    /// Transactions held back waiting for a signature.
    pub fn pending_tail(&self, session: &SessionID) -> &[Transaction] {
        self.pending_tails
            .get(session)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every verified transaction with its id, session by session.
    pub fn transactions(&self) -> impl Iterator<Item = (TransactionID, &Transaction)> {
        self.sessions.iter().flat_map(|(session, log)| {
            log.transactions().iter().enumerate().map(move |(i, tx)| {
                (
                    TransactionID {
                        session_id: session.clone(),
                        tx_index: i as u32,
                    },
                    tx,
                )
            })
        })
    }

    /// Look up one transaction.
    pub fn transaction(&self, id: &TransactionID) -> Option<&Transaction> {
        self.sessions
            .get(&id.session_id)
            .and_then(|log| log.transactions().get(id.tx_index as usize))
    }

    fn invalidate(&mut self) {
        self.known_state = OnceLock::new();
        self.fresh_content = OnceLock::new();
    }

    /// Append transactions to a session.
    ///
    /// Fails with `InvalidHash` if `claimed_hash` disagrees with the extended
    /// chain, and with `InvalidSignature` if verification is requested and the
    /// signature does not match the session's signer. A failed append leaves
    /// the CoValue untouched.
    pub fn append(
        &mut self,
        session: &SessionID,
        transactions: Vec<Transaction>,
        claimed_hash: Option<&Hash>,
        signature: Signature,
        verification: Verification<'_>,
    ) -> Result<Hash, AppendError> {
        let prepared = self.prepare(session, transactions, claimed_hash, signature, verification)?;
        let mut hashes = self.commit(vec![prepared])?;
        Ok(hashes.pop().unwrap_or_else(|| self.session_hash(session)))
    }

    /// Sign and append as the local writer. Returns the new chain hash.
    pub fn append_signed(
        &mut self,
        session: &SessionID,
        transactions: Vec<Transaction>,
        signer: &SignerSecret,
    ) -> Result<Hash, AppendError> {
        let hash = self.expected_hash_after(session, &transactions);
        let signature = signer.sign(&hash);
        self.append(session, transactions, Some(&hash), signature, Verification::Skip)
    }

    /// The chain hash a session would have after appending `transactions`.
    pub fn expected_hash_after(&self, session: &SessionID, transactions: &[Transaction]) -> Hash {
        match self.sessions.get(session) {
            Some(log) => log.expected_hash_after(transactions),
            None => SessionLog::new(session.clone()).expected_hash_after(transactions),
        }
    }

    /// Current chain hash of a session.
    pub fn session_hash(&self, session: &SessionID) -> Hash {
        self.expected_hash_after(session, &[])
    }

    fn prepare(
        &self,
        session: &SessionID,
        transactions: Vec<Transaction>,
        claimed_hash: Option<&Hash>,
        signature: Signature,
        verification: Verification<'_>,
    ) -> Result<PreparedAppend, AppendError> {
        let signer = match verification {
            Verification::Skip => None,
            Verification::Verify(resolver) => Some(session_agent(session, resolver)?.signer),
        };

        let empty;
        let log = match self.sessions.get(session) {
            Some(log) => log,
            None => {
                empty = SessionLog::new(session.clone());
                &empty
            }
        };
        log.prepare(transactions, claimed_hash, signature, signer.as_ref())
    }

    fn commit(&mut self, prepared: Vec<PreparedAppend>) -> Result<Vec<Hash>, AppendError> {
        let mut hashes = Vec::with_capacity(prepared.len());
        for batch in prepared {
            let session = batch.session_id().clone();
            let log = self
                .sessions
                .entry(session.clone())
                .or_insert_with(|| SessionLog::new(session));
            hashes.push(log.commit(batch)?);
        }
        self.invalidate();
        Ok(hashes)
    }

    /// `{id, header: true, sessions: {session -> count}}`. Cached.
    pub fn known_state(&self) -> &KnownState {
        self.known_state.get_or_init(|| KnownState {
            id: self.id,
            header: true,
            sessions: self
                .sessions
                .iter()
                .map(|(session, log)| (session.clone(), log.len()))
                .collect(),
        })
    }

    /// Chunks a peer at `known` is missing, or `None` if it is up to date.
    ///
    /// The result for an empty or absent known state is memoized.
    pub fn new_content_since(&self, known: Option<&KnownState>) -> Option<Vec<ContentChunk>> {
        let fresh = known.map_or(true, KnownState::is_empty);
        if fresh {
            return self
                .fresh_content
                .get_or_init(|| self.compute_content(None))
                .clone();
        }
        self.compute_content(known)
    }

    fn compute_content(&self, known: Option<&KnownState>) -> Option<Vec<ContentChunk>> {
        let views: Vec<SessionView<'_>> = self
            .sessions
            .iter()
            .map(|(session, log)| SessionView {
                session_id: session,
                transactions: log.transactions(),
                signature_after: log.signature_after(),
                last_signature: log.last_signature(),
            })
            .collect();
        new_content_since(self.id, &self.header, &views, known)
    }

    /// Apply a received chunk.
    ///
    /// Segments overlapping what is already held are trimmed. A segment
    /// without a signature is buffered and verified together with the next
    /// signed segment of that session. All signed segments are checked before
    /// any is committed, so a chunk is accepted or rejected as a whole.
    pub fn ingest(
        &mut self,
        chunk: &ContentChunk,
        resolver: &dyn SignerResolver,
    ) -> Result<IngestOutcome, AppendError> {
        let mut prepared = Vec::new();
        let mut new_tails = Vec::new();
        let mut outcome = IngestOutcome::default();

        for (session, segment) in &chunk.new {
            let have = self.sessions.get(session).map_or(0, SessionLog::len);
            let mut batch: Vec<Transaction> = self.pending_tail(session).to_vec();
            let tail_len = batch.len();
            let held = have + tail_len as u32;

            if segment.after > held {
                debug!(id = %self.id, session = %session, after = segment.after, held, "gap in content");
                return Err(AppendError::NonContiguous {
                    session: session.clone(),
                    after: segment.after,
                    have: held,
                });
            }

            if segment.end() < held {
                if segment.last_signature.is_some() && segment.end() > have {
                    debug!(
                        id = %self.id,
                        session = %session,
                        end = segment.end(),
                        held,
                        "signature inside the unsigned tail dropped"
                    );
                }
                continue;
            }
            let skip = (held - segment.after) as usize;
            batch.extend(segment.transactions.iter().skip(skip).cloned());

            match segment.last_signature {
                Some(signature) if !batch.is_empty() => {
                    let result = self.prepare(
                        session,
                        batch,
                        None,
                        signature,
                        Verification::Verify(resolver),
                    );
                    match result {
                        Ok(batch) => {
                            prepared.push(batch);
                            outcome.appended.push(session.clone());
                        }
                        Err(err) => {
                            warn!(id = %self.id, session = %session, error = %err, "rejected content");
                            self.pending_tails.remove(session);
                            return Err(err);
                        }
                    }
                }
                Some(_) => {}
                None => {
                    if batch.len() > tail_len {
                        new_tails.push((session.clone(), batch));
                        outcome.buffered.push(session.clone());
                    }
                }
            }
        }

        for batch in &prepared {
            self.pending_tails.remove(batch.session_id());
        }
        for (session, tail) in new_tails {
            self.pending_tails.insert(session, tail);
        }
        if !prepared.is_empty() {
            self.commit(prepared)?;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AgentSecret;
    use crate::header::{CoValueType, Ruleset};
    use serde_json::json;

    fn setup() -> (AgentSecret, SessionID, CoValueCore) {
        let agent = AgentSecret::from_seed(&[1; 32]);
        let session = SessionID::new(&ActorID::Agent(agent.agent_id()), [0; 8]);
        let header = CoValueHeader::new(CoValueType::Comap, Ruleset::UnsafeAllowAll)
            .with_uniqueness(json!("test"));
        (agent, session, CoValueCore::new(header))
    }

    fn big(i: u64, kb: usize) -> Transaction {
        Transaction::trusting(i, "x".repeat(kb * 1024))
    }

    #[test]
    fn test_known_state_tracks_appends() {
        let (agent, session, mut core) = setup();
        assert!(core.known_state().sessions.is_empty());
        core.append_signed(&session, vec![Transaction::trusting(1, "[]")], &agent.signer)
            .unwrap();
        assert_eq!(core.known_state().count(&session), 1);
        core.append_signed(&session, vec![Transaction::trusting(2, "[]")], &agent.signer)
            .unwrap();
        assert_eq!(core.known_state().count(&session), 2);
    }

    #[test]
    fn test_verified_append_rejects_forged_signature() {
        let (agent, session, mut core) = setup();
        let forger = AgentSecret::from_seed(&[2; 32]);
        let txs = vec![Transaction::trusting(1, "[]")];
        let hash = core.expected_hash_after(&session, &txs);
        let err = core
            .append(
                &session,
                txs.clone(),
                Some(&hash),
                forger.signer.sign(&hash),
                Verification::Verify(&NoAccounts),
            )
            .unwrap_err();
        assert!(matches!(err, AppendError::InvalidSignature { .. }));
        assert!(core.session(&session).is_none());

        core.append(
            &session,
            txs,
            Some(&hash),
            agent.signer.sign(&hash),
            Verification::Verify(&NoAccounts),
        )
        .unwrap();
    }

    #[test]
    fn test_account_session_needs_resolver() {
        let (agent, _, mut core) = setup();
        let session = SessionID::new(&ActorID::Account(RawCoID([9; 20])), [0; 8]);
        let txs = vec![Transaction::trusting(1, "[]")];
        let hash = core.expected_hash_after(&session, &txs);
        let err = core
            .append(
                &session,
                txs,
                None,
                agent.signer.sign(&hash),
                Verification::Verify(&NoAccounts),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            AppendError::ResolveAccountAgent(ResolveAccountAgentError::AccountNotLoaded(_))
        ));
    }

    #[test]
    fn test_fresh_content_is_memoized_and_invalidated() {
        let (agent, session, mut core) = setup();
        core.append_signed(&session, vec![Transaction::trusting(1, "[]")], &agent.signer)
            .unwrap();
        let first = core.new_content_since(None).unwrap();
        assert_eq!(core.new_content_since(None).unwrap(), first);

        core.append_signed(&session, vec![Transaction::trusting(2, "[]")], &agent.signer)
            .unwrap();
        let second = core.new_content_since(None).unwrap();
        assert_eq!(second[0].new[&session].transactions.len(), 2);
    }

    #[test]
    fn test_up_to_date_peer_gets_nothing() {
        let (agent, session, mut core) = setup();
        core.append_signed(&session, vec![Transaction::trusting(1, "[]")], &agent.signer)
            .unwrap();
        let known = core.known_state().clone();
        assert!(core.new_content_since(Some(&known)).is_none());
    }

    #[test]
    fn test_ingest_buffers_unsigned_tail_until_signature() {
        let (agent, session, mut source) = setup();
        let batch: Vec<_> = (0..5).map(|i| big(i, 40)).collect();
        source.append_signed(&session, batch, &agent.signer).unwrap();

        let chunks = source.new_content_since(None).unwrap();
        assert_eq!(chunks.len(), 2);

        let mut replica = CoValueCore::new(source.header().clone());
        let outcome = replica.ingest(&chunks[0], &NoAccounts).unwrap();
        assert_eq!(outcome.buffered, vec![session.clone()]);
        assert!(replica.session(&session).is_none());
        assert_eq!(replica.pending_tail(&session).len(), 3);

        let outcome = replica.ingest(&chunks[1], &NoAccounts).unwrap();
        assert_eq!(outcome.appended, vec![session.clone()]);
        assert!(replica.pending_tail(&session).is_empty());
        assert_eq!(replica.known_state(), source.known_state());
        assert_eq!(replica.session_hash(&session), source.session_hash(&session));
    }

    #[test]
    fn test_signature_inside_tail_is_dropped() {
        let (agent, session, mut source) = setup();
        let batch: Vec<_> = (0..5).map(|i| big(i, 40)).collect();
        source.append_signed(&session, batch, &agent.signer).unwrap();
        let chunks = source.new_content_since(None).unwrap();

        let mut replica = CoValueCore::new(source.header().clone());
        replica.ingest(&chunks[0], &NoAccounts).unwrap();
        assert_eq!(replica.pending_tail(&session).len(), 3);

        let mut inside = chunks[0].clone();
        if let Some(segment) = inside.new.get_mut(&session) {
            segment.transactions.truncate(2);
            segment.last_signature = chunks[1].new[&session].last_signature;
        }
        let outcome = replica.ingest(&inside, &NoAccounts).unwrap();
        assert!(!outcome.changed());
        assert!(replica.session(&session).is_none());
        assert_eq!(replica.pending_tail(&session).len(), 3);

        replica.ingest(&chunks[1], &NoAccounts).unwrap();
        assert_eq!(replica.known_state(), source.known_state());
    }

    #[test]
    fn test_ingest_is_idempotent_and_rejects_gaps() {
        let (agent, session, mut source) = setup();
        for i in 0..3 {
            source
                .append_signed(&session, vec![Transaction::trusting(i, "[]")], &agent.signer)
                .unwrap();
        }
        let chunks = source.new_content_since(None).unwrap();
        let mut replica = CoValueCore::new(source.header().clone());
        replica.ingest(&chunks[0], &NoAccounts).unwrap();
        let again = replica.ingest(&chunks[0], &NoAccounts).unwrap();
        assert!(!again.changed());
        assert_eq!(replica.known_state(), source.known_state());

        let mut gap = chunks[0].clone();
        if let Some(segment) = gap.new.get_mut(&session) {
            segment.after = 10;
        }
        assert!(matches!(
            replica.ingest(&gap, &NoAccounts),
            Err(AppendError::NonContiguous { .. })
        ));
    }

    #[test]
    fn test_ingest_rejects_tampered_chunk_whole() {
        let (agent, session, mut source) = setup();
        let other = AgentSecret::from_seed(&[3; 32]);
        let other_session = SessionID::new(&ActorID::Agent(other.agent_id()), [0; 8]);
        source
            .append_signed(&session, vec![Transaction::trusting(1, "[1]")], &agent.signer)
            .unwrap();
        source
            .append_signed(&other_session, vec![Transaction::trusting(2, "[2]")], &other.signer)
            .unwrap();

        let mut chunk = source.new_content_since(None).unwrap().remove(0);
        if let Some(segment) = chunk.new.get_mut(&other_session) {
            segment.transactions[0] = Transaction::trusting(2, "[3]");
        }

        let mut replica = CoValueCore::new(source.header().clone());
        assert!(replica.ingest(&chunk, &NoAccounts).is_err());
        assert!(replica.sessions().next().is_none());
    }

    #[test]
    fn test_header_mismatch() {
        let (_, _, core) = setup();
        assert!(CoValueCore::from_header_for(RawCoID([0; 20]), core.header().clone()).is_err());
        assert!(CoValueCore::from_header_for(core.id(), core.header().clone()).is_ok());
    }
}
