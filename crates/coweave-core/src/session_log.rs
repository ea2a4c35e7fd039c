//! SessionLog: one session's ordered transactions with hash chain and
//! checkpoint signatures.
//!
//! Appends are two-phase. [`SessionLog::prepare`] checks chain continuity and
//! the signature without touching the log, [`SessionLog::commit`] applies a
//! prepared batch. This lets a multi-session content chunk be accepted or
//! rejected as a whole.

use std::collections::BTreeMap;

use crate::crypto::{Hash, Signature, SignerID, StreamingHash};
use crate::error::AppendError;
use crate::transaction::{Transaction, MAX_RECOMMENDED_TX_SIZE};
use crate::types::SessionID;

/// Ordered transactions of one session.
#[derive(Debug, Clone)]
pub struct SessionLog {
    session_id: SessionID,
    transactions: Vec<Transaction>,
    streaming_hash: StreamingHash,
    /// Sparse: index of the last transaction covered -> signature.
    signature_after: BTreeMap<u32, Signature>,
    last_signature: Option<Signature>,
    bytes_since_checkpoint: usize,
}

/// A batch that passed verification and can be committed.
#[derive(Debug)]
pub struct PreparedAppend {
    session_id: SessionID,
    base_len: u32,
    transactions: Vec<Transaction>,
    streaming_hash: StreamingHash,
    signature: Signature,
}

impl PreparedAppend {
    /// The chain hash after the batch.
    pub fn hash(&self) -> Hash {
        self.streaming_hash.digest()
    }

    /// The session this batch belongs to.
    pub fn session_id(&self) -> &SessionID {
        &self.session_id
    }
}

impl SessionLog {
    /// An empty log.
    pub fn new(session_id: SessionID) -> Self {
        Self {
            session_id,
            transactions: Vec::new(),
            streaming_hash: StreamingHash::new(),
            signature_after: BTreeMap::new(),
            last_signature: None,
            bytes_since_checkpoint: 0,
        }
    }

    pub fn session_id(&self) -> &SessionID {
        &self.session_id
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn len(&self) -> u32 {
        self.transactions.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    /// Checkpoint signatures by covered index.
    pub fn signature_after(&self) -> &BTreeMap<u32, Signature> {
        &self.signature_after
    }

    /// Signature over the whole log.
    pub fn last_signature(&self) -> Option<&Signature> {
        self.last_signature.as_ref()
    }

    /// Chain hash over everything appended so far.
    pub fn hash(&self) -> Hash {
        self.streaming_hash.digest()
    }

    /// Bytes appended since the last checkpoint signature.
    pub fn bytes_since_checkpoint(&self) -> usize {
        self.bytes_since_checkpoint
    }

    /// The hash the log would have after appending `transactions`.
    pub fn expected_hash_after(&self, transactions: &[Transaction]) -> Hash {
        let mut hash = self.streaming_hash.clone();
        for tx in transactions {
            hash.update(tx);
        }
        hash.digest()
    }

    /// Recompute the chain hash over the first `count` transactions.
    pub fn hash_at(&self, count: u32) -> Hash {
        let mut hash = StreamingHash::new();
        for tx in self.transactions.iter().take(count as usize) {
            hash.update(tx);
        }
        hash.digest()
    }

    /// Check a batch against the chain and, when `signer` is given, its signature.
    ///
    /// `signer = None` is the trusted local-write path.
    pub fn prepare(
        &self,
        transactions: Vec<Transaction>,
        claimed_hash: Option<&Hash>,
        signature: Signature,
        signer: Option<&SignerID>,
    ) -> Result<PreparedAppend, AppendError> {
        let mut streaming_hash = self.streaming_hash.clone();
        for tx in &transactions {
            streaming_hash.update(tx);
        }
        let computed = streaming_hash.digest();

        if let Some(claimed) = claimed_hash {
            if *claimed != computed {
                return Err(AppendError::InvalidHash {
                    session: self.session_id.clone(),
                    claimed: *claimed,
                    computed,
                });
            }
        }

        if let Some(signer) = signer {
            signer
                .verify(&computed, &signature)
                .map_err(|_| AppendError::InvalidSignature {
                    session: self.session_id.clone(),
                })?;
        }

        Ok(PreparedAppend {
            session_id: self.session_id.clone(),
            base_len: self.len(),
            transactions,
            streaming_hash,
            signature,
        })
    }

    /// Apply a prepared batch. Returns the new chain hash.
    ///
    /// A batch prepared against a different log length is rejected.
    pub fn commit(&mut self, prepared: PreparedAppend) -> Result<Hash, AppendError> {
        if prepared.session_id != self.session_id || prepared.base_len != self.len() {
            return Err(AppendError::NonContiguous {
                session: self.session_id.clone(),
                after: prepared.base_len,
                have: self.len(),
            });
        }

        let added: usize = prepared.transactions.iter().map(Transaction::size).sum();
        self.transactions.extend(prepared.transactions);
        self.streaming_hash = prepared.streaming_hash;
        self.last_signature = Some(prepared.signature);
        self.bytes_since_checkpoint += added;

        if self.bytes_since_checkpoint > MAX_RECOMMENDED_TX_SIZE {
            if let Some(last) = self.len().checked_sub(1) {
                self.signature_after.insert(last, prepared.signature);
            }
            self.bytes_since_checkpoint = 0;
        }

        Ok(self.streaming_hash.digest())
    }

    /// Prepare and commit in one step.
    pub fn try_add(
        &mut self,
        transactions: Vec<Transaction>,
        claimed_hash: Option<&Hash>,
        signature: Signature,
        signer: Option<&SignerID>,
    ) -> Result<Hash, AppendError> {
        let prepared = self.prepare(transactions, claimed_hash, signature, signer)?;
        self.commit(prepared)
    }

    /// Split the log into signed runs: `(start, end_exclusive, signature)`.
    ///
    /// Each run ends at a checkpoint or at the log end, so replaying the runs
    /// through `try_add` rebuilds an identical log.
    pub fn signed_runs(&self) -> Vec<(u32, u32, Signature)> {
        let mut runs = Vec::new();
        let mut start = 0u32;
        for (&idx, sig) in &self.signature_after {
            runs.push((start, idx + 1, *sig));
            start = idx + 1;
        }
        if start < self.len() {
            if let Some(sig) = self.last_signature {
                runs.push((start, self.len(), sig));
            }
        }
        runs
    }
}
