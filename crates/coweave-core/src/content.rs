//! Wire content chunks and the size-bounded sync diff.
//!
//! [`new_content_since`] turns local session logs and a peer's known state
//! into an ordered list of chunks. Every chunk stays near
//! [`MAX_RECOMMENDED_TX_SIZE`] so a single message cannot grow with the size
//! of the CoValue.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::crypto::Signature;
use crate::header::CoValueHeader;
use crate::known_state::KnownState;
use crate::transaction::{Transaction, MAX_RECOMMENDED_TX_SIZE};
use crate::types::{RawCoID, SessionID};

/// New transactions for one session, continuing after `after` transactions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionNewContent {
    pub after: u32,
    pub transactions: Vec<Transaction>,
    /// Signature over the chain hash at the segment's last transaction.
    /// Absent when the segment was split before a verifiable boundary.
    pub last_signature: Option<Signature>,
}

impl SessionNewContent {
    /// Count of transactions the sender has once this segment is applied.
    pub fn end(&self) -> u32 {
        self.after + self.transactions.len() as u32
    }
}

/// One bounded piece of a sync diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentChunk {
    pub id: RawCoID,
    pub header: Option<CoValueHeader>,
    pub new: BTreeMap<SessionID, SessionNewContent>,
}

impl ContentChunk {
    /// A chunk with no sessions.
    pub fn new(id: RawCoID, header: Option<CoValueHeader>) -> Self {
        Self {
            id,
            header,
            new: BTreeMap::new(),
        }
    }

    /// Check if the chunk carries nothing.
    pub fn is_empty(&self) -> bool {
        self.header.is_none() && self.new.values().all(|s| s.transactions.is_empty())
    }

    /// Sum of transaction sizes in the chunk.
    pub fn size(&self) -> usize {
        self.new
            .values()
            .flat_map(|s| s.transactions.iter())
            .map(Transaction::size)
            .sum()
    }
}

/// A borrowed view of one session, enough to diff it.
#[derive(Debug, Clone, Copy)]
pub struct SessionView<'a> {
    pub session_id: &'a SessionID,
    pub transactions: &'a [Transaction],
    pub signature_after: &'a BTreeMap<u32, Signature>,
    pub last_signature: Option<&'a Signature>,
}

impl<'a> SessionView<'a> {
    fn len(&self) -> u32 {
        self.transactions.len() as u32
    }

    /// Exclusive end of the run starting at `start`: one past the next
    /// checkpoint at or after `start`, or the log end.
    fn run_end(&self, start: u32) -> u32 {
        self.signature_after
            .range(start..)
            .next()
            .map(|(&idx, _)| idx + 1)
            .unwrap_or_else(|| self.len())
            .min(self.len())
    }

    /// Signature valid for the first `end` transactions, if one exists.
    fn signature_for(&self, end: u32) -> Option<Signature> {
        if end == self.len() {
            return self.last_signature.copied();
        }
        end.checked_sub(1)
            .and_then(|idx| self.signature_after.get(&idx))
            .copied()
    }
}

struct ChunkBuilder {
    id: RawCoID,
    chunks: Vec<ContentChunk>,
    current: ContentChunk,
    piece_size: usize,
}

impl ChunkBuilder {
    fn new(id: RawCoID, header: Option<CoValueHeader>) -> Self {
        Self {
            id,
            chunks: Vec::new(),
            current: ContentChunk::new(id, header),
            piece_size: 0,
        }
    }

    fn start_new_piece(&mut self) {
        let finished = std::mem::replace(&mut self.current, ContentChunk::new(self.id, None));
        if !finished.is_empty() {
            self.chunks.push(finished);
        }
        self.piece_size = 0;
    }

    fn push_tx(&mut self, session: &SessionID, index: u32, tx: &Transaction) {
        let segment = self
            .current
            .new
            .entry(session.clone())
            .or_insert_with(|| SessionNewContent {
                after: index,
                transactions: Vec::new(),
                last_signature: None,
            });
        segment.transactions.push(tx.clone());
        segment.last_signature = None;
        self.piece_size += tx.size();
    }

    fn sign_segment(&mut self, session: &SessionID, signature: Option<Signature>) {
        if let Some(segment) = self.current.new.get_mut(session) {
            segment.last_signature = signature;
        }
    }

    fn finish(mut self) -> Vec<ContentChunk> {
        self.start_new_piece();
        self.chunks
    }
}

/// Compute the chunks a peer at `known` is missing.
///
/// Sessions are visited round-robin one run at a time, where a run ends at
/// the next checkpoint or the log end. A run that would overflow a non-empty
/// chunk starts a new chunk. A run bigger than the threshold on its own is
/// split mid-run; the segment closed by such a split carries no signature.
///
/// Returns `None` when there is nothing to send.
pub fn new_content_since(
    id: RawCoID,
    header: &CoValueHeader,
    sessions: &[SessionView<'_>],
    known: Option<&KnownState>,
) -> Option<Vec<ContentChunk>> {
    let header_needed = known.map_or(true, |k| !k.header);
    let mut sent: Vec<u32> = sessions
        .iter()
        .map(|view| known.map_or(0, |k| k.count(view.session_id)))
        .collect();

    let mut builder = ChunkBuilder::new(id, header_needed.then(|| header.clone()));

    loop {
        let mut progressed = false;

        for (view, sent) in sessions.iter().zip(sent.iter_mut()) {
            let start = *sent;
            if start >= view.len() {
                continue;
            }
            let end = view.run_end(start);
            let run = &view.transactions[start as usize..end as usize];
            let run_size: usize = run.iter().map(Transaction::size).sum();

            if builder.piece_size > 0 && builder.piece_size + run_size > MAX_RECOMMENDED_TX_SIZE {
                builder.start_new_piece();
            }

            for (offset, tx) in run.iter().enumerate() {
                if builder.piece_size > MAX_RECOMMENDED_TX_SIZE {
                    builder.sign_segment(view.session_id, None);
                    builder.start_new_piece();
                }
                builder.push_tx(view.session_id, start + offset as u32, tx);
            }

            builder.sign_segment(view.session_id, view.signature_for(end));
            *sent = end;
            progressed = true;
        }

        if !progressed {
            break;
        }
    }

    let chunks = builder.finish();
    if chunks.is_empty() {
        None
    } else {
        Some(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Hash, SignerSecret};
    use crate::header::{CoValueType, Ruleset};
    use crate::types::ActorID;
    use serde_json::json;

    fn session(seed: u8) -> SessionID {
        let agent = crate::crypto::AgentSecret::from_seed(&[seed; 32]).agent_id();
        SessionID::new(&ActorID::Agent(agent), [seed; 8])
    }

    fn header() -> CoValueHeader {
        CoValueHeader::new(CoValueType::Comap, Ruleset::UnsafeAllowAll).with_uniqueness(json!(0))
    }

    fn sig(n: u8) -> Signature {
        SignerSecret::from_seed(&[n; 32]).sign(&Hash::of(&[n]))
    }

    #[test]
    fn test_nothing_to_send() {
        let h = header();
        let mut known = KnownState::empty(h.id());
        known.header = true;
        assert!(new_content_since(h.id(), &h, &[], Some(&known)).is_none());
    }

    #[test]
    fn test_header_only() {
        let h = header();
        let chunks = new_content_since(h.id(), &h, &[], None).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].header.as_ref(), Some(&h));
        assert!(chunks[0].new.is_empty());
    }

    #[test]
    fn test_small_sessions_share_a_chunk() {
        let h = header();
        let (s1, s2) = (session(1), session(2));
        let txs1 = vec![Transaction::trusting(1, "[1]")];
        let txs2 = vec![Transaction::trusting(2, "[2]"), Transaction::trusting(3, "[3]")];
        let no_checkpoints = BTreeMap::new();
        let (last1, last2) = (sig(1), sig(2));
        let views = [
            SessionView {
                session_id: &s1,
                transactions: &txs1,
                signature_after: &no_checkpoints,
                last_signature: Some(&last1),
            },
            SessionView {
                session_id: &s2,
                transactions: &txs2,
                signature_after: &no_checkpoints,
                last_signature: Some(&last2),
            },
        ];

        let chunks = new_content_since(h.id(), &h, &views, None).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].new[&s1].last_signature, Some(last1));
        assert_eq!(chunks[0].new[&s2].transactions.len(), 2);
        assert_eq!(chunks[0].new[&s2].after, 0);
    }

    #[test]
    fn test_split_at_checkpoint_and_resume_from_known() {
        let h = header();
        let s = session(1);
        let txs: Vec<_> = (0..4)
            .map(|i| Transaction::trusting(i, "x".repeat(60 * 1024)))
            .collect();
        let mut checkpoints = BTreeMap::new();
        checkpoints.insert(1, sig(10));
        checkpoints.insert(3, sig(11));
        let last = sig(11);
        let views = [SessionView {
            session_id: &s,
            transactions: &txs,
            signature_after: &checkpoints,
            last_signature: Some(&last),
        }];

        let chunks = new_content_since(h.id(), &h, &views, None).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].new[&s].last_signature, Some(sig(10)));
        assert_eq!(chunks[1].new[&s].after, 2);
        assert!(chunks[1].header.is_none());

        let mut known = KnownState::empty(h.id());
        known.header = true;
        known.update_session(&s, 3);
        let chunks = new_content_since(h.id(), &h, &views, Some(&known)).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].new[&s].after, 3);
        assert_eq!(chunks[0].new[&s].transactions.len(), 1);
    }

    #[test]
    fn test_oversized_run_splits_without_signature() {
        let h = header();
        let s = session(1);
        let txs: Vec<_> = (0..5)
            .map(|i| Transaction::trusting(i, "x".repeat(40 * 1024)))
            .collect();
        let mut checkpoints = BTreeMap::new();
        checkpoints.insert(4, sig(3));
        let last = sig(3);
        let views = [SessionView {
            session_id: &s,
            transactions: &txs,
            signature_after: &checkpoints,
            last_signature: Some(&last),
        }];

        let chunks = new_content_since(h.id(), &h, &views, None).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].new[&s].transactions.len(), 3);
        assert_eq!(chunks[0].new[&s].last_signature, None);
        assert_eq!(chunks[1].new[&s].after, 3);
        assert_eq!(chunks[1].new[&s].last_signature, Some(last));
    }
}
