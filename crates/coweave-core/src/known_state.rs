//! KnownState: how much of a CoValue's history a party has.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{RawCoID, SessionID};

/// Compact summary used as the basis for sync diffing.
///
/// Session counts are transaction counts, so a session at `n` holds indices
/// `0..n`. Missing sessions count as zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownState {
    pub id: RawCoID,
    pub header: bool,
    pub sessions: BTreeMap<SessionID, u32>,
}

impl KnownState {
    /// The state of a party that knows nothing about `id`.
    pub fn empty(id: RawCoID) -> Self {
        Self {
            id,
            header: false,
            sessions: BTreeMap::new(),
        }
    }

    /// Check if this state carries no information.
    pub fn is_empty(&self) -> bool {
        !self.header && self.sessions.values().all(|&n| n == 0)
    }

    /// Transaction count known for a session.
    pub fn count(&self, session: &SessionID) -> u32 {
        self.sessions.get(session).copied().unwrap_or(0)
    }

    /// Raise this state to at least `other` (pointwise max).
    pub fn combine_with(&mut self, other: &KnownState) {
        self.header |= other.header;
        for (session, &count) in &other.sessions {
            let entry = self.sessions.entry(session.clone()).or_insert(0);
            *entry = (*entry).max(count);
        }
    }

    /// Record that `session` is known up to `count` transactions.
    pub fn update_session(&mut self, session: &SessionID, count: u32) {
        let entry = self.sessions.entry(session.clone()).or_insert(0);
        *entry = (*entry).max(count);
    }

    /// Check if everything in `self` is also in `other`.
    pub fn is_covered_by(&self, other: &KnownState) -> bool {
        (!self.header || other.header)
            && self
                .sessions
                .iter()
                .all(|(session, &count)| other.count(session) >= count)
    }

    /// Total transactions across sessions.
    pub fn total(&self) -> u64 {
        self.sessions.values().map(|&n| n as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::AgentSecret;
    use crate::types::ActorID;

    fn session(seed: u8) -> SessionID {
        let agent = AgentSecret::from_seed(&[seed; 32]).agent_id();
        SessionID::new(&ActorID::Agent(agent), [seed; 8])
    }

    #[test]
    fn test_empty() {
        let state = KnownState::empty(RawCoID([1; 20]));
        assert!(state.is_empty());
        assert_eq!(state.count(&session(1)), 0);
    }

    #[test]
    fn test_combine_is_pointwise_max() {
        let id = RawCoID([1; 20]);
        let (s1, s2) = (session(1), session(2));

        let mut a = KnownState::empty(id);
        a.update_session(&s1, 3);

        let mut b = KnownState::empty(id);
        b.header = true;
        b.update_session(&s1, 1);
        b.update_session(&s2, 4);

        a.combine_with(&b);
        assert!(a.header);
        assert_eq!(a.count(&s1), 3);
        assert_eq!(a.count(&s2), 4);
        assert!(b.is_covered_by(&a));
        assert!(!a.is_covered_by(&b));
    }

    #[test]
    fn test_update_never_decreases() {
        let mut state = KnownState::empty(RawCoID([1; 20]));
        let s = session(1);
        state.update_session(&s, 5);
        state.update_session(&s, 2);
        assert_eq!(state.count(&s), 5);
        assert_eq!(state.total(), 5);
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        fn state() -> impl Strategy<Value = KnownState> {
            (any::<bool>(), proptest::collection::vec(0u32..50, 0..4)).prop_map(|(header, counts)| {
                let mut state = KnownState::empty(RawCoID([7; 20]));
                state.header = header;
                for (i, count) in counts.into_iter().enumerate() {
                    state.update_session(&session(i as u8), count);
                }
                state
            })
        }

        proptest! {
            #[test]
            fn combine_covers_both_sides(a in state(), b in state()) {
                let mut merged = a.clone();
                merged.combine_with(&b);
                prop_assert!(a.is_covered_by(&merged));
                prop_assert!(b.is_covered_by(&merged));
            }

            #[test]
            fn combine_is_commutative(a in state(), b in state()) {
                let mut ab = a.clone();
                ab.combine_with(&b);
                let mut ba = b.clone();
                ba.combine_with(&a);
                prop_assert!(ab.is_covered_by(&ba) && ba.is_covered_by(&ab));
                prop_assert_eq!(ab.total(), ba.total());
            }
        }
    }
}
