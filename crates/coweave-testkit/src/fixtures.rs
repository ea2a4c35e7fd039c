//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use serde_json::{json, Value as JsonValue};

use coweave_core::{
    AgentSecret, CoValueCore, CoValueHeader, CoValueType, KeyID, Privacy, RawCoID, Ruleset,
    SessionID, Transaction,
};
use coweave_keys::{create_group, make_transaction, KeySecret, LocalIdentity};
use coweave_store::MemoryStore;

/// A test fixture with an identity and a memory store.
pub struct TestFixture {
    pub identity: LocalIdentity,
    pub store: MemoryStore,
}

impl TestFixture {
    /// Create a new test fixture with a random agent.
    pub fn new() -> Self {
        Self {
            identity: LocalIdentity::for_agent(AgentSecret::generate()),
            store: MemoryStore::new(),
        }
    }

    /// Create with a deterministic agent from seed.
    pub fn with_seed(seed: [u8; 32]) -> Self {
        Self {
            identity: LocalIdentity::for_agent(AgentSecret::from_seed(&seed)),
            store: MemoryStore::new(),
        }
    }

    /// The session this fixture writes in.
    pub fn session(&self) -> &SessionID {
        &self.identity.session
    }

    /// An empty `unsafeAllowAll` CoMap, distinct per `uniqueness`.
    pub fn covalue(&self, uniqueness: &str) -> CoValueCore {
        CoValueCore::new(
            CoValueHeader::new(CoValueType::Comap, Ruleset::UnsafeAllowAll)
                .with_uniqueness(json!(uniqueness)),
        )
    }

    /// A CoMap holding `count` trusting transactions, made at 1, 2, ...
    pub fn populated(&self, uniqueness: &str, count: u64) -> CoValueCore {
        let mut core = self.covalue(uniqueness);
        for made_at in 1..=count {
            self.write(&mut core, json!({"op": "set", "key": "n", "value": made_at}), made_at);
        }
        core
    }

    /// Append one trusting change in this fixture's session.
    pub fn write(&self, core: &mut CoValueCore, change: JsonValue, made_at: u64) {
        make_transaction(core, &self.identity, &[change], Privacy::Trusting, None, made_at)
            .expect("local write");
    }

    /// A group administered by this fixture, with its first read key.
    pub fn group(&self, made_at: u64) -> (CoValueCore, KeyID, KeySecret) {
        create_group(&self.identity, made_at).expect("group creation")
    }

    /// An empty CoMap owned by `group`.
    pub fn owned_by(&self, group: RawCoID, uniqueness: &str) -> CoValueCore {
        CoValueCore::new(
            CoValueHeader::new(CoValueType::Comap, Ruleset::OwnedByGroup { group })
                .with_uniqueness(json!(uniqueness)),
        )
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// Create multiple test fixtures for multi-party tests.
pub fn multi_party_fixtures(count: usize) -> Vec<TestFixture> {
    (0..count)
        .map(|i| {
            let mut seed = [0u8; 32];
            seed[0] = i as u8;
            TestFixture::with_seed(seed)
        })
        .collect()
}

/// A trusting transaction whose serialized changes are about `size` bytes.
pub fn padded_transaction(made_at: u64, size: usize) -> Transaction {
    let changes = json!([{"op": "set", "key": "pad", "value": "x".repeat(size)}]);
    Transaction::trusting(made_at, changes.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use coweave_core::MAX_RECOMMENDED_TX_SIZE;
    use coweave_store::{load_value, store_core, Store};

    #[test]
    fn test_populated_covalue() {
        let fixture = TestFixture::with_seed([1; 32]);
        let core = fixture.populated("test", 3);

        assert_eq!(core.known_state().count(fixture.session()), 3);
        assert!(core.known_state().header);
    }

    #[tokio::test]
    async fn test_fixture_store_round_trip() {
        let fixture = TestFixture::new();
        let core = fixture.populated("stored", 4);
        store_core(&fixture.store, &core).await.unwrap();

        let metadata = fixture.store.load_metadata(&core.id()).await.unwrap().unwrap();
        assert_eq!(&metadata.known_state, core.known_state());
        let stored = load_value(&fixture.store, &core.id()).await.unwrap().unwrap();
        assert_eq!(stored.sessions[fixture.session()].transactions.len(), 4);
    }

    #[test]
    fn test_multi_party() {
        let parties = multi_party_fixtures(3);

        // Each party writes in its own session
        assert_ne!(parties[0].session(), parties[1].session());
        assert_ne!(parties[1].session(), parties[2].session());
        assert_ne!(parties[0].session(), parties[2].session());
    }

    #[test]
    fn test_padded_transaction_size() {
        let tx = padded_transaction(1, MAX_RECOMMENDED_TX_SIZE);
        assert!(tx.size() > MAX_RECOMMENDED_TX_SIZE);
    }
}
