//! Proptest generators for property-based testing.

use proptest::prelude::*;
use serde_json::{json, Value as JsonValue};

use coweave_core::{
    ActorID, AgentSecret, CoValueCore, CoValueHeader, CoValueType, Ruleset, SessionID, Transaction,
};

/// Generate a random agent.
pub fn agent() -> impl Strategy<Value = AgentSecret> {
    any::<[u8; 32]>().prop_map(|seed| AgentSecret::from_seed(&seed))
}

/// Generate a session nonce.
pub fn nonce() -> impl Strategy<Value = [u8; 8]> {
    any::<[u8; 8]>()
}

/// Generate a reasonable timestamp.
pub fn made_at() -> impl Strategy<Value = u64> {
    0u64..=1_700_000_000_000u64
}

/// Generate one map operation.
pub fn change() -> impl Strategy<Value = JsonValue> {
    prop_oneof![
        ("[a-z]{1,8}", any::<i64>()).prop_map(|(key, value)| json!({"op": "set", "key": key, "value": value})),
        ("[a-z]{1,8}", "[ -~]{0,32}").prop_map(|(key, value)| json!({"op": "set", "key": key, "value": value})),
        "[a-z]{1,8}".prop_map(|key| json!({"op": "del", "key": key})),
    ]
}

/// Generate a trusting transaction carrying up to four operations.
pub fn transaction() -> impl Strategy<Value = Transaction> {
    (made_at(), prop::collection::vec(change(), 1..=4))
        .prop_map(|(made_at, changes)| Transaction::trusting(made_at, JsonValue::from(changes).to_string()))
}

/// Parameters for generating a populated CoValue.
///
/// Each batch is appended (and signed) as one unit, so batch boundaries are
/// where the session's signatures fall.
#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub seed: [u8; 32],
    pub nonce: [u8; 8],
    pub batches: Vec<Vec<Transaction>>,
}

impl SessionPlan {
    pub fn agent(&self) -> AgentSecret {
        AgentSecret::from_seed(&self.seed)
    }

    pub fn session(&self) -> SessionID {
        SessionID::new(&ActorID::Agent(self.agent().agent_id()), self.nonce)
    }

    pub fn transaction_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }
}

impl Arbitrary for SessionPlan {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (
            any::<[u8; 32]>(), // seed
            nonce(),
            prop::collection::vec(prop::collection::vec(transaction(), 1..=4), 1..=6),
        )
            .prop_map(|(seed, nonce, batches)| SessionPlan {
                seed,
                nonce,
                batches,
            })
            .boxed()
    }
}

/// Build the CoValue a plan describes, in an `unsafeAllowAll` CoMap.
pub fn covalue_from_plan(plan: &SessionPlan) -> CoValueCore {
    let agent = plan.agent();
    let session = plan.session();
    let header = CoValueHeader::new(CoValueType::Comap, Ruleset::UnsafeAllowAll)
        .with_uniqueness(json!(hex::encode(plan.nonce)));
    let mut core = CoValueCore::new(header);
    for batch in &plan.batches {
        core.append_signed(&session, batch.clone(), &agent.signer)
            .expect("local append");
    }
    core
}
