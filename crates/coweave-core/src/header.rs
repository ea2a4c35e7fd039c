//! CoValueHeader: the immutable header whose hash is the CoValue's identity.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::canonical::canonical_header_bytes;
use crate::crypto::Hash;
use crate::types::{ActorID, RawCoID};

/// Content kind of a CoValue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoValueType {
    Comap,
    Colist,
    Costream,
    Binary,
}

impl CoValueType {
    /// Stable textual name, used in canonical encoding.
    pub fn as_str(&self) -> &'static str {
        match self {
            CoValueType::Comap => "comap",
            CoValueType::Colist => "colist",
            CoValueType::Costream => "costream",
            CoValueType::Binary => "binary",
        }
    }
}

/// Access-control rules declared by a header.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Ruleset {
    /// Every transaction is accepted.
    UnsafeAllowAll,

    /// The value is itself a group; `initial_admin` may bootstrap its role.
    #[serde(rename_all = "camelCase")]
    Group { initial_admin: ActorID },

    /// Permissions and read keys are delegated to a group.
    #[serde(rename_all = "camelCase")]
    OwnedByGroup { group: RawCoID },
}

impl Ruleset {
    /// The owning group, if permissions are delegated.
    pub fn owning_group(&self) -> Option<&RawCoID> {
        match self {
            Ruleset::OwnedByGroup { group } => Some(group),
            _ => None,
        }
    }

    /// Check if this ruleset describes a group.
    pub fn is_group(&self) -> bool {
        matches!(self, Ruleset::Group { .. })
    }
}

/// Immutable header of a CoValue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoValueHeader {
    #[serde(rename = "type")]
    pub co_type: CoValueType,
    pub ruleset: Ruleset,
    pub meta: Option<JsonValue>,
    /// Distinguishes otherwise identical headers.
    pub uniqueness: JsonValue,
    pub created_at: Option<u64>,
}

impl CoValueHeader {
    /// A header with random uniqueness, so its ID is fresh.
    pub fn new(co_type: CoValueType, ruleset: Ruleset) -> Self {
        use rand::Rng;
        let nonce: [u8; 12] = rand::thread_rng().gen();
        Self {
            co_type,
            ruleset,
            meta: None,
            uniqueness: JsonValue::String(format!("z{}", hex::encode(nonce))),
            created_at: None,
        }
    }

    /// Set the meta field.
    pub fn with_meta(mut self, meta: JsonValue) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Set explicit uniqueness (deterministic IDs).
    pub fn with_uniqueness(mut self, uniqueness: JsonValue) -> Self {
        self.uniqueness = uniqueness;
        self
    }

    /// Set the creation time.
    pub fn with_created_at(mut self, created_at: u64) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Content hash of the header.
    pub fn hash(&self) -> Hash {
        Hash::of(&canonical_header_bytes(self))
    }

    /// The CoValue ID derived from this header.
    pub fn id(&self) -> RawCoID {
        RawCoID::from_header_hash(&self.hash())
    }

    /// Check if the header marks an account.
    pub fn is_account(&self) -> bool {
        self.ruleset.is_group()
            && self
                .meta
                .as_ref()
                .and_then(|m| m.get("type"))
                .and_then(|t| t.as_str())
                == Some("account")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_id_is_deterministic() {
        let header = CoValueHeader::new(CoValueType::Comap, Ruleset::UnsafeAllowAll)
            .with_uniqueness(json!("fixed"));
        assert_eq!(header.id(), header.clone().id());
    }

    #[test]
    fn test_uniqueness_changes_id() {
        let a = CoValueHeader::new(CoValueType::Comap, Ruleset::UnsafeAllowAll)
            .with_uniqueness(json!("a"));
        let b = a.clone().with_uniqueness(json!("b"));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_meta_key_order_does_not_change_id() {
        let a = CoValueHeader::new(CoValueType::Comap, Ruleset::UnsafeAllowAll)
            .with_uniqueness(json!(1))
            .with_meta(serde_json::from_str(r#"{"a":1,"b":2}"#).unwrap());
        let b = a
            .clone()
            .with_meta(serde_json::from_str(r#"{"b":2,"a":1}"#).unwrap());
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_account_detection() {
        let agent = crate::crypto::AgentSecret::from_seed(&[3; 32]).agent_id();
        let account = CoValueHeader::new(
            CoValueType::Comap,
            Ruleset::Group {
                initial_admin: ActorID::Agent(agent),
            },
        )
        .with_meta(json!({"type": "account"}));
        assert!(account.is_account());

        let group = CoValueHeader::new(
            CoValueType::Comap,
            Ruleset::Group {
                initial_admin: ActorID::Agent(agent),
            },
        );
        assert!(!group.is_account());
    }
}
