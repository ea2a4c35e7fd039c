//! Strong type definitions for the CoValue engine.
//!
//! All identifiers are newtypes to prevent misuse at compile time. Textual
//! forms are stable because they appear as map keys inside group content and
//! because session ordering is lexicographic on the text.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::crypto::{AgentID, Hash};
use crate::error::CoreError;

/// Content-derived identifier of a CoValue.
///
/// The first 20 bytes of the Blake3 hash of the header's canonical encoding.
/// Textual form: `co_z<hex>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawCoID(pub [u8; 20]);

impl RawCoID {
    /// Derive an ID from a header hash.
    pub fn from_header_hash(hash: &Hash) -> Self {
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&hash.0[..20]);
        Self(arr)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for RawCoID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "co_z{}", self.to_hex())
    }
}

impl fmt::Debug for RawCoID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawCoID({})", &self.to_hex()[..12])
    }
}

impl FromStr for RawCoID {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || CoreError::MalformedId(s.to_string());
        let body = s.strip_prefix("co_z").ok_or_else(malformed)?;
        let bytes = hex::decode(body).map_err(|_| malformed())?;
        let arr: [u8; 20] = bytes.try_into().map_err(|_| malformed())?;
        Ok(Self(arr))
    }
}

/// Identifier of a symmetric read key. Textual form: `key_z<hex>`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyID(pub [u8; 16]);

impl KeyID {
    /// Generate a fresh random key ID.
    pub fn random() -> Self {
        use rand::Rng;
        Self(rand::thread_rng().gen())
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for KeyID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key_z{}", self.to_hex())
    }
}

impl fmt::Debug for KeyID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyID({})", self.to_hex())
    }
}

impl FromStr for KeyID {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || CoreError::MalformedId(s.to_string());
        let body = s.strip_prefix("key_z").ok_or_else(malformed)?;
        let bytes = hex::decode(body).map_err(|_| malformed())?;
        let arr: [u8; 16] = bytes.try_into().map_err(|_| malformed())?;
        Ok(Self(arr))
    }
}

/// The actor behind a session: an account (itself a CoValue) or a bare agent.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ActorID {
    Account(RawCoID),
    Agent(AgentID),
}

impl ActorID {
    /// The account ID, if this actor is an account.
    pub fn as_account(&self) -> Option<&RawCoID> {
        match self {
            ActorID::Account(id) => Some(id),
            ActorID::Agent(_) => None,
        }
    }

    /// The agent ID, if this actor is a bare agent.
    pub fn as_agent(&self) -> Option<&AgentID> {
        match self {
            ActorID::Agent(id) => Some(id),
            ActorID::Account(_) => None,
        }
    }
}

impl fmt::Display for ActorID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorID::Account(id) => fmt::Display::fmt(id, f),
            ActorID::Agent(id) => fmt::Display::fmt(id, f),
        }
    }
}

impl fmt::Debug for ActorID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorID::Account(id) => write!(f, "Account({:?})", id),
            ActorID::Agent(id) => write!(f, "Agent({:?})", id),
        }
    }
}

impl FromStr for ActorID {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with("co_z") {
            Ok(ActorID::Account(s.parse()?))
        } else if s.starts_with("sealer_z") {
            Ok(ActorID::Agent(s.parse()?))
        } else {
            Err(CoreError::MalformedId(s.to_string()))
        }
    }
}

impl From<AgentID> for ActorID {
    fn from(id: AgentID) -> Self {
        ActorID::Agent(id)
    }
}

impl From<RawCoID> for ActorID {
    fn from(id: RawCoID) -> Self {
        ActorID::Account(id)
    }
}

const SESSION_SEPARATOR: &str = "_session_z";

/// One actor's append-only contribution stream to a CoValue.
///
/// Textual form: `<actor>_session_z<hex nonce>`. Ordering is lexicographic on
/// the text, which is the tie-break used by the canonical merge order.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionID(String);

impl SessionID {
    /// Build a session ID for an actor with the given nonce.
    pub fn new(actor: &ActorID, nonce: [u8; 8]) -> Self {
        Self(format!("{}{}{}", actor, SESSION_SEPARATOR, hex::encode(nonce)))
    }

    /// Build a session ID with a random nonce.
    pub fn random(actor: &ActorID) -> Self {
        use rand::Rng;
        Self::new(actor, rand::thread_rng().gen())
    }

    /// The actor this session belongs to.
    pub fn actor(&self) -> Result<ActorID, CoreError> {
        let (actor, _) = self
            .0
            .rsplit_once(SESSION_SEPARATOR)
            .ok_or_else(|| CoreError::MalformedId(self.0.clone()))?;
        actor.parse()
    }

    /// The textual form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SessionID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tail = self.0.rsplit_once(SESSION_SEPARATOR).map(|(_, n)| n).unwrap_or("?");
        write!(f, "SessionID(..{})", tail)
    }
}

impl FromStr for SessionID {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let session = Self(s.to_string());
        session.actor()?;
        Ok(session)
    }
}

/// Position of a transaction: session plus index within the session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionID {
    pub session_id: SessionID,
    pub tx_index: u32,
}

impl fmt::Display for TransactionID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.session_id, self.tx_index)
    }
}

macro_rules! serde_via_str {
    ($($ty:ty),*) => {
        $(
            impl Serialize for $ty {
                fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                    serializer.collect_str(self)
                }
            }

            impl<'de> Deserialize<'de> for $ty {
                fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                    let s = String::deserialize(deserializer)?;
                    s.parse().map_err(serde::de::Error::custom)
                }
            }
        )*
    };
}

serde_via_str!(RawCoID, KeyID, ActorID, SessionID);
