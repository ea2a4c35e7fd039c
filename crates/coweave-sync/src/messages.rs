//! Sync protocol message types.
//!
//! Peers exchange four kinds of message per CoValue: a load request carrying
//! what the sender knows, content the receiver lacks, a known-state ack, and
//! a close signal for the whole connection.

use serde::{Deserialize, Serialize};
use std::fmt;

use coweave_core::{ContentChunk, KnownState, RawCoID, MAX_RECOMMENDED_TX_SIZE};

use crate::error::{Result, SyncError};

/// Name of a peer connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerID(pub String);

impl PeerID {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// A random peer name, `peer_z<hex>`.
    pub fn random() -> Self {
        use rand::Rng;
        let bytes: [u8; 8] = rand::thread_rng().gen();
        Self(format!("peer_z{}", hex::encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerID {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 0;

/// Message size limits.
pub mod limits {
    use super::MAX_RECOMMENDED_TX_SIZE;

    /// Max sessions in one content message.
    pub const MAX_SESSIONS_PER_MESSAGE: usize = 1000;
    /// Max sessions in a load or known-state message.
    pub const MAX_KNOWN_SESSIONS: usize = 10_000;
    /// Max bytes of transactions in one content message. Chunks aim for
    /// `MAX_RECOMMENDED_TX_SIZE`; a single oversized transaction may exceed it.
    pub const MAX_CONTENT_BYTES: usize = 64 * MAX_RECOMMENDED_TX_SIZE;
}

/// Sync protocol messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum SyncMessage {
    /// "Send me what I lack": the sender's known state.
    Load { known: KnownState },

    /// Transactions (and possibly the header) the receiver lacks.
    Content { chunk: ContentChunk },

    /// Ack or reply: the sender's state after handling a message. `header:
    /// false` in reply to a load means the sender does not have the value.
    Known { known: KnownState },

    /// The connection is closing.
    Close,
}

impl SyncMessage {
    /// The CoValue this message is about, if any.
    pub fn id(&self) -> Option<RawCoID> {
        match self {
            SyncMessage::Load { known } | SyncMessage::Known { known } => Some(known.id),
            SyncMessage::Content { chunk } => Some(chunk.id),
            SyncMessage::Close => None,
        }
    }

    /// Check if this message respects size limits.
    pub fn validate_limits(&self) -> std::result::Result<(), &'static str> {
        match self {
            SyncMessage::Load { known } | SyncMessage::Known { known } => {
                if known.sessions.len() > limits::MAX_KNOWN_SESSIONS {
                    return Err("too many sessions in known state");
                }
            }
            SyncMessage::Content { chunk } => {
                if chunk.new.len() > limits::MAX_SESSIONS_PER_MESSAGE {
                    return Err("too many sessions in content");
                }
                if chunk.size() > limits::MAX_CONTENT_BYTES {
                    return Err("content too large");
                }
                if let Some(header) = &chunk.header {
                    if header.id() != chunk.id {
                        return Err("header does not match id");
                    }
                }
            }
            SyncMessage::Close => {}
        }
        Ok(())
    }

    /// CBOR encoding for byte-oriented transports.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = vec![PROTOCOL_VERSION];
        ciborium::into_writer(self, &mut buf).map_err(|e| SyncError::Encoding(e.to_string()))?;
        Ok(buf)
    }

    /// Decode and check limits.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (&version, body) = bytes
            .split_first()
            .ok_or_else(|| SyncError::InvalidMessage("empty frame".into()))?;
        if version != PROTOCOL_VERSION {
            return Err(SyncError::VersionMismatch {
                local: PROTOCOL_VERSION,
                peer: version,
            });
        }
        let message: SyncMessage =
            ciborium::from_reader(body).map_err(|e| SyncError::Encoding(e.to_string()))?;
        message
            .validate_limits()
            .map_err(|e| SyncError::InvalidMessage(e.into()))?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coweave_core::{
        ActorID, AgentSecret, CoValueCore, CoValueHeader, CoValueType, Ruleset, SessionID, Transaction,
    };

    fn core_with(n: u64) -> CoValueCore {
        let agent = AgentSecret::from_seed(&[2; 32]);
        let session = SessionID::new(&ActorID::Agent(agent.agent_id()), [0; 8]);
        let mut core = CoValueCore::new(CoValueHeader::new(CoValueType::Costream, Ruleset::UnsafeAllowAll));
        for i in 0..n {
            core.append_signed(&session, vec![Transaction::trusting(i, "[]")], &agent.signer)
                .unwrap();
        }
        core
    }

    #[test]
    fn test_content_message_bytes() {
        let core = core_with(3);
        let chunk = core.new_content_since(None).unwrap().remove(0);
        let message = SyncMessage::Content { chunk };

        let decoded = SyncMessage::from_bytes(&message.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.id(), Some(core.id()));
    }

    #[test]
    fn test_version_mismatch() {
        let mut bytes = SyncMessage::Close.to_bytes().unwrap();
        bytes[0] = 9;
        assert!(matches!(
            SyncMessage::from_bytes(&bytes),
            Err(SyncError::VersionMismatch { peer: 9, .. })
        ));
    }

    #[test]
    fn test_mismatched_header_fails_limits() {
        let core = core_with(1);
        let mut chunk = core.new_content_since(None).unwrap().remove(0);
        chunk.id = RawCoID([0; 20]);
        assert!(SyncMessage::Content { chunk }.validate_limits().is_err());
    }

    #[test]
    fn test_peer_id_display() {
        assert_eq!(PeerID::from("storage").to_string(), "storage");
        assert!(PeerID::random().as_str().starts_with("peer_z"));
    }
}
