//! Peer roles and per-peer policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::loader::LoadConfig;
use crate::messages::PeerID;

/// What a peer is to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PeerRole {
    /// A sync server that may hold any value.
    Server,
    /// An end-user node that only has what it made or loaded.
    Client,
    /// Local persistent storage. Queues under backpressure, so it gets the
    /// longer timeout.
    Storage,
}

/// Policy for one peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    pub role: PeerRole,
    /// Ask again after this peer reported a value unavailable or timed out.
    pub retry_unavailable: bool,
}

impl PeerConfig {
    pub fn server() -> Self {
        Self {
            role: PeerRole::Server,
            retry_unavailable: true,
        }
    }

    pub fn client() -> Self {
        Self {
            role: PeerRole::Client,
            retry_unavailable: false,
        }
    }

    pub fn storage() -> Self {
        Self {
            role: PeerRole::Storage,
            retry_unavailable: false,
        }
    }

    /// How long a load request to this peer may stay pending.
    pub fn timeout(&self, config: &LoadConfig) -> Duration {
        match self.role {
            PeerRole::Storage => config.storage_timeout,
            PeerRole::Server | PeerRole::Client => config.peer_timeout,
        }
    }
}

/// A connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub id: PeerID,
    pub config: PeerConfig,
}

impl Peer {
    pub fn new(id: impl Into<PeerID>, config: PeerConfig) -> Self {
        Self {
            id: id.into(),
            config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_waits_longer() {
        let config = LoadConfig::default();
        assert!(PeerConfig::storage().timeout(&config) > PeerConfig::server().timeout(&config));
        assert!(PeerConfig::server().retry_unavailable);
        assert!(!PeerConfig::client().retry_unavailable);
    }
}
