//! Transport abstraction for the sync protocol.
//!
//! The transport delivers [`SyncMessage`]s between named peers.
//! Implementations may use WebSockets, QUIC, or anything else that carries
//! [`SyncMessage::to_bytes`] frames.

use async_trait::async_trait;

use crate::error::{Result, SyncError};
use crate::messages::{PeerID, SyncMessage};

/// Transport trait for sending and receiving sync messages.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message to a specific peer.
    async fn send(&self, peer: &PeerID, message: SyncMessage) -> Result<()>;

    /// Receive the next message from any peer.
    ///
    /// Blocks until a message is available or the transport is closed.
    async fn recv(&self) -> Result<(PeerID, SyncMessage)>;

    /// Receive with timeout. `None` if the timeout expires first.
    async fn recv_timeout(&self, timeout: std::time::Duration) -> Result<Option<(PeerID, SyncMessage)>>;

    /// The local peer's name.
    fn local_peer_id(&self) -> PeerID;

    /// Check if a specific peer is connected.
    async fn is_connected(&self, peer: &PeerID) -> bool;

    /// Send `Close` to a peer and stop talking to it.
    async fn disconnect(&self, peer: &PeerID) -> Result<()>;
}

/// A simple in-memory transport for testing.
///
/// Uses channels to simulate message passing between peers.
pub mod memory {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use tokio::sync::{mpsc, Mutex, RwLock};

    #[derive(Debug)]
    struct Envelope {
        from: PeerID,
        message: SyncMessage,
    }

    /// Shared state for the memory transport network.
    #[derive(Default)]
    pub struct MemoryNetwork {
        senders: RwLock<HashMap<PeerID, mpsc::Sender<Envelope>>>,
        /// Severed links, stored in both directions.
        severed: RwLock<HashSet<(PeerID, PeerID)>>,
    }

    impl MemoryNetwork {
        /// Create a new memory network.
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Create a transport connected to this network.
        pub async fn create_transport(self: &Arc<Self>, peer: impl Into<PeerID>) -> MemoryTransport {
            let peer = peer.into();
            let (tx, rx) = mpsc::channel(1000);
            self.senders.write().await.insert(peer.clone(), tx);

            MemoryTransport {
                peer,
                network: Arc::clone(self),
                receiver: Mutex::new(rx),
            }
        }

        /// Restore a link cut by `disconnect`.
        pub async fn heal(&self, a: &PeerID, b: &PeerID) {
            let mut severed = self.severed.write().await;
            severed.remove(&(a.clone(), b.clone()));
            severed.remove(&(b.clone(), a.clone()));
        }

        async fn linked(&self, a: &PeerID, b: &PeerID) -> bool {
            !self.severed.read().await.contains(&(a.clone(), b.clone()))
        }
    }

    /// In-memory transport implementation.
    pub struct MemoryTransport {
        peer: PeerID,
        network: Arc<MemoryNetwork>,
        receiver: Mutex<mpsc::Receiver<Envelope>>,
    }

    #[async_trait]
    impl Transport for MemoryTransport {
        async fn send(&self, peer: &PeerID, message: SyncMessage) -> Result<()> {
            if !self.network.linked(&self.peer, peer).await {
                return Err(SyncError::PeerNotConnected(peer.clone()));
            }
            let sender = self
                .network
                .senders
                .read()
                .await
                .get(peer)
                .cloned()
                .ok_or_else(|| SyncError::PeerNotConnected(peer.clone()))?;
            sender
                .send(Envelope {
                    from: self.peer.clone(),
                    message,
                })
                .await
                .map_err(|_| SyncError::TransportError("peer disconnected".into()))
        }

        async fn recv(&self) -> Result<(PeerID, SyncMessage)> {
            let mut rx = self.receiver.lock().await;
            match rx.recv().await {
                Some(envelope) => Ok((envelope.from, envelope.message)),
                None => Err(SyncError::TransportError("channel closed".into())),
            }
        }

        async fn recv_timeout(
            &self,
            timeout: std::time::Duration,
        ) -> Result<Option<(PeerID, SyncMessage)>> {
            let mut rx = self.receiver.lock().await;
            match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(Some(envelope)) => Ok(Some((envelope.from, envelope.message))),
                Ok(None) => Err(SyncError::TransportError("channel closed".into())),
                Err(_) => Ok(None),
            }
        }

        fn local_peer_id(&self) -> PeerID {
            self.peer.clone()
        }

        async fn is_connected(&self, peer: &PeerID) -> bool {
            self.network.senders.read().await.contains_key(peer)
                && self.network.linked(&self.peer, peer).await
        }

        async fn disconnect(&self, peer: &PeerID) -> Result<()> {
            // Deliver the close before the link goes away.
            let closed = self.send(peer, SyncMessage::Close).await;
            let mut severed = self.network.severed.write().await;
            severed.insert((self.peer.clone(), peer.clone()));
            severed.insert((peer.clone(), self.peer.clone()));
            closed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryNetwork;
    use super::*;
    use coweave_core::{KnownState, RawCoID};
    use std::time::Duration;

    #[tokio::test]
    async fn test_memory_transport_send_recv() {
        let network = MemoryNetwork::new();
        let a = network.create_transport("a").await;
        let b = network.create_transport("b").await;

        let load = SyncMessage::Load {
            known: KnownState::empty(RawCoID([1; 20])),
        };
        a.send(&PeerID::from("b"), load.clone()).await.unwrap();

        let (from, message) = b.recv().await.unwrap();
        assert_eq!(from, PeerID::from("a"));
        assert_eq!(message, load);
    }

    #[tokio::test]
    async fn test_memory_transport_timeout() {
        let network = MemoryNetwork::new();
        let a = network.create_transport("a").await;
        let result = a.recv_timeout(Duration::from_millis(10)).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_unknown_peer() {
        let network = MemoryNetwork::new();
        let a = network.create_transport("a").await;
        let err = a.send(&PeerID::from("nobody"), SyncMessage::Close).await.unwrap_err();
        assert!(matches!(err, SyncError::PeerNotConnected(_)));
    }

    #[tokio::test]
    async fn test_disconnect_delivers_close() {
        let network = MemoryNetwork::new();
        let a = network.create_transport("a").await;
        let b = network.create_transport("b").await;

        a.disconnect(&PeerID::from("b")).await.unwrap();
        let (from, message) = b.recv().await.unwrap();
        assert_eq!((from, message), (PeerID::from("a"), SyncMessage::Close));

        assert!(!a.is_connected(&PeerID::from("b")).await);
        assert!(b.send(&PeerID::from("a"), SyncMessage::Close).await.is_err());

        network.heal(&PeerID::from("a"), &PeerID::from("b")).await;
        assert!(a.is_connected(&PeerID::from("b")).await);
    }
}
