//! # coweave sync
//!
//! Replication between peers: wire messages, the transport seam, and the
//! per-value availability state machine with its cancellable loader.
//!
//! ## Key Properties
//!
//! - **Idempotent**: re-delivered content is trimmed, never duplicated
//! - **Bounded**: content travels in chunks near `MAX_RECOMMENDED_TX_SIZE`
//! - **Cancellable**: each (value, peer) load has its own token, cancelled
//!   as soon as the value is available from anywhere
//! - **Transport-agnostic**: anything that carries [`SyncMessage`]s in order
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use coweave_sync::{
//!     load_from_peers, CoValueState, LoadConfig, MemoryNetwork, Peer, PeerConfig,
//!     StateCounters, Transport,
//! };
//! # use coweave_core::RawCoID;
//!
//! async fn example(id: RawCoID) -> coweave_sync::Result<()> {
//!     let network = MemoryNetwork::new();
//!     let transport: Arc<dyn Transport> = Arc::new(network.create_transport("me").await);
//!
//!     let state = CoValueState::unknown(id, StateCounters::new()).into_shared();
//!     let peers = [Peer::new("server", PeerConfig::server())];
//!     let settled = load_from_peers(&state, &peers, &LoadConfig::default(), transport).await?;
//!     println!("{id} is {}", settled.as_str());
//!     Ok(())
//! }
//! ```

pub mod availability;
pub mod convergence;
pub mod error;
pub mod loader;
pub mod messages;
pub mod peer;
pub mod protocol;
pub mod transport;

pub use availability::{
    lock, CoValueState, HighLevelState, PeerStatus, SharedCoValueState, StateCounters,
    StateSnapshot,
};
pub use convergence::{
    compare_known_states, content_hash, verify_convergence, ConvergenceResult, KnownComparison,
};
pub use error::{Result, SyncError};
pub use loader::{load_from_peers, LoadConfig};
pub use messages::{limits, PeerID, SyncMessage, PROTOCOL_VERSION};
pub use peer::{Peer, PeerConfig, PeerRole};
pub use protocol::{apply_content, respond_to_load, Applied, PeerState};
pub use transport::{memory::MemoryNetwork, memory::MemoryTransport, Transport};
