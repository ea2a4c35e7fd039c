//! # coweave
//!
//! The unified API for coweave: replicated CoValues built from per-session,
//! hash-chained, signed transaction logs, with group-based permissions and
//! encrypted content.
//!
//! ## Overview
//!
//! Two ways of driving replication are provided:
//!
//! - [`LocalNode`]: each CoValue is a verified core paired with an
//!   availability state machine; peer loads race a timeout under a
//!   cancellation token, inbound content is verified as it arrives.
//! - [`Pipeline`]: a sans-IO scheduler that runs every tracked value through
//!   load, verify, validate, notify, sync and store stages on each tick,
//!   doing work only for values somebody needs.
//!
//! ## Key Concepts
//!
//! - **Session**: one actor's append-only transaction stream in a CoValue.
//! - **Checkpoint**: a signature over the session's chain hash, recorded
//!   every `MAX_RECOMMENDED_TX_SIZE` bytes and at the end of each append.
//! - **Known state**: per-session counts summarizing what a party has seen.
//! - **Group**: a CoValue whose content grants roles and reveals read keys.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use coweave::{LocalNode, NodeConfig};
//! use coweave::core::{AgentSecret, CoValueHeader, CoValueType, Privacy, Ruleset};
//! use coweave::keys::LocalIdentity;
//! use coweave::sync::{MemoryNetwork, Transport};
//! use serde_json::json;
//!
//! async fn example() -> coweave::Result<()> {
//!     let network = MemoryNetwork::new();
//!     let transport: Arc<dyn Transport> = Arc::new(network.create_transport("alice").await);
//!     let identity = LocalIdentity::for_agent(AgentSecret::generate());
//!     let node = LocalNode::new(identity, transport, NodeConfig::default());
//!
//!     let id = node
//!         .create_covalue(CoValueHeader::new(CoValueType::Comap, Ruleset::UnsafeAllowAll))
//!         .await?;
//!     node.make_transaction(id, &[json!({"op": "set", "key": "a", "value": 1})], Privacy::Trusting, 1)
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `coweave::core` - identifiers, crypto, transactions, `CoValueCore`
//! - `coweave::keys` - groups, read keys, permissions, decrypted view
//! - `coweave::store` - storage abstraction, memory and SQLite backends
//! - `coweave::sync` - wire messages, transport, availability, loader

pub mod config;
pub mod error;
pub mod node;
pub mod pipeline;

// Re-export component crates
pub use coweave_core as core;
pub use coweave_keys as keys;
pub use coweave_store as store;
pub use coweave_sync as sync;

// Re-export main types for convenience
pub use config::{NodeConfig, PipelineConfig};
pub use error::{NodeError, Result};
pub use node::LocalNode;
pub use pipeline::{Effect, ListenerID, ListenerUpdate, Pipeline};

// Re-export commonly used core types
pub use coweave_core::{
    CoValueCore, CoValueHeader, CoValueType, KnownState, Privacy, RawCoID, Ruleset, SessionID,
    Transaction,
};
