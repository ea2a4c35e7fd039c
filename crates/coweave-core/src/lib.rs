//! # coweave core
//!
//! Pure primitives for the CoValue engine: identifiers, the crypto capability,
//! canonical encoding, session logs and the per-value core.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`CoValueHeader`] - Immutable header; its hash is the value's [`RawCoID`]
//! - [`Transaction`] - Trusting or private unit of change within a session
//! - [`SessionLog`] - Hash-chained, checkpoint-signed transactions of one session
//! - [`CoValueCore`] - All sessions of one value, with sync diffing
//! - [`KnownState`] - How much of a value a party has
//!
//! ## Canonicalization
//!
//! Headers and transactions are hashed over deterministic CBOR. See the
//! [`canonical`] module.

pub mod canonical;
pub mod content;
pub mod covalue;
pub mod crypto;
pub mod error;
pub mod header;
pub mod known_state;
pub mod session_log;
pub mod transaction;
pub mod types;

pub use canonical::{canonical_header_bytes, canonical_transaction_bytes};
pub use content::{new_content_since, ContentChunk, SessionNewContent, SessionView};
pub use covalue::{
    session_agent, CoValueCore, IngestOutcome, NoAccounts, SignerResolver, Verification,
};
pub use crypto::{
    AgentID, AgentSecret, Hash, SealerID, SealerSecret, Signature, SignerID, SignerSecret,
    StreamingHash,
};
pub use error::{AppendError, CoreError, ResolveAccountAgentError};
pub use header::{CoValueHeader, CoValueType, Ruleset};
pub use known_state::KnownState;
pub use session_log::SessionLog;
pub use transaction::{Privacy, Transaction, MAX_RECOMMENDED_TX_SIZE};
pub use types::{ActorID, KeyID, RawCoID, SessionID, TransactionID};
