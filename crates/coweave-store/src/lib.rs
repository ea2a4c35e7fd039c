//! # coweave store
//!
//! Storage abstraction for CoValues. Provides a trait-based interface for
//! header and transaction persistence with SQLite and in-memory
//! implementations.
//!
//! ## Key Types
//!
//! - [`Store`] - The async trait: `load_metadata`, `load_transactions`, `write`
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//! - [`SessionWrite`] - Appended content of one session
//! - [`StoredValue`] - A complete stored CoValue, replayable into a core
//!
//! ## Usage
//!
//! ```rust,no_run
//! use coweave_store::{load_value, store_core, SqliteStore};
//! use coweave_core::{CoValueCore, CoValueHeader, CoValueType, Ruleset, Verification};
//!
//! async fn example() {
//!     let store = SqliteStore::open("coweave.db").unwrap();
//!     let core = CoValueCore::new(CoValueHeader::new(CoValueType::Comap, Ruleset::UnsafeAllowAll));
//!     store_core(&store, &core).await.unwrap();
//!
//!     let stored = load_value(&store, &core.id()).await.unwrap().unwrap();
//!     let _core = stored.into_core(Verification::Skip).unwrap();
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Append-only**: rewriting stored transactions is a no-op
//! - **Conflict detection**: a different transaction at a stored index is an error
//! - **Checkpoints**: signatures are stored by the index they cover, so a
//!   reload replays the same signed runs

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{
    load_value, pending_writes, store_core, SessionWrite, Store, StoredMetadata, StoredTransactions, StoredValue,
    WriteOutcome,
};
