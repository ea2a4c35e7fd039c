//! # coweave keys
//!
//! Groups, roles and read keys, and the decrypted view of a CoValue.
//!
//! ## Overview
//!
//! Permissions are not flags. A group is itself a CoValue whose map content
//! (member roles, sealed and wrapped read keys, parent links) is replayed in
//! canonical order, admitting only the ops the author's role allows at that
//! point. Values owned by a group inherit its members' roles.
//!
//! ## Key Concepts
//!
//! - **Role**: admin, writer, reader, writeOnly or revoked, per member
//! - **Read key**: a symmetric key ([`KeySecret`]) encrypting private transactions
//! - **Reveal**: a read key sealed to a member agent via X25519
//! - **Wrap**: an older read key encrypted under a newer one, or a parent's key
//!   under a child's
//!
//! ## Key Resolution
//!
//! A reader resolves a key id through [`KeyResolver`], trying in order the
//! key revealed to everyone, a key sealed to one of the reader's actors, and
//! any wrapping keys in the group and its parents. Results are cached per
//! group in [`KeyCaches`], owned by the caller.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use coweave_core::{AgentSecret, CoValueCore, CoValueHeader, CoValueType, Privacy, Ruleset};
//! use coweave_keys::{create_group, make_transaction, LocalIdentity};
//!
//! let admin = LocalIdentity::for_agent(AgentSecret::generate());
//! let (group, key_id, secret) = create_group(&admin, 1).unwrap();
//! let mut doc = CoValueCore::new(CoValueHeader::new(
//!     CoValueType::Comap,
//!     Ruleset::OwnedByGroup { group: group.id() },
//! ));
//! make_transaction(&mut doc, &admin, &[], Privacy::Private, Some((&key_id, &secret)), 2).unwrap();
//! ```

pub mod account;
pub mod crypto;
pub mod error;
pub mod group;
pub mod keyshare;
pub mod make;
pub mod permissions;
pub mod resolver;
pub mod view;

pub use account::{create_account, resolve_account_agent, LocalIdentity};
pub use crypto::{
    decrypt_for_transaction, encrypt_for_transaction, unwrap_key_secret, wrap_key_secret,
    KeySecret,
};
pub use error::{KeysError, Result};
pub use group::{
    add_everyone, add_member, create_group, extend_parent, rotate_read_key, Directory,
    GroupContent, GroupEntry, GroupSource, MapOp, Role, EVERYONE, MAX_GROUP_DEPTH, READ_KEY,
};
pub use keyshare::{seal_key, unseal_key, SealContext};
pub use make::make_transaction;
pub use permissions::{dependencies, is_author_permitted};
pub use resolver::{KeyCache, KeyCaches, KeyResolver};
pub use view::{
    compare_transactions, get_valid_transactions, key_group, DecryptCache, DecryptedTransaction,
    ValidTransactionsOptions,
};
