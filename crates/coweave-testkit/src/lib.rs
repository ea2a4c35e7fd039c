//! # coweave testkit
//!
//! Testing utilities for coweave.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: identities, stores, groups and populated CoValues
//! - **Generators**: Proptest strategies for property-based testing
//!
//! ## Property Testing
//!
//! Use the generators with proptest:
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use coweave_testkit::generators::{covalue_from_plan, SessionPlan};
//!
//! proptest! {
//!     #[test]
//!     fn known_state_counts_everything(plan: SessionPlan) {
//!         let core = covalue_from_plan(&plan);
//!         prop_assert_eq!(core.known_state().total() as usize, plan.transaction_count());
//!     }
//! }
//! ```
//!
//! ## Test Fixtures
//!
//! Quickly set up test scenarios:
//!
//! ```rust
//! use coweave_testkit::fixtures::TestFixture;
//!
//! let fixture = TestFixture::new();
//! let core = fixture.populated("my-map", 5);
//! assert_eq!(core.known_state().count(fixture.session()), 5);
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{multi_party_fixtures, padded_transaction, TestFixture};
pub use generators::{covalue_from_plan, SessionPlan};
