// Path: crates/election/src/lib.rs
#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::unimplemented,
        clippy::todo,
        clippy::indexing_slicing
    )
)]

//! Primary election for a cluster of Meridian replicas.
//!
//! Exactly one replica per service wins a lease-bound key under
//! `elect/{service}/leader`; followers watch it and serve redirects. On top
//! of the raw election sits the expected-primary flag, which lets an
//! operator hand leadership to a chosen replica gracefully: the flag holder
//! abdicates the moment the flag stops naming it.

pub mod leadership;
pub mod member;
pub mod primary;

pub use leadership::Leadership;
pub use member::Member;
pub use primary::{claim_expected_primary, expected_primary, transfer_expected_primary, PrimaryGuard};
