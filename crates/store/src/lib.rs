// Path: crates/store/src/lib.rs
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

//! The Coordination Store contract and its in-process implementation.
//!
//! Everything Meridian persists goes through the [`CoordKv`] trait: a
//! strongly-consistent KV store with revisions, ranged scans, prefix
//! watches, leases, and compare-and-swap transactions. An etcd-like system
//! satisfies the contract; [`MemStore`] implements it in-process with the
//! same semantics and backs both embedded deployments and the test suites.

pub mod kv;
pub mod mem;
pub mod txn;

pub use kv::{Compare, CoordKv, KeyValue, LeaseId, Op, TxnOutcome, WatchEvent};
pub use mem::MemStore;
pub use txn::{run_in_txn, SlowCommitHook, TxnSession, MAX_TXN_RETRIES};
