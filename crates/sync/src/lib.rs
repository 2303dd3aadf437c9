// Path: crates/sync/src/lib.rs
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

//! Region state replication from the primary PD to its followers.
//!
//! The primary tags every accepted region update with a monotonic revision
//! and keeps the recent ones in a bounded ring. A follower opens a stream
//! from the revision it last applied; if that revision is still in the
//! ring it gets deltas, otherwise a full snapshot followed by deltas. A
//! caught-up follower therefore sees the exact sequence of region states
//! the primary committed, with everything older than the ring coalesced
//! into the snapshot.

pub mod client;
pub mod server;

pub use client::SyncClient;
pub use server::{RegionSyncer, RegionUpdate, SyncMessage};
