// Path: crates/types/src/lib.rs
#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! # Meridian Types
//!
//! The base crate of the Meridian placement driver. It defines the cluster
//! data model (stores, regions, peers, epochs), the error taxonomy shared
//! by every component, the persisted key layout under the Coordination
//! Store, and the configuration structs loaded by the binary.
//!
//! Nothing in this crate performs I/O; higher crates own all behavior.

/// Canonical serialization helpers for persisted metadata.
pub mod codec;
/// Configuration structs for the server, election, TSO, and scheduling.
pub mod config;
/// The shared error taxonomy and the `ErrorCode` trait.
pub mod error;
/// Builders for every key persisted in the Coordination Store.
pub mod keys;
/// Store, region, and peer metadata.
pub mod meta;
/// Heartbeat-carried statistics for stores and regions.
pub mod stats;
/// The 64-bit cluster timestamp representation.
pub mod timestamp;

pub use error::{ErrorCode, PdError, Result};
pub use meta::{
    NodeState, Peer, PeerRole, RegionEpoch, RegionMeta, StoreLabel, StoreMeta, StoreState,
};
pub use timestamp::Timestamp;

/// Identifier of a region.
pub type RegionId = u64;
/// Identifier of a store.
pub type StoreId = u64;
/// Identifier of a peer.
pub type PeerId = u64;
/// Identifier of a keyspace (logical tenant namespace).
pub type KeyspaceId = u32;
/// A raw region boundary key.
pub type Key = Vec<u8>;

/// The keyspace every un-namespaced client operates in.
pub const DEFAULT_KEYSPACE_ID: KeyspaceId = 0;
