// Path: crates/types/src/stats.rs
//! Heartbeat-carried statistics.
//!
//! Storage nodes report these shapes verbatim; the cluster core folds them
//! into its indexes and the scheduling engine reads them back out.

use serde::{Deserialize, Serialize};

use crate::meta::Peer;
use crate::{Key, RegionId, StoreId};

/// Usage statistics carried by a store heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StoreStats {
    /// Reporting store.
    pub store_id: StoreId,
    /// Total disk capacity in bytes.
    pub capacity: u64,
    /// Free disk in bytes.
    pub available: u64,
    /// Bytes occupied by region data.
    pub used_size: u64,
    /// Number of regions with a peer on this store.
    pub region_count: u64,
    /// Number of regions led from this store.
    pub leader_count: u64,
    /// The node is applying snapshots or otherwise saturated.
    pub is_busy: bool,
    /// Bytes written since the previous heartbeat.
    pub bytes_written: u64,
    /// Keys written since the previous heartbeat.
    pub keys_written: u64,
    /// Bytes read since the previous heartbeat.
    pub bytes_read: u64,
    /// Keys read since the previous heartbeat.
    pub keys_read: u64,
    /// Queries served since the previous heartbeat.
    pub query_num: u64,
    /// Node-computed slowness score in `[1, 100]`; 100 means stuck.
    pub slow_score: u64,
    /// Node-computed slowness trend, when the node supports it.
    pub slow_trend: Option<SlowTrend>,
    /// Regions with replicas the node found unrecoverable on disk.
    pub damaged_region_ids: Vec<RegionId>,
}

/// Direction and magnitude of a store's slowness drift.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct SlowTrend {
    /// Current value of the cause signal (e.g. disk latency).
    pub cause_value: f64,
    /// Rate of change of the cause signal.
    pub cause_rate: f64,
    /// Current value of the result signal (e.g. request latency).
    pub result_value: f64,
    /// Rate of change of the result signal.
    pub result_rate: f64,
}

/// A peer the region leader has not heard from, with how long it has been
/// silent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PeerStats {
    /// The unreachable peer.
    pub peer: Peer,
    /// Seconds since the leader last heard from it.
    pub down_seconds: u64,
}

/// Flow statistics carried by a region heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct RegionStats {
    /// Bytes written in the reporting interval.
    pub written_bytes: u64,
    /// Keys written in the reporting interval.
    pub written_keys: u64,
    /// Bytes read in the reporting interval.
    pub read_bytes: u64,
    /// Keys read in the reporting interval.
    pub read_keys: u64,
    /// Queries served in the reporting interval.
    pub query_num: u64,
    /// Approximate size of the region in bytes.
    pub approximate_size: u64,
    /// Approximate number of keys in the region.
    pub approximate_keys: u64,
}

/// Sub-range statistics: the region's range cut into buckets.
///
/// `keys` holds `n + 1` boundaries for `n` buckets; the per-bucket vectors
/// are parallel to the buckets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Buckets {
    /// Owning region.
    pub region_id: RegionId,
    /// Bucket layout version; newer versions replace older wholesale.
    pub version: u64,
    /// Bucket boundaries, `len() == bucket count + 1`.
    pub keys: Vec<Key>,
    /// Bytes written per bucket.
    pub write_bytes: Vec<u64>,
    /// Bytes read per bucket.
    pub read_bytes: Vec<u64>,
}
