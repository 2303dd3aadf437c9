// Path: crates/types/src/config.rs
//! Configuration structs.
//!
//! Loaded from the binary's toml file; every field has a serde default so a
//! partial file works. Durations are plain integers in the unit named by
//! the field, which keeps the file format obvious.

use serde::{Deserialize, Serialize};

use crate::StoreId;

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PdConfig {
    /// Human-readable name of this replica, unique within the PD cluster.
    pub name: String,
    /// URLs clients use to reach this replica.
    pub client_urls: Vec<String>,
    /// Root key prefix for everything this cluster persists.
    pub root_path: String,
    /// Election and lease tuning.
    pub election: ElectionConfig,
    /// Timestamp oracle tuning.
    pub tso: TsoConfig,
    /// Scheduling engine tuning.
    pub schedule: ScheduleConfig,
    /// Replica placement policy.
    pub replication: ReplicationConfig,
}

/// Election and lease tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ElectionConfig {
    /// TTL of the primary's lease. Coordination Store loss causes
    /// step-down within one lease period.
    pub leader_lease_secs: u64,
    /// TTL of the expected-primary flag's lease.
    pub expected_primary_lease_secs: u64,
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            leader_lease_secs: 3,
            expected_primary_lease_secs: 3,
        }
    }
}

/// Timestamp oracle tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TsoConfig {
    /// How far ahead of the in-memory physical clock the persisted window
    /// end is kept, in milliseconds.
    pub save_ahead_ms: u64,
    /// Period of the physical-clock update loop, in milliseconds.
    pub update_physical_interval_ms: u64,
    /// Whether the primary may hand allocation back and forth with
    /// registered delegated TSO replicas.
    pub enable_dynamic_switching: bool,
    /// Period of the delegation discovery check, in milliseconds.
    pub switch_interval_ms: u64,
}

impl Default for TsoConfig {
    fn default() -> Self {
        Self {
            save_ahead_ms: 3000,
            update_physical_interval_ms: 50,
            enable_dynamic_switching: false,
            switch_interval_ms: 5000,
        }
    }
}

/// Scheduling engine tuning. Runtime-mutable on the primary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Period of the region patrol loop, in milliseconds.
    pub patrol_region_interval_ms: u64,
    /// Seconds without a heartbeat before a store counts as down.
    pub max_store_down_secs: u64,
    /// Seconds without a heartbeat before a store counts as disconnected.
    pub store_disconnect_secs: u64,
    /// Concurrent leader operators allowed cluster-wide.
    pub leader_schedule_limit: u64,
    /// Concurrent region operators allowed cluster-wide.
    pub region_schedule_limit: u64,
    /// Concurrent hot-region operators allowed cluster-wide.
    pub hot_region_schedule_limit: u64,
    /// Concurrent merge operators allowed cluster-wide.
    pub merge_schedule_limit: u64,
    /// Regions at or below this size (MiB) are merge candidates.
    pub max_merge_region_size_mb: u64,
    /// Regions at or below this key count are merge candidates.
    pub max_merge_region_keys: u64,
    /// Default add-peer admission rate per store, tokens per minute.
    pub store_limit_add_peer_per_min: f64,
    /// Default remove-peer admission rate per store, tokens per minute.
    pub store_limit_remove_peer_per_min: f64,
    /// Compile membership repairs into single joint-consensus operators.
    pub enable_joint_consensus: bool,
    /// Balance tolerance: source/target score ratio below which balancing
    /// is not worth a move.
    pub tolerant_balance_ratio: f64,
    /// Slow score at which a store is flagged slow.
    pub slow_store_score_threshold: u64,
    /// Number of region-heartbeat ingest workers.
    pub heartbeat_workers: usize,
    /// Capacity of the region synchronizer's update ring.
    pub region_sync_ring_capacity: usize,
    /// Hot scheduler rank formula, `v1` or `v2`.
    pub hot_rank_formula_version: String,
    /// Dimension priorities for the hot write scheduler.
    pub hot_write_priorities: Vec<String>,
    /// Dimension priorities for the hot read scheduler.
    pub hot_read_priorities: Vec<String>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            patrol_region_interval_ms: 100,
            max_store_down_secs: 1800,
            store_disconnect_secs: 20,
            leader_schedule_limit: 4,
            region_schedule_limit: 2048,
            hot_region_schedule_limit: 4,
            merge_schedule_limit: 8,
            max_merge_region_size_mb: 20,
            max_merge_region_keys: 200_000,
            store_limit_add_peer_per_min: 15.0,
            store_limit_remove_peer_per_min: 15.0,
            enable_joint_consensus: true,
            tolerant_balance_ratio: 1.05,
            slow_store_score_threshold: 80,
            heartbeat_workers: 4,
            region_sync_ring_capacity: 10_000,
            hot_rank_formula_version: "v2".to_string(),
            hot_write_priorities: vec!["byte".to_string(), "key".to_string()],
            hot_read_priorities: vec!["query".to_string(), "byte".to_string()],
        }
    }
}

/// Replica placement policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Replicas per region when placement rules are disabled, and the
    /// count of the default rule when they are enabled.
    pub max_replicas: usize,
    /// Ordered label keys used for isolation diversification.
    pub location_labels: Vec<String>,
    /// Label key replicas must differ on; empty disables the requirement.
    pub isolation_level: String,
    /// Whether the placement rule engine is active. When false the legacy
    /// fixed-replica-count checker runs instead.
    pub enable_placement_rules: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_replicas: 3,
            location_labels: Vec::new(),
            isolation_level: String::new(),
            enable_placement_rules: true,
        }
    }
}

/// A half-open key range, used by grant/evict scheduler configs and the
/// region labeler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct KeyRange {
    /// Inclusive start boundary; empty means -∞.
    pub start_key: crate::Key,
    /// Exclusive end boundary; empty means +∞.
    pub end_key: crate::Key,
}

impl KeyRange {
    /// The full key space.
    pub fn full() -> Self {
        Self::default()
    }

    /// Whether `key` lies in the range.
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_slice()
            && (self.end_key.is_empty() || key < self.end_key.as_slice())
    }

    /// Whether the range fully covers `[start, end)`.
    pub fn covers(&self, start: &[u8], end: &[u8]) -> bool {
        self.start_key.as_slice() <= start
            && (self.end_key.is_empty() || (!end.is_empty() && end <= self.end_key.as_slice()))
    }

    /// Whether the range intersects `[start, end)`.
    pub fn intersects(&self, start: &[u8], end: &[u8]) -> bool {
        let this_ends_after = self.end_key.is_empty() || self.end_key.as_slice() > start;
        let other_ends_after = end.is_empty() || end > self.start_key.as_slice();
        this_ends_after && other_ends_after
    }
}

/// Per-store weights applied to balance scoring, set by admin command.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StoreWeight {
    /// The store the weights apply to.
    pub store_id: StoreId,
    /// Divisor on the leader score; higher attracts more leaders.
    pub leader_weight: f64,
    /// Divisor on the region score; higher attracts more regions.
    pub region_weight: f64,
}

impl Default for StoreWeight {
    fn default() -> Self {
        Self {
            store_id: 0,
            leader_weight: 1.0,
            region_weight: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = PdConfig::default();
        assert_eq!(c.election.leader_lease_secs, 3);
        assert_eq!(c.tso.save_ahead_ms, 3000);
        assert_eq!(c.tso.update_physical_interval_ms, 50);
        assert_eq!(c.replication.max_replicas, 3);
        assert!(c.replication.enable_placement_rules);
    }

    #[test]
    fn key_range_cover_and_intersect() {
        let r = KeyRange {
            start_key: b"b".to_vec(),
            end_key: b"m".to_vec(),
        };
        assert!(r.contains(b"b"));
        assert!(!r.contains(b"m"));
        assert!(r.covers(b"c", b"d"));
        assert!(!r.covers(b"c", b""));
        assert!(r.intersects(b"l", b"z"));
        assert!(!r.intersects(b"m", b"z"));
        assert!(KeyRange::full().covers(b"", b""));
    }
}
