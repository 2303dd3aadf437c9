// Path: crates/types/src/keys.rs
//! Builders for every key persisted in the Coordination Store.
//!
//! Centralizing the layout here keeps the namespace stable: components
//! never format paths themselves. Numeric path segments are zero-padded to
//! 20 digits so lexicographic range scans return IDs in numeric order.

use crate::{KeyspaceId, RegionId, StoreId};

/// Cluster metadata blob (cluster ID, version, external timestamp).
pub const CLUSTER_META: &str = "/cluster/meta";
/// Persisted end of the current ID-allocator batch.
pub const ALLOC_ID: &str = "/alloc_id";

fn padded(id: u64) -> String {
    format!("{id:020}")
}

/// Store metadata.
pub fn store_path(id: StoreId) -> String {
    format!("/cluster/store/{}", padded(id))
}

/// Prefix of all store metadata, for the boot-time batched load.
pub const STORE_PREFIX: &str = "/cluster/store/";

/// Region metadata.
pub fn region_path(id: RegionId) -> String {
    format!("/cluster/region/{}", padded(id))
}

/// Prefix of all region metadata, for the boot-time batched load.
pub const REGION_PREFIX: &str = "/cluster/region/";

/// Persisted TSO window end for a timestamp group.
pub fn timestamp_path(group: &str) -> String {
    format!("/timestamp/{group}")
}

/// The default timestamp group.
pub const DEFAULT_TSO_GROUP: &str = "global";

/// Per-keyspace GC safe point (hex-encoded u64).
pub fn gc_safe_point_path(keyspace: KeyspaceId) -> String {
    format!("/gc/safe_point/{keyspace}")
}

/// One service safe point (JSON blob).
pub fn service_safe_point_path(keyspace: KeyspaceId, service_id: &str) -> String {
    format!("/gc/safe_point/service/{keyspace}/{service_id}")
}

/// Prefix of a keyspace's service safe points.
pub fn service_safe_point_prefix(keyspace: KeyspaceId) -> String {
    format!("/gc/safe_point/service/{keyspace}/")
}

/// Resource group settings.
pub fn resource_group_settings_path(keyspace: KeyspaceId, name: &str) -> String {
    format!("/resource_group/settings/{keyspace}/{name}")
}

/// Resource group running state.
pub fn resource_group_states_path(keyspace: KeyspaceId, name: &str) -> String {
    format!("/resource_group/states/{keyspace}/{name}")
}

/// Prefix of all resource group settings.
pub const RESOURCE_GROUP_SETTINGS_PREFIX: &str = "/resource_group/settings/";

/// One placement rule.
pub fn placement_rule_path(group: &str, id: &str) -> String {
    format!("/placement_rule/{group}/{id}")
}

/// Prefix of all placement rules.
pub const PLACEMENT_RULE_PREFIX: &str = "/placement_rule/";

/// One region label rule.
pub fn region_label_path(id: &str) -> String {
    format!("/region_label/{id}")
}

/// Prefix of all region label rules.
pub const REGION_LABEL_PREFIX: &str = "/region_label/";

/// A scheduler's private config blob.
pub fn scheduler_config_path(name: &str) -> String {
    format!("/schedulers/{name}")
}

/// Prefix of all scheduler config blobs.
pub const SCHEDULER_CONFIG_PREFIX: &str = "/schedulers/";

/// The lease-bound leader key of an election service.
pub fn election_leader_path(service: &str) -> String {
    format!("/elect/{service}/leader")
}

/// The expected-primary flag of an election service.
pub fn expected_primary_path(service: &str) -> String {
    format!("/elect/{service}/primary/expected")
}

/// One replica's participant registration.
pub fn election_participant_path(service: &str, name: &str) -> String {
    format!("/elect/{service}/participant/{name}")
}

/// Prefix of a service's participant registrations.
pub fn election_participant_prefix(service: &str) -> String {
    format!("/elect/{service}/participant/")
}

/// Registration prefix for delegated TSO replicas.
pub const TSO_DISCOVERY_PREFIX: &str = "/discovery/tso/";

/// One delegated TSO replica's registration.
pub fn tso_discovery_path(addr: &str) -> String {
    format!("/discovery/tso/{addr}")
}

/// Persisted minimum resolved timestamp of the cluster.
pub const MIN_RESOLVED_TS: &str = "/cluster/min_resolved_ts";

/// Upper bound (exclusive) for a prefix range scan.
///
/// Works by incrementing the last byte; the prefixes in this module all end
/// in `/` or alphanumerics, far from `0xff`.
pub fn range_end_of_prefix(prefix: &str) -> String {
    let mut bytes = prefix.as_bytes().to_vec();
    if let Some(last) = bytes.last_mut() {
        *last += 1;
    }
    String::from_utf8(bytes).unwrap_or_else(|_| prefix.to_string())
}
