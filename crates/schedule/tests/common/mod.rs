// Path: crates/schedule/tests/common/mod.rs
//! Shared fixtures for the scheduling test suites.

use std::sync::Arc;

use meridian_cluster::{Cluster, ClusterOptions, RegionInfo};
use meridian_schedule::SharedCluster;
use meridian_store::{CoordKv, MemStore};
use meridian_types::config::{ReplicationConfig, ScheduleConfig};
use meridian_types::stats::StoreStats;
use meridian_types::{Peer, RegionEpoch, RegionMeta, StoreId, StoreLabel, StoreMeta, StoreState};

/// A cluster whose stores are Up, labelled, and freshly heartbeated.
pub async fn cluster_with_stores(stores: &[(StoreId, &[(&str, &str)])]) -> SharedCluster {
    let kv: Arc<dyn CoordKv> = Arc::new(MemStore::new());
    let core = Arc::new(Cluster::new(kv, ClusterOptions::default()));
    let (first_id, _) = stores.first().copied().unwrap_or((1, &[]));
    core.bootstrap(
        1,
        store_meta(first_id, &format!("mock://s:{first_id}"), stores.first().map(|(_, l)| *l).unwrap_or(&[])),
        RegionMeta {
            id: 1,
            epoch: RegionEpoch::new(1, 1),
            peers: vec![Peer::voter(1, first_id)],
            ..Default::default()
        },
    )
    .await
    .unwrap();
    for (id, labels) in stores.iter().skip(1) {
        core.put_store(store_meta(*id, &format!("mock://s:{id}"), labels))
            .await
            .unwrap();
    }
    for (id, _) in stores {
        core.handle_store_heartbeat(StoreStats {
            store_id: *id,
            capacity: 1 << 40,
            available: 1 << 39,
            ..Default::default()
        })
        .unwrap();
    }
    SharedCluster::new(core, ScheduleConfig::default(), ReplicationConfig::default())
}

pub fn store_meta(id: StoreId, addr: &str, labels: &[(&str, &str)]) -> StoreMeta {
    StoreMeta {
        id,
        address: addr.to_string(),
        version: "1.0.0".to_string(),
        state: StoreState::Up,
        labels: labels
            .iter()
            .map(|(k, v)| StoreLabel {
                key: k.to_string(),
                value: v.to_string(),
            })
            .collect(),
        ..Default::default()
    }
}

/// A region led from the first listed store, covering the whole space.
pub fn region_on(id: u64, peer_base: u64, stores: &[StoreId]) -> RegionInfo {
    region_in(id, peer_base, stores, b"", b"")
}

/// A region led from the first listed store, covering `[start, end)`.
pub fn region_in(
    id: u64,
    peer_base: u64,
    stores: &[StoreId],
    start: &[u8],
    end: &[u8],
) -> RegionInfo {
    let peers: Vec<Peer> = stores
        .iter()
        .enumerate()
        .map(|(i, s)| Peer::voter(peer_base + i as u64, *s))
        .collect();
    RegionInfo {
        leader: peers.first().cloned(),
        meta: RegionMeta {
            id,
            start_key: start.to_vec(),
            end_key: end.to_vec(),
            epoch: RegionEpoch::new(1, 1),
            peers,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Installs a region directly into the core index.
pub fn install(cluster: &SharedCluster, region: RegionInfo) {
    cluster.core.apply_synced_region(region).unwrap();
}
