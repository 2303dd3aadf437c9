// Path: crates/schedule/src/informer.rs
//! The read-only cluster view the scheduling engine works against.
//!
//! Checkers and schedulers never touch the cluster core directly; they see
//! it through [`ClusterInformer`]. The server hands them a
//! [`SharedCluster`]; tests hand them the same thing built over an
//! in-memory core.

use std::sync::Arc;

use meridian_cluster::{Cluster, RegionInfo, StoreInfo};
use meridian_types::config::{KeyRange, ReplicationConfig, ScheduleConfig};
use meridian_types::{RegionId, StoreId};
use parking_lot::RwLock;

/// Read view plus the two flags the engine is allowed to flip.
pub trait ClusterInformer: Send + Sync {
    fn get_stores(&self) -> Vec<Arc<StoreInfo>>;
    fn get_store(&self, id: StoreId) -> Option<Arc<StoreInfo>>;
    fn get_region(&self, id: RegionId) -> Option<Arc<RegionInfo>>;
    fn get_region_by_key(&self, key: &[u8]) -> Option<Arc<RegionInfo>>;
    fn scan_regions(&self, start: &[u8], end: &[u8], limit: usize) -> Vec<Arc<RegionInfo>>;
    fn all_regions(&self) -> Vec<Arc<RegionInfo>>;
    fn adjacent_after(&self, region: &RegionInfo) -> Option<Arc<RegionInfo>>;
    fn adjacent_before(&self, region: &RegionInfo) -> Option<Arc<RegionInfo>>;
    fn random_leader_region(&self, store: StoreId, ranges: &[KeyRange]) -> Option<Arc<RegionInfo>>;
    fn random_follower_region(&self, store: StoreId, ranges: &[KeyRange])
        -> Option<Arc<RegionInfo>>;
    fn store_leader_count(&self, store: StoreId) -> usize;
    fn store_region_count(&self, store: StoreId) -> usize;
    fn schedule_config(&self) -> ScheduleConfig;
    fn replication_config(&self) -> ReplicationConfig;
    /// Flips the evict-leader stickiness flag on a store.
    fn set_pause_leader_transfer_in(&self, store: StoreId, paused: bool);
}

/// The concrete view: the cluster core plus runtime-mutable configs.
#[derive(Clone)]
pub struct SharedCluster {
    pub core: Arc<Cluster>,
    pub schedule: Arc<RwLock<ScheduleConfig>>,
    pub replication: Arc<RwLock<ReplicationConfig>>,
}

impl SharedCluster {
    pub fn new(
        core: Arc<Cluster>,
        schedule: ScheduleConfig,
        replication: ReplicationConfig,
    ) -> Self {
        Self {
            core,
            schedule: Arc::new(RwLock::new(schedule)),
            replication: Arc::new(RwLock::new(replication)),
        }
    }
}

impl ClusterInformer for SharedCluster {
    fn get_stores(&self) -> Vec<Arc<StoreInfo>> {
        self.core.get_all_stores()
    }

    fn get_store(&self, id: StoreId) -> Option<Arc<StoreInfo>> {
        self.core.get_store(id).ok()
    }

    fn get_region(&self, id: RegionId) -> Option<Arc<RegionInfo>> {
        self.core.get_region_by_id(id).ok()
    }

    fn get_region_by_key(&self, key: &[u8]) -> Option<Arc<RegionInfo>> {
        self.core.get_region_by_key(key)
    }

    fn scan_regions(&self, start: &[u8], end: &[u8], limit: usize) -> Vec<Arc<RegionInfo>> {
        self.core.scan_regions(start, end, limit)
    }

    fn all_regions(&self) -> Vec<Arc<RegionInfo>> {
        self.core.all_regions()
    }

    fn adjacent_after(&self, region: &RegionInfo) -> Option<Arc<RegionInfo>> {
        self.core.get_adjacent_after(region)
    }

    fn adjacent_before(&self, region: &RegionInfo) -> Option<Arc<RegionInfo>> {
        self.core
            .get_prev_region(region.start_key())
            .filter(|prev| prev.end_key() == region.start_key())
    }

    fn random_leader_region(&self, store: StoreId, ranges: &[KeyRange]) -> Option<Arc<RegionInfo>> {
        self.core.random_leader_region(store, ranges)
    }

    fn random_follower_region(
        &self,
        store: StoreId,
        ranges: &[KeyRange],
    ) -> Option<Arc<RegionInfo>> {
        self.core.random_follower_region(store, ranges)
    }

    fn store_leader_count(&self, store: StoreId) -> usize {
        self.core.store_leader_count(store)
    }

    fn store_region_count(&self, store: StoreId) -> usize {
        self.core.store_region_count(store)
    }

    fn schedule_config(&self) -> ScheduleConfig {
        self.schedule.read().clone()
    }

    fn replication_config(&self) -> ReplicationConfig {
        self.replication.read().clone()
    }

    fn set_pause_leader_transfer_in(&self, store: StoreId, paused: bool) {
        let _ = self.core.pause_leader_transfer_in(store, paused);
    }
}
