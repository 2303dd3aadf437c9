// Path: crates/cluster/src/cluster.rs
//! The cluster core: both indexes, bootstrap, and heartbeat acceptance.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use meridian_store::{Compare, CoordKv, Op};
use meridian_types::config::KeyRange;
use meridian_types::stats::StoreStats;
use meridian_types::{codec, keys, PdError, RegionId, RegionMeta, Result, StoreId, StoreMeta, StoreState};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::region::{RegionInfo, RegionSource};
use crate::region_tree::RegionsInfo;
use crate::store_info::StoreInfo;

/// Tunables the cluster core needs from the schedule config.
#[derive(Debug, Clone, Copy)]
pub struct ClusterOptions {
    /// Slow score at which a store is flagged slow.
    pub slow_store_score_threshold: u64,
    /// No heartbeat for this long means down.
    pub max_store_down: Duration,
    /// No heartbeat for this long means disconnected.
    pub disconnect_timeout: Duration,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            slow_store_score_threshold: 80,
            max_store_down: Duration::from_secs(1800),
            disconnect_timeout: Duration::from_secs(20),
        }
    }
}

/// Persisted cluster-level metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ClusterMeta {
    /// The cluster's identity; every RPC header must match it.
    pub cluster_id: u64,
    /// Minimum storage-node version across Up stores.
    pub cluster_version: String,
    /// Externally driven timestamp, never ahead of the TSO.
    pub external_timestamp: u64,
}

/// What accepting one region heartbeat did to the index.
#[derive(Debug, Clone)]
pub struct HeartbeatEffect {
    /// The freshly installed region.
    pub region: Arc<RegionInfo>,
    /// Regions evicted because the new one covers them.
    pub removed: Vec<Arc<RegionInfo>>,
    /// Whether anything beyond flow statistics changed.
    pub meta_changed: bool,
}

/// The cluster state singleton, owned by the server and passed by
/// reference into every subsystem.
pub struct Cluster {
    kv: Arc<dyn CoordKv>,
    opts: ClusterOptions,
    meta: RwLock<Option<ClusterMeta>>,
    stores: RwLock<AHashMap<StoreId, Arc<StoreInfo>>>,
    regions: RwLock<RegionsInfo>,
    min_resolved: RwLock<AHashMap<StoreId, u64>>,
}

impl Cluster {
    pub fn new(kv: Arc<dyn CoordKv>, opts: ClusterOptions) -> Self {
        Self {
            kv,
            opts,
            meta: RwLock::new(None),
            stores: RwLock::new(AHashMap::new()),
            regions: RwLock::new(RegionsInfo::new()),
            min_resolved: RwLock::new(AHashMap::new()),
        }
    }

    pub fn options(&self) -> ClusterOptions {
        self.opts
    }

    // ---- bootstrap and boot-time load ----

    pub fn is_bootstrapped(&self) -> bool {
        self.meta.read().is_some()
    }

    pub fn cluster_id(&self) -> Option<u64> {
        self.meta.read().as_ref().map(|m| m.cluster_id)
    }

    /// Idempotence gate and first write of a cluster's life: installs the
    /// meta, the first store, and the whole-keyspace first region in one
    /// transaction. A lost race or a second call reports
    /// `AlreadyBootstrapped`.
    pub async fn bootstrap(
        &self,
        cluster_id: u64,
        store: StoreMeta,
        region: RegionMeta,
    ) -> Result<()> {
        region.validate()?;
        if store.address.is_empty() {
            return Err(PdError::InvalidInput("store address must not be empty".into()));
        }
        let meta = ClusterMeta {
            cluster_id,
            cluster_version: store.version.clone(),
            external_timestamp: 0,
        };
        let outcome = self
            .kv
            .txn(
                vec![Compare::ValueEquals(keys::CLUSTER_META.to_string(), None)],
                vec![
                    Op::Put {
                        key: keys::CLUSTER_META.to_string(),
                        value: codec::to_json_bytes(&meta)?,
                        lease: None,
                    },
                    Op::Put {
                        key: keys::store_path(store.id),
                        value: codec::to_json_bytes(&store)?,
                        lease: None,
                    },
                    Op::Put {
                        key: keys::region_path(region.id),
                        value: codec::to_json_bytes(&region)?,
                        lease: None,
                    },
                ],
                vec![],
            )
            .await?;
        if !outcome.succeeded {
            return Err(PdError::AlreadyBootstrapped);
        }
        *self.meta.write() = Some(meta);
        let mut store_info = StoreInfo::new(store);
        store_info.last_persisted = Some(Instant::now());
        self.stores
            .write()
            .insert(store_info.id(), Arc::new(store_info));
        let mut region_info = RegionInfo::new(region);
        region_info.source = RegionSource::Storage;
        self.regions.write().set_region(Arc::new(region_info));
        info!(target: "cluster", cluster_id, "cluster bootstrapped");
        Ok(())
    }

    /// Loads just the cluster meta, if present. Followers use this to
    /// learn the cluster ID without loading the full state.
    pub async fn load_meta(&self) -> Result<Option<ClusterMeta>> {
        if let Some(meta) = self.meta.read().clone() {
            return Ok(Some(meta));
        }
        let meta = match self.kv.load(keys::CLUSTER_META).await? {
            Some(bytes) => Some(codec::from_json_bytes::<ClusterMeta>(&bytes)?),
            None => None,
        };
        if let Some(meta) = &meta {
            *self.meta.write() = Some(meta.clone());
        }
        Ok(meta)
    }

    /// Boot-time batched load of meta, stores, and regions. Called when a
    /// replica starts or wins leadership.
    pub async fn load_from_store(&self) -> Result<()> {
        let meta = match self.kv.load(keys::CLUSTER_META).await? {
            Some(bytes) => Some(codec::from_json_bytes::<ClusterMeta>(&bytes)?),
            None => None,
        };
        let mut stores = AHashMap::new();
        let end = keys::range_end_of_prefix(keys::STORE_PREFIX);
        for kv in self.kv.load_range(keys::STORE_PREFIX, &end, 0).await? {
            let store_meta: StoreMeta = codec::from_json_bytes(&kv.value)?;
            stores.insert(store_meta.id, Arc::new(StoreInfo::new(store_meta)));
        }
        let mut regions = RegionsInfo::new();
        let end = keys::range_end_of_prefix(keys::REGION_PREFIX);
        for kv in self.kv.load_range(keys::REGION_PREFIX, &end, 0).await? {
            let region_meta: RegionMeta = codec::from_json_bytes(&kv.value)?;
            let mut info = RegionInfo::new(region_meta);
            info.source = RegionSource::Storage;
            regions.set_region(Arc::new(info));
        }
        let store_count = stores.len();
        let region_count = regions.len();
        *self.meta.write() = meta;
        *self.stores.write() = stores;
        *self.regions.write() = regions;
        info!(target: "cluster", store_count, region_count, "cluster state loaded");
        Ok(())
    }

    // ---- stores ----

    pub fn get_store(&self, id: StoreId) -> Result<Arc<StoreInfo>> {
        self.stores
            .read()
            .get(&id)
            .cloned()
            .ok_or(PdError::StoreNotFound(id))
    }

    pub fn get_all_stores(&self) -> Vec<Arc<StoreInfo>> {
        let mut stores: Vec<_> = self.stores.read().values().cloned().collect();
        stores.sort_by_key(|s| s.id());
        stores
    }

    /// Registers or updates a store. An address duplicating any
    /// non-tombstone store is rejected.
    pub async fn put_store(&self, meta: StoreMeta) -> Result<()> {
        if meta.id == 0 {
            return Err(PdError::InvalidInput("store id must not be 0".into()));
        }
        if meta.address.is_empty() {
            return Err(PdError::InvalidInput("store address must not be empty".into()));
        }
        {
            let stores = self.stores.read();
            if let Some(dup) = stores.values().find(|s| {
                s.id() != meta.id && s.meta.address == meta.address && !s.meta.is_tombstone()
            }) {
                return Err(PdError::InvalidInput(format!(
                    "address {:?} already used by store {}",
                    meta.address,
                    dup.id()
                )));
            }
        }
        let updated = {
            let stores = self.stores.read();
            match stores.get(&meta.id) {
                Some(existing) => {
                    // State transitions are owned by admin commands, not
                    // by re-registration.
                    let mut next = (**existing).clone();
                    let preserved_state = next.meta.state;
                    let preserved_node_state = next.meta.node_state;
                    next.meta = meta;
                    next.meta.state = preserved_state;
                    next.meta.node_state = preserved_node_state;
                    next
                }
                None => StoreInfo::new(meta),
            }
        };
        self.persist_store(&updated).await?;
        self.stores
            .write()
            .insert(updated.id(), Arc::new(updated));
        self.refresh_cluster_version().await?;
        Ok(())
    }

    /// Starts draining a store: Up → Offline. With `physically_destroyed`
    /// the checkers replace its peers without waiting for the down timeout.
    pub async fn delete_store(&self, id: StoreId, physically_destroyed: bool) -> Result<()> {
        let next = {
            let stores = self.stores.read();
            let store = stores.get(&id).ok_or(PdError::StoreNotFound(id))?;
            match store.meta.state {
                StoreState::Up => {}
                StoreState::Offline => return Ok(()),
                StoreState::Tombstone => {
                    return Err(PdError::InvalidInput(format!("store {id} is a tombstone")))
                }
            }
            let mut next = (**store).clone();
            next.meta.state = StoreState::Offline;
            next.meta.node_state = meridian_types::NodeState::Removing;
            next.meta.physically_destroyed = physically_destroyed;
            next
        };
        self.persist_store(&next).await?;
        self.stores.write().insert(id, Arc::new(next));
        info!(target: "cluster", store_id = id, physically_destroyed, "store set offline");
        Ok(())
    }

    /// Finishes removal of a drained store: Offline → Tombstone. Refused
    /// while the store still hosts peers.
    pub async fn bury_store(&self, id: StoreId) -> Result<()> {
        let hosted = self.regions.read().store_region_count(id);
        if hosted > 0 {
            return Err(PdError::InvalidInput(format!(
                "store {id} still hosts {hosted} regions"
            )));
        }
        let next = {
            let stores = self.stores.read();
            let store = stores.get(&id).ok_or(PdError::StoreNotFound(id))?;
            let mut next = (**store).clone();
            next.meta.state = StoreState::Tombstone;
            next.meta.node_state = meridian_types::NodeState::Removed;
            next
        };
        self.persist_store(&next).await?;
        self.stores.write().insert(id, Arc::new(next));
        self.refresh_cluster_version().await?;
        Ok(())
    }

    /// Drops all tombstone stores, returning the IDs removed.
    pub async fn remove_tombstone_stores(&self) -> Result<Vec<StoreId>> {
        let victims: Vec<StoreId> = self
            .stores
            .read()
            .values()
            .filter(|s| s.meta.is_tombstone())
            .map(|s| s.id())
            .collect();
        for id in &victims {
            self.kv.remove(&keys::store_path(*id)).await?;
        }
        let mut stores = self.stores.write();
        for id in &victims {
            stores.remove(id);
        }
        Ok(victims)
    }

    /// Adjusts a store's balance weights.
    pub async fn set_store_weight(
        &self,
        id: StoreId,
        leader_weight: f64,
        region_weight: f64,
    ) -> Result<()> {
        if leader_weight <= 0.0 || region_weight <= 0.0 {
            return Err(PdError::InvalidInput("weights must be positive".into()));
        }
        let next = {
            let stores = self.stores.read();
            let store = stores.get(&id).ok_or(PdError::StoreNotFound(id))?;
            let mut next = (**store).clone();
            next.leader_weight = leader_weight;
            next.region_weight = region_weight;
            next
        };
        self.stores.write().insert(id, Arc::new(next));
        Ok(())
    }

    /// Sets or clears the inbound leader-transfer pause flag.
    pub fn pause_leader_transfer_in(&self, id: StoreId, paused: bool) -> Result<()> {
        let mut stores = self.stores.write();
        let store = stores.get(&id).ok_or(PdError::StoreNotFound(id))?;
        let mut next = (**store).clone();
        next.pause_leader_transfer_in = paused;
        stores.insert(id, Arc::new(next));
        Ok(())
    }

    /// Accepts a store heartbeat; returns the damaged region IDs, which
    /// the caller turns into remove-peer admin operators.
    pub fn handle_store_heartbeat(&self, stats: StoreStats) -> Result<Vec<RegionId>> {
        let mut stores = self.stores.write();
        let store = stores
            .get(&stats.store_id)
            .ok_or(PdError::StoreNotFound(stats.store_id))?;
        let mut next = (**store).clone();
        next.slow = stats.slow_score >= self.opts.slow_store_score_threshold;
        next.last_heartbeat = Some(Instant::now());
        let damaged = stats.damaged_region_ids.clone();
        next.stats = stats;
        stores.insert(next.id(), Arc::new(next));
        if !damaged.is_empty() {
            warn!(target: "cluster", regions = ?damaged, "store reported damaged regions");
        }
        Ok(damaged)
    }

    // ---- regions ----

    pub fn get_region_by_id(&self, id: RegionId) -> Result<Arc<RegionInfo>> {
        self.regions
            .read()
            .get(id)
            .ok_or(PdError::RegionNotFound(id))
    }

    pub fn get_region_by_key(&self, key: &[u8]) -> Option<Arc<RegionInfo>> {
        self.regions.read().find_containing(key)
    }

    pub fn get_prev_region(&self, key: &[u8]) -> Option<Arc<RegionInfo>> {
        self.regions.read().find_previous(key)
    }

    pub fn get_adjacent_after(&self, region: &RegionInfo) -> Option<Arc<RegionInfo>> {
        self.regions.read().find_adjacent_after(region)
    }

    pub fn scan_regions(&self, start: &[u8], end: &[u8], limit: usize) -> Vec<Arc<RegionInfo>> {
        self.regions.read().scan(start, end, limit)
    }

    pub fn all_regions(&self) -> Vec<Arc<RegionInfo>> {
        self.regions.read().all()
    }

    pub fn region_count(&self) -> usize {
        self.regions.read().len()
    }

    pub fn store_leader_count(&self, id: StoreId) -> usize {
        self.regions.read().store_leader_count(id)
    }

    pub fn store_region_count(&self, id: StoreId) -> usize {
        self.regions.read().store_region_count(id)
    }

    pub fn random_leader_region(
        &self,
        id: StoreId,
        ranges: &[KeyRange],
    ) -> Option<Arc<RegionInfo>> {
        self.regions.read().random_leader_region(id, ranges)
    }

    pub fn random_follower_region(
        &self,
        id: StoreId,
        ranges: &[KeyRange],
    ) -> Option<Arc<RegionInfo>> {
        self.regions.read().random_follower_region(id, ranges)
    }

    /// The hottest path in the system: validates a region heartbeat,
    /// installs it, and reports what changed.
    pub async fn handle_region_heartbeat(&self, mut incoming: RegionInfo) -> Result<HeartbeatEffect> {
        incoming.meta.validate()?;
        incoming.source = RegionSource::Heartbeat;
        let (installed, removed, meta_changed) = {
            let mut regions = self.regions.write();
            let epoch = incoming.epoch();
            let meta_changed = match regions.get(incoming.id()) {
                Some(existing) => {
                    if epoch.is_stale_against(&existing.epoch())
                        // A (1, 1) epoch marks an unsafe-recovery rebuild
                        // and overrides staleness.
                        && !(epoch.conf_ver == 1 && epoch.version == 1)
                    {
                        warn!(
                            target: "cluster",
                            region_id = incoming.id(),
                            ?epoch,
                            stored = ?existing.epoch(),
                            "stale region heartbeat rejected"
                        );
                        return Err(PdError::Stale {
                            region_id: incoming.id(),
                            conf_ver: epoch.conf_ver,
                            version: epoch.version,
                        });
                    }
                    incoming.meta_differs_from(&existing)
                }
                None => {
                    // Unknown ID: it must not be older than anything whose
                    // range it claims.
                    for overlap in regions.overlaps(&incoming.meta) {
                        if epoch.version < overlap.epoch().version {
                            return Err(PdError::Stale {
                                region_id: incoming.id(),
                                conf_ver: epoch.conf_ver,
                                version: epoch.version,
                            });
                        }
                    }
                    true
                }
            };
            let installed = Arc::new(incoming);
            let removed = regions.set_region(Arc::clone(&installed));
            (installed, removed, meta_changed)
        };
        if meta_changed {
            self.persist_region(&installed.meta).await?;
            for gone in &removed {
                if gone.id() != installed.id() {
                    self.kv.remove(&keys::region_path(gone.id())).await?;
                }
            }
        }
        Ok(HeartbeatEffect {
            region: installed,
            removed,
            meta_changed,
        })
    }

    /// Follower path: installs a region received from the synchronizer.
    /// No validation beyond shape and no persistence; the primary did both.
    pub fn apply_synced_region(&self, mut region: RegionInfo) -> Result<HeartbeatEffect> {
        region.meta.validate()?;
        region.source = RegionSource::Sync;
        let installed = Arc::new(region);
        let removed = self.regions.write().set_region(Arc::clone(&installed));
        Ok(HeartbeatEffect {
            region: installed,
            removed,
            meta_changed: true,
        })
    }

    // ---- timestamps and versions ----

    /// Records one store's min resolved timestamp.
    pub fn report_min_resolved_ts(&self, store_id: StoreId, ts: u64) -> Result<()> {
        if !self.stores.read().contains_key(&store_id) {
            return Err(PdError::StoreNotFound(store_id));
        }
        self.min_resolved.write().insert(store_id, ts);
        Ok(())
    }

    /// The minimum reported resolved timestamp across Up stores.
    pub fn min_resolved_ts(&self) -> u64 {
        let stores = self.stores.read();
        let reports = self.min_resolved.read();
        stores
            .values()
            .filter(|s| s.meta.is_up())
            .filter_map(|s| reports.get(&s.id()))
            .copied()
            .min()
            .unwrap_or(0)
    }

    pub fn external_timestamp(&self) -> u64 {
        self.meta
            .read()
            .as_ref()
            .map(|m| m.external_timestamp)
            .unwrap_or(0)
    }

    /// Sets the external timestamp. Rejects values ahead of the current
    /// global TSO timestamp (passed in by the caller) and regressions.
    pub async fn set_external_timestamp(&self, ts: u64, current_global: u64) -> Result<()> {
        if ts > current_global {
            return Err(PdError::InvalidInput(format!(
                "external timestamp {ts} is ahead of the global timestamp {current_global}"
            )));
        }
        let updated = {
            let mut meta = self.meta.write();
            let meta = meta.as_mut().ok_or(PdError::NotBootstrapped)?;
            if ts < meta.external_timestamp {
                return Err(PdError::InvalidInput(format!(
                    "external timestamp {ts} regresses from {}",
                    meta.external_timestamp
                )));
            }
            meta.external_timestamp = ts;
            meta.clone()
        };
        self.persist_meta(&updated).await
    }

    pub fn cluster_version(&self) -> String {
        self.meta
            .read()
            .as_ref()
            .map(|m| m.cluster_version.clone())
            .unwrap_or_default()
    }

    async fn refresh_cluster_version(&self) -> Result<()> {
        let min_version = {
            let stores = self.stores.read();
            stores
                .values()
                .filter(|s| s.meta.is_up() && !s.meta.version.is_empty())
                .map(|s| s.meta.version.clone())
                .min_by(|a, b| compare_versions(a, b))
        };
        let Some(min_version) = min_version else {
            return Ok(());
        };
        let updated = {
            let mut meta = self.meta.write();
            match meta.as_mut() {
                Some(m) if m.cluster_version != min_version => {
                    m.cluster_version = min_version;
                    Some(m.clone())
                }
                _ => None,
            }
        };
        if let Some(meta) = updated {
            info!(target: "cluster", version = %meta.cluster_version, "cluster version advanced");
            self.persist_meta(&meta).await?;
        }
        Ok(())
    }

    // ---- persistence ----

    async fn persist_meta(&self, meta: &ClusterMeta) -> Result<()> {
        self.kv
            .save(keys::CLUSTER_META, codec::to_json_bytes(meta)?)
            .await
    }

    async fn persist_region(&self, meta: &RegionMeta) -> Result<()> {
        self.kv
            .save(&keys::region_path(meta.id), codec::to_json_bytes(meta)?)
            .await
    }

    async fn persist_store(&self, store: &StoreInfo) -> Result<()> {
        self.kv
            .save(
                &keys::store_path(store.id()),
                codec::to_json_bytes(&store.meta)?,
            )
            .await
    }
}

/// Dotted-numeric version comparison with lexicographic fallback.
fn compare_versions(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |v: &str| -> Option<Vec<u64>> {
        v.trim_start_matches('v')
            .split('.')
            .map(|part| part.parse::<u64>().ok())
            .collect()
    };
    match (parse(a), parse(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}
