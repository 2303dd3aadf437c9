// Path: crates/resource/src/group.rs
//! Resource groups and per-keyspace service limiters.
//!
//! Settings and running state persist in the Coordination Store; the live
//! token state is in memory. Consumption reports flow through a bounded
//! dispatcher channel into per-group counters that a metrics flusher
//! drains; series untouched for twenty minutes are swept.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use meridian_store::CoordKv;
use meridian_types::{codec, keys, KeyspaceId, PdError, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// The reserved group every keyspace starts with.
pub const DEFAULT_GROUP: &str = "default";
/// Capacity of the consumption dispatcher channel.
pub const CONSUMPTION_CHANNEL_CAPACITY: usize = 1024;

const PERSIST_INTERVAL: Duration = Duration::from_secs(60);
const METRIC_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const METRIC_SERIES_TTL: Duration = Duration::from_secs(20 * 60);
const MAX_GROUP_NAME_LEN: usize = 32;
const MAX_PRIORITY: u32 = 16;

/// How a group's budget is metered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GroupMode {
    /// Unified request units.
    #[default]
    RuPerSec,
    /// Raw CPU/IO accounting.
    Raw,
}

/// Token bucket settings and live state of one group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GroupTokenBucket {
    /// Sustained refill rate.
    pub fill_rate: f64,
    /// Burst ceiling.
    pub burst_limit: f64,
    /// Tokens currently available.
    pub tokens: f64,
}

impl Default for GroupTokenBucket {
    fn default() -> Self {
        Self {
            fill_rate: 1000.0,
            burst_limit: 10000.0,
            tokens: 10000.0,
        }
    }
}

impl GroupTokenBucket {
    /// Grants up to `requested` tokens after refilling for `elapsed`.
    pub fn grant(&mut self, requested: f64, elapsed: Duration) -> f64 {
        self.tokens = (self.tokens + self.fill_rate * elapsed.as_secs_f64()).min(self.burst_limit);
        let granted = requested.min(self.tokens.max(0.0));
        self.tokens -= granted;
        granted
    }
}

/// One resource group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceGroup {
    pub keyspace: KeyspaceId,
    pub name: String,
    pub mode: GroupMode,
    /// Scheduling priority, `0..=16`.
    pub priority: u32,
    pub bucket: GroupTokenBucket,
}

impl ResourceGroup {
    fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.len() > MAX_GROUP_NAME_LEN {
            return Err(PdError::InvalidInput(format!(
                "group name must be 1..={MAX_GROUP_NAME_LEN} chars, got {:?}",
                self.name
            )));
        }
        if self.priority > MAX_PRIORITY {
            return Err(PdError::InvalidInput(format!(
                "priority {} exceeds {MAX_PRIORITY}",
                self.priority
            )));
        }
        Ok(())
    }
}

/// Per-keyspace ceiling across all groups.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ServiceLimiter {
    pub service_limit: f64,
    pub available_tokens: f64,
    #[serde(skip, default = "Instant::now")]
    last_refill: Instant,
}

impl ServiceLimiter {
    pub fn new(service_limit: f64) -> Self {
        Self {
            service_limit,
            available_tokens: service_limit,
            last_refill: Instant::now(),
        }
    }

    /// Grants up to `requested` from the keyspace budget.
    pub fn grant(&mut self, requested: f64) -> f64 {
        let elapsed = self.last_refill.elapsed();
        self.last_refill = Instant::now();
        self.available_tokens = (self.available_tokens + self.service_limit * elapsed.as_secs_f64())
            .min(self.service_limit);
        let granted = requested.min(self.available_tokens.max(0.0));
        self.available_tokens -= granted;
        granted
    }
}

/// One consumption report from a client.
#[derive(Debug, Clone, Default)]
pub struct Consumption {
    pub keyspace: KeyspaceId,
    pub group: String,
    pub ru: f64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub cpu_ms: u64,
    pub read_rpc_count: u64,
    pub write_rpc_count: u64,
}

/// Accumulated counters for one group's metric series.
#[derive(Debug, Clone, Default)]
pub struct GroupCounters {
    pub ru: f64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub cpu_ms: u64,
    pub read_rpc_count: u64,
    pub write_rpc_count: u64,
    pub last_touched: Option<Instant>,
}

struct ManagerState {
    groups: AHashMap<(KeyspaceId, String), ResourceGroup>,
    limiters: AHashMap<KeyspaceId, ServiceLimiter>,
}

/// The resource-group manager.
pub struct ResourceGroupManager {
    kv: Arc<dyn CoordKv>,
    state: RwLock<ManagerState>,
    counters: Mutex<AHashMap<(KeyspaceId, String), GroupCounters>>,
    consumption_tx: mpsc::Sender<Consumption>,
    consumption_rx: Mutex<Option<mpsc::Receiver<Consumption>>>,
}

impl ResourceGroupManager {
    pub fn new(kv: Arc<dyn CoordKv>) -> Self {
        let (tx, rx) = mpsc::channel(CONSUMPTION_CHANNEL_CAPACITY);
        Self {
            kv,
            state: RwLock::new(ManagerState {
                groups: AHashMap::new(),
                limiters: AHashMap::new(),
            }),
            counters: Mutex::new(AHashMap::new()),
            consumption_tx: tx,
            consumption_rx: Mutex::new(Some(rx)),
        }
    }

    /// Handle clients report consumption through; the dispatcher drops
    /// reports when the channel is saturated rather than blocking them.
    pub fn consumption_sender(&self) -> mpsc::Sender<Consumption> {
        self.consumption_tx.clone()
    }

    /// Loads persisted settings, seeding the default group per keyspace
    /// encountered.
    pub async fn load(&self) -> Result<()> {
        let end = keys::range_end_of_prefix(keys::RESOURCE_GROUP_SETTINGS_PREFIX);
        let mut groups = AHashMap::new();
        for kv in self
            .kv
            .load_range(keys::RESOURCE_GROUP_SETTINGS_PREFIX, &end, 0)
            .await?
        {
            let group: ResourceGroup = codec::from_json_bytes(&kv.value)?;
            groups.insert((group.keyspace, group.name.clone()), group);
        }
        let count = groups.len();
        self.state.write().groups = groups;
        info!(target: "resource", count, "resource groups loaded");
        Ok(())
    }

    pub fn get_group(&self, keyspace: KeyspaceId, name: &str) -> Result<ResourceGroup> {
        self.state
            .read()
            .groups
            .get(&(keyspace, name.to_string()))
            .cloned()
            .ok_or_else(|| PdError::ResourceGroupNotFound(name.to_string()))
    }

    pub fn list_groups(&self, keyspace: KeyspaceId) -> Vec<ResourceGroup> {
        let mut groups: Vec<ResourceGroup> = self
            .state
            .read()
            .groups
            .values()
            .filter(|g| g.keyspace == keyspace)
            .cloned()
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        groups
    }

    /// Creates or replaces a group.
    pub async fn put_group(&self, group: ResourceGroup) -> Result<()> {
        group.validate()?;
        self.kv
            .save(
                &keys::resource_group_settings_path(group.keyspace, &group.name),
                codec::to_json_bytes(&group)?,
            )
            .await?;
        self.state
            .write()
            .groups
            .insert((group.keyspace, group.name.clone()), group);
        Ok(())
    }

    /// Deletes a group. The reserved `default` group stays.
    pub async fn delete_group(&self, keyspace: KeyspaceId, name: &str) -> Result<()> {
        if name == DEFAULT_GROUP {
            return Err(PdError::InvalidInput(
                "the default resource group cannot be deleted".into(),
            ));
        }
        let removed = self
            .state
            .write()
            .groups
            .remove(&(keyspace, name.to_string()));
        if removed.is_none() {
            return Err(PdError::ResourceGroupNotFound(name.to_string()));
        }
        self.kv
            .remove(&keys::resource_group_settings_path(keyspace, name))
            .await?;
        self.kv
            .remove(&keys::resource_group_states_path(keyspace, name))
            .await?;
        Ok(())
    }

    /// Sets a keyspace's service limit.
    pub fn set_service_limit(&self, keyspace: KeyspaceId, limit: f64) {
        self.state
            .write()
            .limiters
            .insert(keyspace, ServiceLimiter::new(limit));
    }

    /// Grants tokens to a group, bounded by both the group bucket and the
    /// keyspace service limiter.
    pub fn acquire_tokens(
        &self,
        keyspace: KeyspaceId,
        name: &str,
        requested: f64,
        elapsed: Duration,
    ) -> Result<f64> {
        let mut state = self.state.write();
        let keyspace_grant = match state.limiters.get_mut(&keyspace) {
            Some(limiter) => limiter.grant(requested),
            None => requested,
        };
        let group = state
            .groups
            .get_mut(&(keyspace, name.to_string()))
            .ok_or_else(|| PdError::ResourceGroupNotFound(name.to_string()))?;
        Ok(group.bucket.grant(keyspace_grant, elapsed))
    }

    /// Snapshots every group's running state to the Coordination Store.
    pub async fn persist_states(&self) -> Result<()> {
        let groups: Vec<ResourceGroup> = self.state.read().groups.values().cloned().collect();
        for group in groups {
            self.kv
                .save(
                    &keys::resource_group_states_path(group.keyspace, &group.name),
                    codec::to_json_bytes(&group.bucket)?,
                )
                .await?;
        }
        Ok(())
    }

    /// Folds one consumption report into the counters.
    pub fn record_consumption(&self, c: &Consumption) {
        let mut counters = self.counters.lock();
        let entry = counters
            .entry((c.keyspace, c.group.clone()))
            .or_default();
        entry.ru += c.ru;
        entry.read_bytes += c.read_bytes;
        entry.write_bytes += c.write_bytes;
        entry.cpu_ms += c.cpu_ms;
        entry.read_rpc_count += c.read_rpc_count;
        entry.write_rpc_count += c.write_rpc_count;
        entry.last_touched = Some(Instant::now());
    }

    pub fn counters_for(&self, keyspace: KeyspaceId, name: &str) -> Option<GroupCounters> {
        self.counters
            .lock()
            .get(&(keyspace, name.to_string()))
            .cloned()
    }

    /// Drops metric series untouched for the series TTL.
    pub fn sweep_counters(&self, ttl: Duration) {
        let now = Instant::now();
        self.counters.lock().retain(|_, c| {
            c.last_touched
                .is_some_and(|t| now.duration_since(t) < ttl)
        });
    }

    /// Spawns the metrics flusher (drains the consumption channel), the
    /// running-state persistence loop, and the stale-series sweeper.
    pub fn spawn_loops(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let Some(mut rx) = self.consumption_rx.lock().take() else {
            warn!(target: "resource", "consumption flusher already running");
            return;
        };
        let manager = Arc::clone(self);
        let mut flusher_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    report = rx.recv() => {
                        match report {
                            Some(c) => manager.record_consumption(&c),
                            None => return,
                        }
                    }
                    _ = flusher_shutdown.changed() => {
                        if *flusher_shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut persist = tokio::time::interval(PERSIST_INTERVAL);
            persist.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut sweep = tokio::time::interval(METRIC_SWEEP_INTERVAL);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = persist.tick() => {
                        if let Err(e) = manager.persist_states().await {
                            warn!(target: "resource", error = %e, "state persistence failed");
                        } else {
                            debug!(target: "resource", "group states persisted");
                        }
                    }
                    _ = sweep.tick() => {
                        manager.sweep_counters(METRIC_SERIES_TTL);
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_store::MemStore;
    use meridian_types::DEFAULT_KEYSPACE_ID as KS;

    fn group(name: &str, priority: u32) -> ResourceGroup {
        ResourceGroup {
            keyspace: KS,
            name: name.to_string(),
            mode: GroupMode::RuPerSec,
            priority,
            bucket: GroupTokenBucket::default(),
        }
    }

    fn manager() -> ResourceGroupManager {
        ResourceGroupManager::new(Arc::new(MemStore::new()) as Arc<dyn CoordKv>)
    }

    #[tokio::test]
    async fn validation_bounds_name_and_priority() {
        let m = manager();
        assert!(m.put_group(group("ok", 16)).await.is_ok());
        assert!(m.put_group(group("", 1)).await.is_err());
        assert!(m.put_group(group(&"x".repeat(33), 1)).await.is_err());
        assert!(m.put_group(group("high", 17)).await.is_err());
    }

    #[tokio::test]
    async fn default_group_cannot_be_deleted() {
        let m = manager();
        m.put_group(group(DEFAULT_GROUP, 8)).await.unwrap();
        assert!(m.delete_group(KS, DEFAULT_GROUP).await.is_err());
        m.put_group(group("batch", 1)).await.unwrap();
        m.delete_group(KS, "batch").await.unwrap();
        assert!(matches!(
            m.get_group(KS, "batch").unwrap_err(),
            PdError::ResourceGroupNotFound(_)
        ));
    }

    #[tokio::test]
    async fn settings_survive_a_reload() {
        let kv: Arc<dyn CoordKv> = Arc::new(MemStore::new());
        let m = ResourceGroupManager::new(Arc::clone(&kv));
        m.put_group(group("analytics", 3)).await.unwrap();

        let reloaded = ResourceGroupManager::new(kv);
        reloaded.load().await.unwrap();
        assert_eq!(reloaded.get_group(KS, "analytics").unwrap().priority, 3);
    }

    #[tokio::test]
    async fn token_grant_respects_bucket_and_service_limit() {
        let m = manager();
        let mut g = group("app", 8);
        g.bucket = GroupTokenBucket {
            fill_rate: 10.0,
            burst_limit: 100.0,
            tokens: 100.0,
        };
        m.put_group(g).await.unwrap();

        // Unlimited keyspace: the bucket alone bounds the grant.
        let granted = m
            .acquire_tokens(KS, "app", 60.0, Duration::ZERO)
            .unwrap();
        assert_eq!(granted, 60.0);
        let granted = m
            .acquire_tokens(KS, "app", 60.0, Duration::ZERO)
            .unwrap();
        assert_eq!(granted, 40.0);

        // A tight service limit caps everything in the keyspace.
        m.set_service_limit(KS, 5.0);
        let granted = m
            .acquire_tokens(KS, "app", 60.0, Duration::from_secs(100))
            .unwrap();
        assert!(granted <= 5.0 + f64::EPSILON);
    }

    #[tokio::test]
    async fn consumption_counters_accumulate_and_sweep() {
        let m = manager();
        m.record_consumption(&Consumption {
            keyspace: KS,
            group: "app".into(),
            ru: 5.0,
            read_bytes: 100,
            write_rpc_count: 2,
            ..Default::default()
        });
        m.record_consumption(&Consumption {
            keyspace: KS,
            group: "app".into(),
            ru: 2.5,
            ..Default::default()
        });
        let counters = m.counters_for(KS, "app").unwrap();
        assert_eq!(counters.ru, 7.5);
        assert_eq!(counters.read_bytes, 100);
        assert_eq!(counters.write_rpc_count, 2);

        m.sweep_counters(Duration::ZERO);
        assert!(m.counters_for(KS, "app").is_none());
    }

    #[tokio::test]
    async fn flusher_drains_the_dispatcher_channel() {
        let m = Arc::new(manager());
        let (_tx, shutdown_rx) = watch::channel(false);
        m.spawn_loops(shutdown_rx);
        let sender = m.consumption_sender();
        sender
            .send(Consumption {
                keyspace: KS,
                group: "app".into(),
                ru: 1.0,
                ..Default::default()
            })
            .await
            .unwrap();
        for _ in 0..100 {
            if m.counters_for(KS, "app").is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(m.counters_for(KS, "app").is_some());
    }
}
