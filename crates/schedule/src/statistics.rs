// Path: crates/schedule/src/statistics.rs
//! Flow statistics the hot-region machinery runs on.
//!
//! Every accepted region heartbeat feeds the cache: write flow is charged
//! to every peer store (all replicas apply the log), read flow to the
//! leader store (it serves the reads). Rates are exponentially smoothed
//! and entries decay away once a region goes quiet.

use std::time::{Duration, Instant};

use ahash::AHashMap;
use meridian_cluster::RegionInfo;
use meridian_types::{RegionId, StoreId};
use parking_lot::Mutex;

/// Smoothing factor for the EWMA.
const ALPHA: f64 = 0.5;
/// Entries untouched this long are dropped.
const STAT_TTL: Duration = Duration::from_secs(300);

/// Write or read flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowKind {
    Write,
    Read,
}

/// The dimensions a hot scheduler can prioritize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDim {
    Byte,
    Key,
    Query,
}

impl FlowDim {
    /// Parses a config priority list; unknown names are skipped.
    pub fn parse_priorities(names: &[String]) -> Vec<FlowDim> {
        names
            .iter()
            .filter_map(|n| match n.as_str() {
                "byte" => Some(FlowDim::Byte),
                "key" => Some(FlowDim::Key),
                "query" => Some(FlowDim::Query),
                _ => None,
            })
            .collect()
    }
}

/// Smoothed flow rates of one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FlowRates {
    pub bytes: f64,
    pub keys: f64,
    pub queries: f64,
}

impl FlowRates {
    pub fn dim(&self, dim: FlowDim) -> f64 {
        match dim {
            FlowDim::Byte => self.bytes,
            FlowDim::Key => self.keys,
            FlowDim::Query => self.queries,
        }
    }

    fn fold(&mut self, bytes: u64, keys: u64, queries: u64) {
        self.bytes = self.bytes * (1.0 - ALPHA) + bytes as f64 * ALPHA;
        self.keys = self.keys * (1.0 - ALPHA) + keys as f64 * ALPHA;
        self.queries = self.queries * (1.0 - ALPHA) + queries as f64 * ALPHA;
    }
}

/// One hot peer as reported to schedulers.
#[derive(Debug, Clone)]
pub struct HotPeerStat {
    pub region_id: RegionId,
    pub store_id: StoreId,
    pub rates: FlowRates,
}

struct Entry {
    rates: FlowRates,
    touched: Instant,
}

/// The cache of per-`(region, store)` flow rates.
#[derive(Default)]
pub struct HotRegionCache {
    write: Mutex<AHashMap<(RegionId, StoreId), Entry>>,
    read: Mutex<AHashMap<(RegionId, StoreId), Entry>>,
}

impl HotRegionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one accepted heartbeat into the cache.
    pub fn observe(&self, region: &RegionInfo) {
        let now = Instant::now();
        {
            let mut write = self.write.lock();
            for peer in &region.meta.peers {
                let entry = write.entry((region.id(), peer.store_id)).or_insert(Entry {
                    rates: FlowRates::default(),
                    touched: now,
                });
                entry.rates.fold(
                    region.stats.written_bytes,
                    region.stats.written_keys,
                    region.stats.query_num,
                );
                entry.touched = now;
            }
            write.retain(|_, e| now.duration_since(e.touched) < STAT_TTL);
        }
        if let Some(leader_store) = region.leader_store_id() {
            let mut read = self.read.lock();
            let entry = read.entry((region.id(), leader_store)).or_insert(Entry {
                rates: FlowRates::default(),
                touched: now,
            });
            entry.rates.fold(
                region.stats.read_bytes,
                region.stats.read_keys,
                region.stats.query_num,
            );
            entry.touched = now;
            read.retain(|_, e| now.duration_since(e.touched) < STAT_TTL);
        }
    }

    /// Peers whose `dim` rate reaches `threshold`, hottest first.
    pub fn hot_peers(&self, kind: FlowKind, dim: FlowDim, threshold: f64) -> Vec<HotPeerStat> {
        let map = match kind {
            FlowKind::Write => self.write.lock(),
            FlowKind::Read => self.read.lock(),
        };
        let mut peers: Vec<HotPeerStat> = map
            .iter()
            .filter(|(_, e)| e.rates.dim(dim) >= threshold)
            .map(|((region_id, store_id), e)| HotPeerStat {
                region_id: *region_id,
                store_id: *store_id,
                rates: e.rates,
            })
            .collect();
        peers.sort_by(|a, b| {
            b.rates
                .dim(dim)
                .partial_cmp(&a.rates.dim(dim))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        peers
    }

    /// Aggregate `dim` load per store over hot peers.
    pub fn store_loads(&self, kind: FlowKind, dim: FlowDim) -> AHashMap<StoreId, f64> {
        let map = match kind {
            FlowKind::Write => self.write.lock(),
            FlowKind::Read => self.read.lock(),
        };
        let mut loads: AHashMap<StoreId, f64> = AHashMap::new();
        for ((_, store_id), e) in map.iter() {
            *loads.entry(*store_id).or_default() += e.rates.dim(dim);
        }
        loads
    }

    /// Drops everything; called on step-down.
    pub fn reset(&self) {
        self.write.lock().clear();
        self.read.lock().clear();
    }
}
