// Path: crates/cluster/src/region_tree.rs
//! The key-ordered region index with per-store secondary indexes.
//!
//! Point lookups and range scans are O(log N) on a `BTreeMap` keyed by
//! start key; the per-store sets answer "what does store S hold" without
//! touching the tree. `set_region` removes every stored region the
//! incoming one now covers before inserting, all under one `&mut self`, so
//! a reader holding the outer lock never observes a gap.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use ahash::AHashMap;
use meridian_types::config::KeyRange;
use meridian_types::{PeerRole, RegionId, RegionMeta, StoreId};
use rand::seq::IteratorRandom;

use crate::region::RegionInfo;

/// Per-store membership sets.
#[derive(Debug, Default, Clone)]
pub struct StoreRegionSets {
    pub leaders: HashSet<RegionId>,
    pub followers: HashSet<RegionId>,
    pub learners: HashSet<RegionId>,
    pub witnesses: HashSet<RegionId>,
}

impl StoreRegionSets {
    fn is_empty(&self) -> bool {
        self.leaders.is_empty()
            && self.followers.is_empty()
            && self.learners.is_empty()
            && self.witnesses.is_empty()
    }

    /// Regions with any kind of peer on the store.
    pub fn region_count(&self) -> usize {
        self.leaders.len() + self.followers.len() + self.learners.len()
    }
}

/// The region index.
#[derive(Default)]
pub struct RegionsInfo {
    tree: BTreeMap<Vec<u8>, Arc<RegionInfo>>,
    by_id: AHashMap<RegionId, Arc<RegionInfo>>,
    stores: AHashMap<StoreId, StoreRegionSets>,
}

impl RegionsInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Lookup by region ID.
    pub fn get(&self, id: RegionId) -> Option<Arc<RegionInfo>> {
        self.by_id.get(&id).cloned()
    }

    /// The region whose range contains `key`.
    pub fn find_containing(&self, key: &[u8]) -> Option<Arc<RegionInfo>> {
        self.tree
            .range(..=key.to_vec())
            .next_back()
            .map(|(_, r)| Arc::clone(r))
            .filter(|r| r.meta.contains_key(key))
    }

    /// The region immediately before the one containing `key`.
    pub fn find_previous(&self, key: &[u8]) -> Option<Arc<RegionInfo>> {
        let containing_start = self.find_containing(key)?.meta.start_key.clone();
        self.tree
            .range(..containing_start)
            .next_back()
            .map(|(_, r)| Arc::clone(r))
    }

    /// The region starting exactly where `region` ends.
    pub fn find_adjacent_after(&self, region: &RegionInfo) -> Option<Arc<RegionInfo>> {
        if region.end_key().is_empty() {
            return None;
        }
        self.tree.get(region.end_key()).map(Arc::clone)
    }

    /// Regions intersecting `[start, end)`, in key order, at most `limit`
    /// (0 means unlimited).
    pub fn scan(&self, start: &[u8], end: &[u8], limit: usize) -> Vec<Arc<RegionInfo>> {
        let mut out = Vec::new();
        // The region containing `start` may begin before it.
        if let Some(first) = self.find_containing(start) {
            out.push(first);
        }
        for (_, region) in self.tree.range(start.to_vec()..) {
            if !end.is_empty() && region.start_key() >= end {
                break;
            }
            if out.last().map(|r: &Arc<RegionInfo>| r.id()) == Some(region.id()) {
                continue;
            }
            out.push(Arc::clone(region));
            if limit != 0 && out.len() >= limit {
                break;
            }
        }
        if limit != 0 {
            out.truncate(limit);
        }
        out
    }

    /// Every stored region, in key order.
    pub fn all(&self) -> Vec<Arc<RegionInfo>> {
        self.tree.values().cloned().collect()
    }

    /// Stored regions whose range intersects `meta`'s, excluding `meta`'s
    /// own ID.
    pub fn overlaps(&self, meta: &RegionMeta) -> Vec<Arc<RegionInfo>> {
        let mut out = Vec::new();
        // Start from the region that could straddle the start boundary.
        let from = self
            .find_containing(&meta.start_key)
            .map(|r| r.meta.start_key.clone())
            .unwrap_or_else(|| meta.start_key.clone());
        for (_, region) in self.tree.range(from..) {
            if !meta.end_key.is_empty() && region.start_key() >= meta.end_key.as_slice() {
                break;
            }
            if region.id() != meta.id && region.meta.overlaps(meta) {
                out.push(Arc::clone(region));
            }
        }
        out
    }

    /// Installs `region`, removing its previous version and everything its
    /// range now covers. Returns the removed regions (for the
    /// synchronizer and for persistence cleanup).
    pub fn set_region(&mut self, region: Arc<RegionInfo>) -> Vec<Arc<RegionInfo>> {
        let mut removed = Vec::new();
        if let Some(old) = self.by_id.remove(&region.id()) {
            self.tree.remove(old.start_key());
            self.unindex_peers(&old);
            removed.push(old);
        }
        for overlap in self.overlaps(&region.meta) {
            self.tree.remove(overlap.start_key());
            self.by_id.remove(&overlap.id());
            self.unindex_peers(&overlap);
            removed.push(overlap);
        }
        self.index_peers(&region);
        self.by_id.insert(region.id(), Arc::clone(&region));
        self.tree.insert(region.meta.start_key.clone(), region);
        removed
    }

    /// Removes a region outright (merge completion).
    pub fn remove_region(&mut self, id: RegionId) -> Option<Arc<RegionInfo>> {
        let region = self.by_id.remove(&id)?;
        self.tree.remove(region.start_key());
        self.unindex_peers(&region);
        Some(region)
    }

    /// The per-store membership sets, if the store holds anything.
    pub fn store_sets(&self, store_id: StoreId) -> Option<&StoreRegionSets> {
        self.stores.get(&store_id)
    }

    pub fn store_leader_count(&self, store_id: StoreId) -> usize {
        self.stores.get(&store_id).map_or(0, |s| s.leaders.len())
    }

    pub fn store_region_count(&self, store_id: StoreId) -> usize {
        self.stores.get(&store_id).map_or(0, |s| s.region_count())
    }

    /// A uniformly random region led from `store_id` inside `ranges`.
    pub fn random_leader_region(
        &self,
        store_id: StoreId,
        ranges: &[KeyRange],
    ) -> Option<Arc<RegionInfo>> {
        self.random_from(store_id, ranges, |sets| &sets.leaders)
    }

    /// A uniformly random region with a non-leader voter on `store_id`.
    pub fn random_follower_region(
        &self,
        store_id: StoreId,
        ranges: &[KeyRange],
    ) -> Option<Arc<RegionInfo>> {
        self.random_from(store_id, ranges, |sets| &sets.followers)
    }

    fn random_from(
        &self,
        store_id: StoreId,
        ranges: &[KeyRange],
        pick: impl Fn(&StoreRegionSets) -> &HashSet<RegionId>,
    ) -> Option<Arc<RegionInfo>> {
        let sets = self.stores.get(&store_id)?;
        let mut rng = rand::thread_rng();
        pick(sets)
            .iter()
            .filter_map(|id| self.by_id.get(id))
            .filter(|r| {
                ranges.is_empty()
                    || ranges
                        .iter()
                        .any(|range| range.covers(r.start_key(), r.end_key()))
            })
            .choose(&mut rng)
            .cloned()
    }

    fn index_peers(&mut self, region: &RegionInfo) {
        let leader_id = region.leader.as_ref().map(|p| p.id);
        for peer in &region.meta.peers {
            let sets = self.stores.entry(peer.store_id).or_default();
            if peer.is_witness {
                sets.witnesses.insert(region.id());
            }
            if Some(peer.id) == leader_id {
                sets.leaders.insert(region.id());
            } else if peer.role == PeerRole::Learner {
                sets.learners.insert(region.id());
            } else {
                sets.followers.insert(region.id());
            }
        }
    }

    fn unindex_peers(&mut self, region: &RegionInfo) {
        for peer in &region.meta.peers {
            if let Some(sets) = self.stores.get_mut(&peer.store_id) {
                sets.leaders.remove(&region.id());
                sets.followers.remove(&region.id());
                sets.learners.remove(&region.id());
                sets.witnesses.remove(&region.id());
                if sets.is_empty() {
                    self.stores.remove(&peer.store_id);
                }
            }
        }
    }
}
