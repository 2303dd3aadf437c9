// Path: crates/schedule/src/scatter.rs
//! The region scatterer: spreads a batch of regions' peers and leaders as
//! evenly as possible across compatible stores.
//!
//! Placement counts are tracked per `(engine, group)` in a TTL-decaying
//! map so an old scatter run stops skewing placement a few minutes after
//! it finishes. Engines scatter independently: a columnar replica never
//! competes with ordinary replicas for a slot.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::AHashMap;
use meridian_cluster::{RegionInfo, StoreInfo};
use meridian_types::{PdError, PeerRole, RegionId, Result, StoreId};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::idsource::IdSource;
use crate::informer::ClusterInformer;
use crate::operator::{OpKind, OpPriority, OpStep, Operator};
use crate::placement::RuleManager;

/// How long a placement decision keeps weighing on the counts.
const COUNT_TTL: Duration = Duration::from_secs(180);
/// Attempts per region before giving up.
const MAX_RETRY_LIMIT: usize = 30;
/// Ceiling of the retry backoff.
const MAX_SLEEP: Duration = Duration::from_secs(60);
/// The store label distinguishing engines.
const ENGINE_LABEL: &str = "engine";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum CountKind {
    Peer,
    Leader,
}

#[derive(Default)]
struct TtlCounts {
    entries: Mutex<AHashMap<(String, String, StoreId, CountKind), Vec<Instant>>>,
}

impl TtlCounts {
    fn incr(&self, engine: &str, group: &str, store: StoreId, kind: CountKind) {
        self.entries
            .lock()
            .entry((engine.to_string(), group.to_string(), store, kind))
            .or_default()
            .push(Instant::now());
    }

    fn count(&self, engine: &str, group: &str, store: StoreId, kind: CountKind) -> usize {
        let mut entries = self.entries.lock();
        match entries.get_mut(&(engine.to_string(), group.to_string(), store, kind)) {
            Some(stamps) => {
                let now = Instant::now();
                stamps.retain(|t| now.duration_since(*t) < COUNT_TTL);
                stamps.len()
            }
            None => 0,
        }
    }
}

pub struct RegionScatterer {
    rules: Arc<RuleManager>,
    ids: Arc<dyn IdSource>,
    counts: TtlCounts,
}

impl RegionScatterer {
    pub fn new(rules: Arc<RuleManager>, ids: Arc<dyn IdSource>) -> Self {
        Self {
            rules,
            ids,
            counts: TtlCounts::default(),
        }
    }

    fn engine_of(store: &StoreInfo) -> String {
        store.meta.label(ENGINE_LABEL).unwrap_or("").to_string()
    }

    /// Plans the scatter of one region. `None` means the region is
    /// already where the counts want it (counts are still recorded).
    pub fn scatter_region(
        &self,
        cluster: &dyn ClusterInformer,
        region: &RegionInfo,
        group: &str,
    ) -> Option<Operator> {
        if !region.is_healthy() || region.leader.is_none() {
            return None;
        }
        let cfg = cluster.schedule_config();
        let disconnect = Duration::from_secs(cfg.store_disconnect_secs);
        let stores = cluster.get_stores();
        let applicable_rules = self.rules.rules_for_region(region);

        let mut used: HashSet<StoreId> =
            region.meta.peers.iter().map(|p| p.store_id).collect();
        let mut placement: AHashMap<u64, StoreId> = AHashMap::new();

        for peer in &region.meta.peers {
            let engine = cluster
                .get_store(peer.store_id)
                .map(|s| Self::engine_of(&s))
                .unwrap_or_default();
            let chosen = stores
                .iter()
                .filter(|s| Self::engine_of(s) == engine)
                .filter(|s| s.can_accept_peers(disconnect))
                .filter(|s| {
                    // Placement-rule safeguard: the store must be usable
                    // by at least one rule governing this region.
                    applicable_rules.is_empty()
                        || applicable_rules.iter().any(|r| r.matches_store(s))
                })
                .filter(|s| s.id() == peer.store_id || !used.contains(&s.id()))
                .min_by_key(|s| {
                    (
                        self.counts.count(&engine, group, s.id(), CountKind::Peer),
                        s.id(),
                    )
                })
                .map(|s| s.id())
                .unwrap_or(peer.store_id);
            if chosen != peer.store_id {
                used.remove(&peer.store_id);
                used.insert(chosen);
            }
            placement.insert(peer.id, chosen);
        }

        // Leader: the least-led ordinary-engine voter slot. Witnesses and
        // learners are never leaders.
        let leader_target = region
            .meta
            .peers
            .iter()
            .filter(|p| p.role.is_voter() && !p.is_witness && p.role != PeerRole::DemotingVoter)
            .filter_map(|p| placement.get(&p.id).copied())
            .filter(|store| {
                cluster
                    .get_store(*store)
                    .is_some_and(|s| Self::engine_of(&s).is_empty())
            })
            .min_by_key(|store| {
                (
                    self.counts.count("", group, *store, CountKind::Leader),
                    *store,
                )
            })?;

        // Record the final distribution regardless of whether we move.
        for store in placement.values() {
            let engine = cluster
                .get_store(*store)
                .map(|s| Self::engine_of(&s))
                .unwrap_or_default();
            self.counts.incr(&engine, group, *store, CountKind::Peer);
        }
        self.counts.incr("", group, leader_target, CountKind::Leader);

        let moves: Vec<(&meridian_types::Peer, StoreId)> = region
            .meta
            .peers
            .iter()
            .filter_map(|p| {
                let target = placement.get(&p.id).copied()?;
                (target != p.store_id).then_some((p, target))
            })
            .collect();
        let leader_moves = region.leader_store_id() != Some(leader_target);
        if moves.is_empty() && !leader_moves {
            debug!(target: "scatter", region_id = region.id(), "already scattered, counts recorded");
            return None;
        }

        let mut steps = Vec::new();
        let mut removals = Vec::new();
        for (peer, target) in &moves {
            let peer_id = self.ids.alloc_peer_id()?;
            steps.push(OpStep::AddLearner {
                store_id: *target,
                peer_id,
            });
            if peer.role.is_voter() {
                steps.push(OpStep::PromoteLearner {
                    store_id: *target,
                    peer_id,
                });
            }
            removals.push(OpStep::RemovePeer {
                store_id: peer.store_id,
                peer_id: peer.id,
            });
        }
        if leader_moves {
            steps.push(OpStep::TransferLeader {
                to_store: leader_target,
            });
        }
        steps.extend(removals);
        Some(Operator::new(
            "scatter-region",
            region.id(),
            region.epoch(),
            OpKind::REGION.union(OpKind::LEADER),
            OpPriority::High,
            steps,
        ))
    }

    /// Scatters a batch of regions by ID, retrying each with exponential
    /// backoff. Returns the planned operators.
    pub async fn scatter_regions(
        &self,
        cluster: &dyn ClusterInformer,
        region_ids: &[RegionId],
        group: &str,
    ) -> Result<Vec<Operator>> {
        let mut ops = Vec::new();
        for region_id in region_ids {
            let mut backoff = Duration::from_millis(500);
            let mut done = false;
            for attempt in 0..MAX_RETRY_LIMIT {
                match cluster.get_region(*region_id) {
                    Some(region) => {
                        if let Some(op) = self.scatter_region(cluster, &region, group) {
                            ops.push(op);
                        }
                        done = true;
                        break;
                    }
                    None => {
                        warn!(target: "scatter", region_id, attempt, "region not found, backing off");
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_SLEEP);
                    }
                }
            }
            if !done {
                return Err(PdError::RegionNotFound(*region_id));
            }
        }
        Ok(ops)
    }

    /// Scatters every region intersecting `[start, end)`.
    pub async fn scatter_range(
        &self,
        cluster: &dyn ClusterInformer,
        start: &[u8],
        end: &[u8],
        group: &str,
    ) -> Result<Vec<Operator>> {
        let ids: Vec<RegionId> = cluster
            .scan_regions(start, end, 0)
            .iter()
            .map(|r| r.id())
            .collect();
        self.scatter_regions(cluster, &ids, group).await
    }
}
