// Path: crates/schedule/src/schedulers/hot_region.rs
//! Balances hot write and read flow across stores.
//!
//! Write heat moves a peer off the hottest store; read heat moves the
//! leader. Stores rank by the dimension priorities from the schedule
//! config, combined per the configured rank formula: v1 compares the
//! primary dimension alone, v2 blends primary and secondary.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use meridian_types::StoreId;
use tracing::debug;

use crate::idsource::IdSource;
use crate::informer::ClusterInformer;
use crate::operator::{OpKind, OpPriority, OpStep, Operator, OperatorController};
use crate::schedulers::Scheduler;
use crate::statistics::{FlowDim, FlowKind, HotPeerStat, HotRegionCache};

/// Minimum byte rate for a peer to count as hot at all.
const HOT_PEER_MIN_RATE: f64 = 512.0;
/// v2 blend weights for (primary, secondary).
const V2_PRIMARY_WEIGHT: f64 = 0.6;
const V2_SECONDARY_WEIGHT: f64 = 0.4;

pub struct HotRegionScheduler {
    cache: Arc<HotRegionCache>,
    ids: Arc<dyn IdSource>,
}

impl HotRegionScheduler {
    pub fn new(cache: Arc<HotRegionCache>, ids: Arc<dyn IdSource>) -> Self {
        Self { cache, ids }
    }

    fn rank(
        &self,
        loads: &AHashMap<StoreId, f64>,
        secondary: &AHashMap<StoreId, f64>,
        formula: &str,
        store: StoreId,
    ) -> f64 {
        let primary = loads.get(&store).copied().unwrap_or(0.0);
        match formula {
            "v1" => primary,
            _ => {
                let s = secondary.get(&store).copied().unwrap_or(0.0);
                primary * V2_PRIMARY_WEIGHT + s * V2_SECONDARY_WEIGHT
            }
        }
    }

    fn schedule_kind(&self, cluster: &dyn ClusterInformer, kind: FlowKind) -> Option<Operator> {
        let cfg = cluster.schedule_config();
        let priorities = FlowDim::parse_priorities(match kind {
            FlowKind::Write => &cfg.hot_write_priorities,
            FlowKind::Read => &cfg.hot_read_priorities,
        });
        let primary = priorities.first().copied().unwrap_or(FlowDim::Byte);
        let secondary = priorities.get(1).copied().unwrap_or(FlowDim::Key);

        let loads = self.cache.store_loads(kind, primary);
        let secondary_loads = self.cache.store_loads(kind, secondary);
        let disconnect = Duration::from_secs(cfg.store_disconnect_secs);

        let rank_of =
            |store: StoreId| self.rank(&loads, &secondary_loads, &cfg.hot_rank_formula_version, store);

        let source = *loads
            .iter()
            .max_by(|a, b| rank_of(*a.0).total_cmp(&rank_of(*b.0)))?
            .0;
        // Coldest eligible target over every live store, not just ones
        // that already carry heat.
        let target = cluster
            .get_stores()
            .into_iter()
            .filter(|s| s.id() != source && s.can_accept_peers(disconnect))
            .min_by(|a, b| rank_of(a.id()).total_cmp(&rank_of(b.id())))?;
        if rank_of(source) <= rank_of(target.id()) {
            return None;
        }

        let hottest: HotPeerStat = self
            .cache
            .hot_peers(kind, primary, HOT_PEER_MIN_RATE)
            .into_iter()
            .find(|p| p.store_id == source)?;
        let region = cluster.get_region(hottest.region_id)?;
        if !region.is_healthy() {
            return None;
        }

        match kind {
            FlowKind::Write => {
                let victim = region.meta.peer_on_store(source)?;
                if region.meta.peer_on_store(target.id()).is_some() {
                    return None;
                }
                let peer_id = self.ids.alloc_peer_id()?;
                debug!(target: "scheduler", region_id = region.id(), from = source, to = target.id(), "hot write move");
                let mut steps = vec![
                    OpStep::AddLearner {
                        store_id: target.id(),
                        peer_id,
                    },
                    OpStep::PromoteLearner {
                        store_id: target.id(),
                        peer_id,
                    },
                ];
                if region.leader_store_id() == Some(source) {
                    steps.push(OpStep::TransferLeader {
                        to_store: target.id(),
                    });
                }
                steps.push(OpStep::RemovePeer {
                    store_id: source,
                    peer_id: victim.id,
                });
                Some(Operator::new(
                    "hot-region-write",
                    region.id(),
                    region.epoch(),
                    OpKind::HOT.union(OpKind::REGION),
                    OpPriority::Medium,
                    steps,
                ))
            }
            FlowKind::Read => {
                // Reads follow the leader; move it to the coldest peer.
                let target_peer = region
                    .voters()
                    .filter(|p| !p.is_witness && p.store_id != source)
                    .filter_map(|p| cluster.get_store(p.store_id).map(|s| (p, s)))
                    .filter(|(_, s)| s.can_accept_leaders(disconnect))
                    .min_by(|(_, a), (_, b)| rank_of(a.id()).total_cmp(&rank_of(b.id())))?;
                debug!(target: "scheduler", region_id = region.id(), from = source, to = target_peer.0.store_id, "hot read transfer");
                Some(Operator::new(
                    "hot-region-read",
                    region.id(),
                    region.epoch(),
                    OpKind::HOT.union(OpKind::LEADER),
                    OpPriority::Medium,
                    vec![OpStep::TransferLeader {
                        to_store: target_peer.0.store_id,
                    }],
                ))
            }
        }
    }
}

impl Scheduler for HotRegionScheduler {
    fn name(&self) -> String {
        "balance-hot-region-scheduler".to_string()
    }

    fn kind(&self) -> &'static str {
        "balance-hot-region"
    }

    fn is_schedule_allowed(&self, cluster: &dyn ClusterInformer, opc: &OperatorController) -> bool {
        (opc.count_by_kind(OpKind::HOT) as u64) < cluster.schedule_config().hot_region_schedule_limit
    }

    fn schedule(&self, cluster: &dyn ClusterInformer) -> Vec<Operator> {
        let mut ops = Vec::new();
        if let Some(op) = self.schedule_kind(cluster, FlowKind::Write) {
            ops.push(op);
        }
        if let Some(op) = self.schedule_kind(cluster, FlowKind::Read) {
            ops.push(op);
        }
        ops
    }
}
