// Path: crates/schedule/src/schedulers/shuffle.rs
//! Randomized movement schedulers, used to exercise the cluster in tests.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;

use crate::idsource::IdSource;
use crate::informer::ClusterInformer;
use crate::operator::{OpKind, OpPriority, OpStep, Operator, OperatorController};
use crate::schedulers::Scheduler;
use crate::statistics::{FlowDim, FlowKind, HotRegionCache};

pub struct ShuffleLeaderScheduler;

impl Scheduler for ShuffleLeaderScheduler {
    fn name(&self) -> String {
        "shuffle-leader-scheduler".to_string()
    }

    fn kind(&self) -> &'static str {
        "shuffle-leader"
    }

    fn is_schedule_allowed(&self, cluster: &dyn ClusterInformer, opc: &OperatorController) -> bool {
        (opc.count_by_kind(OpKind::LEADER) as u64) < cluster.schedule_config().leader_schedule_limit
    }

    fn schedule(&self, cluster: &dyn ClusterInformer) -> Vec<Operator> {
        let mut rng = rand::thread_rng();
        let stores = cluster.get_stores();
        let Some(store) = stores.choose(&mut rng) else {
            return Vec::new();
        };
        let Some(region) = cluster.random_leader_region(store.id(), &[]) else {
            return Vec::new();
        };
        let followers: Vec<_> = region
            .voters()
            .filter(|p| !p.is_witness && p.store_id != store.id())
            .collect();
        let Some(target) = followers.choose(&mut rng) else {
            return Vec::new();
        };
        vec![Operator::new(
            "shuffle-leader",
            region.id(),
            region.epoch(),
            OpKind::LEADER,
            OpPriority::Low,
            vec![OpStep::TransferLeader {
                to_store: target.store_id,
            }],
        )]
    }
}

pub struct ShuffleRegionScheduler {
    ids: Arc<dyn IdSource>,
}

impl ShuffleRegionScheduler {
    pub fn new(ids: Arc<dyn IdSource>) -> Self {
        Self { ids }
    }
}

impl Scheduler for ShuffleRegionScheduler {
    fn name(&self) -> String {
        "shuffle-region-scheduler".to_string()
    }

    fn kind(&self) -> &'static str {
        "shuffle-region"
    }

    fn is_schedule_allowed(&self, cluster: &dyn ClusterInformer, opc: &OperatorController) -> bool {
        (opc.count_by_kind(OpKind::REGION) as u64) < cluster.schedule_config().region_schedule_limit
    }

    fn schedule(&self, cluster: &dyn ClusterInformer) -> Vec<Operator> {
        let cfg = cluster.schedule_config();
        let disconnect = Duration::from_secs(cfg.store_disconnect_secs);
        let mut rng = rand::thread_rng();
        let stores = cluster.get_stores();
        let Some(source) = stores.choose(&mut rng) else {
            return Vec::new();
        };
        let Some(region) = cluster.random_follower_region(source.id(), &[]) else {
            return Vec::new();
        };
        if !region.is_healthy() {
            return Vec::new();
        }
        let Some(victim) = region.meta.peer_on_store(source.id()) else {
            return Vec::new();
        };
        let candidates: Vec<_> = stores
            .iter()
            .filter(|s| s.can_accept_peers(disconnect))
            .filter(|s| region.meta.peer_on_store(s.id()).is_none())
            .collect();
        let Some(target) = candidates.choose(&mut rng) else {
            return Vec::new();
        };
        let Some(peer_id) = self.ids.alloc_peer_id() else {
            return Vec::new();
        };
        vec![Operator::new(
            "shuffle-region",
            region.id(),
            region.epoch(),
            OpKind::REGION,
            OpPriority::Low,
            vec![
                OpStep::AddLearner {
                    store_id: target.id(),
                    peer_id,
                },
                OpStep::PromoteLearner {
                    store_id: target.id(),
                    peer_id,
                },
                OpStep::RemovePeer {
                    store_id: source.id(),
                    peer_id: victim.id,
                },
            ],
        )]
    }
}

pub struct ShuffleHotRegionScheduler {
    cache: Arc<HotRegionCache>,
}

impl ShuffleHotRegionScheduler {
    pub fn new(cache: Arc<HotRegionCache>) -> Self {
        Self { cache }
    }
}

impl Scheduler for ShuffleHotRegionScheduler {
    fn name(&self) -> String {
        "shuffle-hot-region-scheduler".to_string()
    }

    fn kind(&self) -> &'static str {
        "shuffle-hot-region"
    }

    fn is_schedule_allowed(&self, cluster: &dyn ClusterInformer, opc: &OperatorController) -> bool {
        (opc.count_by_kind(OpKind::HOT) as u64) < cluster.schedule_config().hot_region_schedule_limit
    }

    fn schedule(&self, cluster: &dyn ClusterInformer) -> Vec<Operator> {
        let mut rng = rand::thread_rng();
        let hot = self.cache.hot_peers(FlowKind::Write, FlowDim::Byte, 1.0);
        let Some(pick) = hot.choose(&mut rng) else {
            return Vec::new();
        };
        let Some(region) = cluster.get_region(pick.region_id) else {
            return Vec::new();
        };
        let current = region.leader_store_id();
        let targets: Vec<_> = region
            .voters()
            .filter(|p| !p.is_witness && Some(p.store_id) != current)
            .collect();
        let Some(target) = targets.choose(&mut rng) else {
            return Vec::new();
        };
        vec![Operator::new(
            "shuffle-hot-region",
            region.id(),
            region.epoch(),
            OpKind::HOT.union(OpKind::LEADER),
            OpPriority::Low,
            vec![OpStep::TransferLeader {
                to_store: target.store_id,
            }],
        )]
    }
}
