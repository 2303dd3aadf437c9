// Path: crates/schedule/src/schedulers/grant_hot_region.rs
//! Concentrates hot-region leadership onto one designated store.

use std::sync::Arc;

use meridian_types::StoreId;

use crate::informer::ClusterInformer;
use crate::operator::{OpKind, OpPriority, OpStep, Operator, OperatorController};
use crate::schedulers::Scheduler;
use crate::statistics::{FlowDim, FlowKind, HotRegionCache};

const HOT_PEER_MIN_RATE: f64 = 512.0;
const BATCH: usize = 4;

pub struct GrantHotRegionScheduler {
    store: StoreId,
    cache: Arc<HotRegionCache>,
}

impl GrantHotRegionScheduler {
    pub fn new(store: StoreId, cache: Arc<HotRegionCache>) -> Self {
        Self { store, cache }
    }
}

impl Scheduler for GrantHotRegionScheduler {
    fn name(&self) -> String {
        "grant-hot-region-scheduler".to_string()
    }

    fn kind(&self) -> &'static str {
        "grant-hot-region"
    }

    fn is_schedule_allowed(&self, cluster: &dyn ClusterInformer, opc: &OperatorController) -> bool {
        (opc.count_by_kind(OpKind::LEADER) as u64) < cluster.schedule_config().leader_schedule_limit
    }

    fn schedule(&self, cluster: &dyn ClusterInformer) -> Vec<Operator> {
        if cluster.get_store(self.store).is_none() {
            return Vec::new();
        }
        let mut ops = Vec::new();
        for hot in self
            .cache
            .hot_peers(FlowKind::Write, FlowDim::Byte, HOT_PEER_MIN_RATE)
        {
            if ops.len() >= BATCH {
                break;
            }
            let Some(region) = cluster.get_region(hot.region_id) else {
                continue;
            };
            if region.leader_store_id() == Some(self.store) {
                continue;
            }
            let Some(peer) = region.meta.peer_on_store(self.store) else {
                continue;
            };
            if !peer.role.is_voter() || peer.is_witness {
                continue;
            }
            ops.push(Operator::new(
                "grant-hot-region",
                region.id(),
                region.epoch(),
                OpKind::HOT.union(OpKind::LEADER),
                OpPriority::High,
                vec![OpStep::TransferLeader {
                    to_store: self.store,
                }],
            ));
        }
        ops
    }
}
