// Path: crates/schedule/src/schedulers/balance_leader.rs
//! Evens leader counts across stores.

use std::sync::Arc;
use std::time::Duration;

use meridian_cluster::StoreInfo;
use tracing::debug;

use crate::informer::ClusterInformer;
use crate::operator::{OpKind, OpPriority, OpStep, Operator, OperatorController};
use crate::schedulers::Scheduler;

const RETRY_PICKS: usize = 4;

pub struct BalanceLeaderScheduler;

impl BalanceLeaderScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl Default for BalanceLeaderScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for BalanceLeaderScheduler {
    fn name(&self) -> String {
        "balance-leader-scheduler".to_string()
    }

    fn kind(&self) -> &'static str {
        "balance-leader"
    }

    fn is_schedule_allowed(&self, cluster: &dyn ClusterInformer, opc: &OperatorController) -> bool {
        (opc.count_by_kind(OpKind::LEADER) as u64) < cluster.schedule_config().leader_schedule_limit
    }

    fn schedule(&self, cluster: &dyn ClusterInformer) -> Vec<Operator> {
        let cfg = cluster.schedule_config();
        let disconnect = Duration::from_secs(cfg.store_disconnect_secs);
        let stores: Vec<Arc<StoreInfo>> = cluster
            .get_stores()
            .into_iter()
            .filter(|s| s.meta.is_up() && !s.is_disconnected(disconnect))
            .collect();
        if stores.len() < 2 {
            return Vec::new();
        }
        let score = |s: &StoreInfo| s.leader_score(cluster.store_leader_count(s.id()) as u64);
        let Some(source) = stores
            .iter()
            .filter(|s| !s.pause_leader_transfer_out)
            .max_by(|a, b| score(a).total_cmp(&score(b)))
        else {
            return Vec::new();
        };
        let Some(floor) = stores
            .iter()
            .filter(|s| s.can_accept_leaders(disconnect))
            .map(|s| score(s))
            .min_by(f64::total_cmp)
        else {
            return Vec::new();
        };
        if score(source) <= floor * cfg.tolerant_balance_ratio || score(source) - floor < 1.0 {
            return Vec::new();
        }

        for _ in 0..RETRY_PICKS {
            let Some(region) = cluster.random_leader_region(source.id(), &[]) else {
                break;
            };
            // The best follower store that is still an improvement.
            let target = region
                .voters()
                .filter(|p| !p.is_witness && p.store_id != source.id())
                .filter_map(|p| cluster.get_store(p.store_id))
                .filter(|s| s.can_accept_leaders(disconnect))
                .filter(|s| score(s) + 1.0 < score(source))
                .min_by(|a, b| score(a).total_cmp(&score(b)));
            if let Some(target) = target {
                debug!(
                    target: "scheduler",
                    region_id = region.id(),
                    from = source.id(),
                    to = target.id(),
                    "balance-leader move"
                );
                return vec![Operator::new(
                    "balance-leader",
                    region.id(),
                    region.epoch(),
                    OpKind::LEADER,
                    OpPriority::Medium,
                    vec![OpStep::TransferLeader {
                        to_store: target.id(),
                    }],
                )];
            }
        }
        Vec::new()
    }
}
