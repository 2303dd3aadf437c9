// Path: crates/schedule/src/schedulers/balance_region.rs
//! Evens region counts (usage-weighted) across stores.

use std::sync::Arc;
use std::time::Duration;

use meridian_cluster::StoreInfo;
use tracing::debug;

use crate::idsource::IdSource;
use crate::informer::ClusterInformer;
use crate::operator::{OpKind, OpPriority, OpStep, Operator, OperatorController};
use crate::schedulers::Scheduler;

const RETRY_PICKS: usize = 4;

pub struct BalanceRegionScheduler {
    ids: Arc<dyn IdSource>,
}

impl BalanceRegionScheduler {
    pub fn new(ids: Arc<dyn IdSource>) -> Self {
        Self { ids }
    }
}

impl Scheduler for BalanceRegionScheduler {
    fn name(&self) -> String {
        "balance-region-scheduler".to_string()
    }

    fn kind(&self) -> &'static str {
        "balance-region"
    }

    fn is_schedule_allowed(&self, cluster: &dyn ClusterInformer, opc: &OperatorController) -> bool {
        (opc.count_by_kind(OpKind::REGION) as u64) < cluster.schedule_config().region_schedule_limit
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
        let score = |s: &StoreInfo| s.region_score(cluster.store_region_count(s.id()) as u64);
        let Some(source) = stores.iter().max_by(|a, b| score(a).total_cmp(&score(b))) else {
            return Vec::new();
        };

        for _ in 0..RETRY_PICKS {
            // Prefer moving followers; falling back to leaders would force
            // an extra leader transfer.
            let Some(region) = cluster
                .random_follower_region(source.id(), &[])
                .or_else(|| cluster.random_leader_region(source.id(), &[]))
            else {
                break;
            };
            if !region.is_healthy() {
                continue;
            }
            let Some(victim) = region.meta.peer_on_store(source.id()) else {
                continue;
            };
            let target = stores
                .iter()
                .filter(|s| s.can_accept_peers(disconnect))
                .filter(|s| region.meta.peer_on_store(s.id()).is_none())
                .filter(|s| score(s) * cfg.tolerant_balance_ratio < score(source))
                .filter(|s| score(source) - score(s) >= 1.0)
                .min_by(|a, b| score(a).total_cmp(&score(b)));
            let Some(target) = target else { continue };
            let Some(peer_id) = self.ids.alloc_peer_id() else {
                return Vec::new();
            };
            debug!(
                target: "scheduler",
                region_id = region.id(),
                from = source.id(),
                to = target.id(),
                "balance-region move"
            );
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
            if region.leader_store_id() == Some(source.id()) {
                steps.push(OpStep::TransferLeader {
                    to_store: target.id(),
                });
            }
            steps.push(OpStep::RemovePeer {
                store_id: source.id(),
                peer_id: victim.id,
            });
            return vec![Operator::new(
                "balance-region",
                region.id(),
                region.epoch(),
                OpKind::REGION,
                OpPriority::Medium,
                steps,
            )];
        }
        Vec::new()
    }
}
