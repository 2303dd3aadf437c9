// Path: crates/schedule/src/schedulers/transfer_witness_leader.rs
//! Moves leadership off witness peers; a witness holds no data and must
//! never serve as leader for long.

use std::time::Duration;

use crate::informer::ClusterInformer;
use crate::operator::{OpKind, OpPriority, OpStep, Operator, OperatorController};
use crate::schedulers::Scheduler;

const BATCH: usize = 4;

pub struct TransferWitnessLeaderScheduler;

impl Scheduler for TransferWitnessLeaderScheduler {
    fn name(&self) -> String {
        "transfer-witness-leader-scheduler".to_string()
    }

    fn kind(&self) -> &'static str {
        "transfer-witness-leader"
    }

    fn is_schedule_allowed(&self, _cluster: &dyn ClusterInformer, _opc: &OperatorController) -> bool {
        // Witness leadership is never acceptable; this scheduler ignores
        // the leader operator budget.
        true
    }

    fn schedule(&self, cluster: &dyn ClusterInformer) -> Vec<Operator> {
        let cfg = cluster.schedule_config();
        let disconnect = Duration::from_secs(cfg.store_disconnect_secs);
        let mut ops = Vec::new();
        for region in cluster.all_regions() {
            if ops.len() >= BATCH {
                break;
            }
            let Some(leader) = &region.leader else { continue };
            if !leader.is_witness {
                continue;
            }
            let target = region
                .voters()
                .filter(|p| !p.is_witness && p.id != leader.id)
                .filter_map(|p| cluster.get_store(p.store_id).map(|s| (p, s)))
                .filter(|(_, s)| s.can_accept_leaders(disconnect))
                .min_by_key(|(_, s)| (cluster.store_leader_count(s.id()), s.id()));
            let Some((target, _)) = target else { continue };
            ops.push(Operator::new(
                "transfer-witness-leader",
                region.id(),
                region.epoch(),
                OpKind::LEADER,
                OpPriority::Urgent,
                vec![OpStep::TransferLeader {
                    to_store: target.store_id,
                }],
            ));
        }
        ops
    }
}
