// Path: crates/schedule/src/checker/replica.rs
//! Legacy fixed-replica-count repair, active only when placement rules
//! are disabled.

use std::sync::Arc;

use meridian_cluster::{RegionInfo, StoreInfo};
use meridian_types::PeerRole;
use std::time::Duration;

use crate::checker::Checker;
use crate::idsource::IdSource;
use crate::informer::ClusterInformer;
use crate::operator::{OpKind, OpPriority, OpStep, Operator};
use crate::placement::fit::isolation_penalty;
use crate::placement::rule::default_rule;

pub struct ReplicaChecker {
    ids: Arc<dyn IdSource>,
}

impl ReplicaChecker {
    pub fn new(ids: Arc<dyn IdSource>) -> Self {
        Self { ids }
    }
}

impl Checker for ReplicaChecker {
    fn name(&self) -> &'static str {
        "replica-checker"
    }

    fn check(&self, cluster: &dyn ClusterInformer, region: &RegionInfo) -> Vec<Operator> {
        let replication = cluster.replication_config();
        if replication.enable_placement_rules {
            return Vec::new();
        }
        let cfg = cluster.schedule_config();
        let want = replication.max_replicas;
        let voters: Vec<_> = region.voters().cloned().collect();

        if voters.len() < want {
            // Score candidates with the implicit rule's diversity logic.
            let rule = default_rule(&replication);
            let existing: Vec<Arc<StoreInfo>> = region
                .meta
                .peers
                .iter()
                .filter_map(|p| cluster.get_store(p.store_id))
                .collect();
            let disconnect = Duration::from_secs(cfg.store_disconnect_secs);
            let Some(store) = cluster
                .get_stores()
                .into_iter()
                .filter(|s| s.can_accept_peers(disconnect))
                .filter(|s| region.meta.peer_on_store(s.id()).is_none())
                .min_by_key(|s| {
                    (
                        isolation_penalty(&rule, &existing, s),
                        cluster.store_region_count(s.id()),
                        s.id(),
                    )
                })
            else {
                return Vec::new();
            };
            let Some(peer_id) = self.ids.alloc_peer_id() else {
                return Vec::new();
            };
            return vec![Operator::new(
                "make-up-replica",
                region.id(),
                region.epoch(),
                OpKind::REGION,
                OpPriority::High,
                vec![
                    OpStep::AddLearner {
                        store_id: store.id(),
                        peer_id,
                    },
                    OpStep::PromoteLearner {
                        store_id: store.id(),
                        peer_id,
                    },
                ],
            )];
        }

        if voters.len() > want {
            // Shed from the most crowded store; never the leader.
            let Some(victim) = voters
                .iter()
                .filter(|p| Some(p.id) != region.leader.as_ref().map(|l| l.id))
                .filter(|p| p.role == PeerRole::Voter)
                .max_by_key(|p| (cluster.store_region_count(p.store_id), p.store_id))
            else {
                return Vec::new();
            };
            return vec![Operator::new(
                "remove-extra-replica",
                region.id(),
                region.epoch(),
                OpKind::REGION,
                OpPriority::High,
                vec![OpStep::RemovePeer {
                    store_id: victim.store_id,
                    peer_id: victim.id,
                }],
            )];
        }
        Vec::new()
    }
}
