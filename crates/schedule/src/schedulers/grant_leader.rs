// Path: crates/schedule/src/schedulers/grant_leader.rs
//! Forces leaders onto designated stores.

use std::collections::HashMap;

use meridian_types::config::KeyRange;
use meridian_types::{codec, Result, StoreId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::informer::ClusterInformer;
use crate::operator::{OpKind, OpPriority, OpStep, Operator, OperatorController};
use crate::schedulers::Scheduler;

/// Transfers attempted per configured store per tick.
const BATCH_PER_STORE: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GrantLeaderConfig {
    /// Stores to pull leadership onto, each with optional key ranges.
    pub stores: HashMap<StoreId, Vec<KeyRange>>,
}

pub struct GrantLeaderScheduler {
    conf: RwLock<GrantLeaderConfig>,
}

impl GrantLeaderScheduler {
    pub fn new() -> Self {
        Self {
            conf: RwLock::new(GrantLeaderConfig::default()),
        }
    }

    pub fn from_config(conf: GrantLeaderConfig) -> Self {
        Self {
            conf: RwLock::new(conf),
        }
    }

    pub fn add_store(&self, store: StoreId, ranges: Vec<KeyRange>) {
        self.conf.write().stores.insert(store, ranges);
    }

    pub fn remove_store(&self, store: StoreId) {
        self.conf.write().stores.remove(&store);
    }
}

impl Default for GrantLeaderScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for GrantLeaderScheduler {
    fn name(&self) -> String {
        "grant-leader-scheduler".to_string()
    }

    fn kind(&self) -> &'static str {
        "grant-leader"
    }

    fn is_schedule_allowed(&self, cluster: &dyn ClusterInformer, opc: &OperatorController) -> bool {
        (opc.count_by_kind(OpKind::LEADER) as u64) < cluster.schedule_config().leader_schedule_limit
    }

    fn schedule(&self, cluster: &dyn ClusterInformer) -> Vec<Operator> {
        let conf = self.conf.read().clone();
        let mut ops = Vec::new();
        for (store, ranges) in conf.stores {
            if cluster.get_store(store).is_none() {
                continue;
            }
            for _ in 0..BATCH_PER_STORE {
                // A region with a non-leader voter here still needs its
                // leader pulled over.
                let Some(region) = cluster.random_follower_region(store, &ranges) else {
                    break;
                };
                let Some(peer) = region.meta.peer_on_store(store) else {
                    continue;
                };
                if !peer.role.is_voter() || peer.is_witness {
                    continue;
                }
                ops.push(Operator::new(
                    "grant-leader",
                    region.id(),
                    region.epoch(),
                    OpKind::LEADER,
                    OpPriority::High,
                    vec![OpStep::TransferLeader { to_store: store }],
                ));
            }
        }
        ops
    }

    fn encode_config(&self) -> Result<Vec<u8>> {
        codec::to_json_bytes(&*self.conf.read())
    }
}
