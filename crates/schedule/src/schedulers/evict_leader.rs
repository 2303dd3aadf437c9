// Path: crates/schedule/src/schedulers/evict_leader.rs
//! Forces leaders off designated stores.
//!
//! Configured stores also get their inbound leader-transfer pause flag
//! raised so the balance machinery does not push leaders straight back.

use std::collections::HashMap;

use meridian_types::config::KeyRange;
use meridian_types::{codec, Result, StoreId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::informer::ClusterInformer;
use crate::operator::{OpKind, OpPriority, OpStep, Operator, OperatorController};
use crate::schedulers::Scheduler;

const BATCH_PER_STORE: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EvictLeaderConfig {
    pub stores: HashMap<StoreId, Vec<KeyRange>>,
}

pub struct EvictLeaderScheduler {
    conf: RwLock<EvictLeaderConfig>,
}

impl EvictLeaderScheduler {
    pub fn new() -> Self {
        Self {
            conf: RwLock::new(EvictLeaderConfig::default()),
        }
    }

    pub fn from_config(conf: EvictLeaderConfig) -> Self {
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

    pub fn store_ids(&self) -> Vec<StoreId> {
        self.conf.read().stores.keys().copied().collect()
    }

    /// Builds the eviction transfers for one store.
    pub fn evict_store(
        cluster: &dyn ClusterInformer,
        store: StoreId,
        ranges: &[KeyRange],
        desc: &str,
        priority: OpPriority,
    ) -> Vec<Operator> {
        let cfg = cluster.schedule_config();
        let disconnect = Duration::from_secs(cfg.store_disconnect_secs);
        let mut ops = Vec::new();
        for _ in 0..BATCH_PER_STORE {
            let Some(region) = cluster.random_leader_region(store, ranges) else {
                break;
            };
            let target = region
                .voters()
                .filter(|p| !p.is_witness && p.store_id != store)
                .filter_map(|p| cluster.get_store(p.store_id))
                .filter(|s| s.can_accept_leaders(disconnect))
                .min_by_key(|s| (cluster.store_leader_count(s.id()), s.id()));
            let Some(target) = target else { continue };
            ops.push(Operator::new(
                desc,
                region.id(),
                region.epoch(),
                OpKind::LEADER,
                priority,
                vec![OpStep::TransferLeader {
                    to_store: target.id(),
                }],
            ));
        }
        ops
    }
}

impl Default for EvictLeaderScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for EvictLeaderScheduler {
    fn name(&self) -> String {
        "evict-leader-scheduler".to_string()
    }

    fn kind(&self) -> &'static str {
        "evict-leader"
    }

    fn is_schedule_allowed(&self, cluster: &dyn ClusterInformer, opc: &OperatorController) -> bool {
        (opc.count_by_kind(OpKind::LEADER) as u64) < cluster.schedule_config().leader_schedule_limit
    }

    fn schedule(&self, cluster: &dyn ClusterInformer) -> Vec<Operator> {
        let conf = self.conf.read().clone();
        let mut ops = Vec::new();
        for (store, ranges) in conf.stores {
            // Keep the stickiness flag asserted; it also covers stores
            // configured before this replica won leadership.
            cluster.set_pause_leader_transfer_in(store, true);
            ops.extend(Self::evict_store(
                cluster,
                store,
                &ranges,
                "evict-leader",
                OpPriority::High,
            ));
        }
        ops
    }

    fn encode_config(&self) -> Result<Vec<u8>> {
        codec::to_json_bytes(&*self.conf.read())
    }
}
