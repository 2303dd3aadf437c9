// Path: crates/schedule/src/schedulers/evict_slow.rs
//! Leader eviction driven by store slowness signals.
//!
//! `evict-slow-store` acts on the heartbeat-computed slow flag;
//! `evict-slow-trend` captures a store whose slowness trend is rising and
//! releases it when the trend settles. Both evict like the evict-leader
//! scheduler and recover on their own.

use meridian_types::StoreId;
use parking_lot::RwLock;
use tracing::info;

use crate::informer::ClusterInformer;
use crate::operator::{OpKind, OpPriority, Operator, OperatorController};
use crate::schedulers::evict_leader::EvictLeaderScheduler;
use crate::schedulers::Scheduler;

pub struct EvictSlowStoreScheduler {
    evicting: RwLock<Option<StoreId>>,
}

impl EvictSlowStoreScheduler {
    pub fn new() -> Self {
        Self {
            evicting: RwLock::new(None),
        }
    }
}

impl Default for EvictSlowStoreScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for EvictSlowStoreScheduler {
    fn name(&self) -> String {
        "evict-slow-store-scheduler".to_string()
    }

    fn kind(&self) -> &'static str {
        "evict-slow-store"
    }

    fn is_schedule_allowed(&self, cluster: &dyn ClusterInformer, opc: &OperatorController) -> bool {
        (opc.count_by_kind(OpKind::LEADER) as u64) < cluster.schedule_config().leader_schedule_limit
    }

    fn schedule(&self, cluster: &dyn ClusterInformer) -> Vec<Operator> {
        let current = *self.evicting.read();
        match current {
            Some(store) => {
                let still_slow = cluster.get_store(store).is_some_and(|s| s.slow);
                if !still_slow {
                    info!(target: "scheduler", store_id = store, "slow store recovered, releasing eviction");
                    cluster.set_pause_leader_transfer_in(store, false);
                    *self.evicting.write() = None;
                    return Vec::new();
                }
                EvictLeaderScheduler::evict_store(
                    cluster,
                    store,
                    &[],
                    "evict-slow-store",
                    OpPriority::Urgent,
                )
            }
            None => {
                // Capture at most one slow store at a time; evicting
                // several at once would thrash the healthy remainder.
                let Some(slow) = cluster.get_stores().into_iter().find(|s| s.slow && s.meta.is_up())
                else {
                    return Vec::new();
                };
                info!(target: "scheduler", store_id = slow.id(), "slow store captured for eviction");
                cluster.set_pause_leader_transfer_in(slow.id(), true);
                *self.evicting.write() = Some(slow.id());
                EvictLeaderScheduler::evict_store(
                    cluster,
                    slow.id(),
                    &[],
                    "evict-slow-store",
                    OpPriority::Urgent,
                )
            }
        }
    }
}

/// Cause-rate threshold above which a store's trend counts as rising.
const TREND_CAPTURE_RATE: f64 = 0.0;

pub struct EvictSlowTrendScheduler {
    evicting: RwLock<Option<StoreId>>,
}

impl EvictSlowTrendScheduler {
    pub fn new() -> Self {
        Self {
            evicting: RwLock::new(None),
        }
    }
}

impl Default for EvictSlowTrendScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for EvictSlowTrendScheduler {
    fn name(&self) -> String {
        "evict-slow-trend-scheduler".to_string()
    }

    fn kind(&self) -> &'static str {
        "evict-slow-trend"
    }

    fn is_schedule_allowed(&self, cluster: &dyn ClusterInformer, opc: &OperatorController) -> bool {
        (opc.count_by_kind(OpKind::LEADER) as u64) < cluster.schedule_config().leader_schedule_limit
    }

    fn schedule(&self, cluster: &dyn ClusterInformer) -> Vec<Operator> {
        let current = *self.evicting.read();
        match current {
            Some(store) => {
                let still_rising = cluster.get_store(store).is_some_and(|s| {
                    s.stats
                        .slow_trend
                        .is_some_and(|t| t.cause_rate > TREND_CAPTURE_RATE)
                });
                if !still_rising {
                    info!(target: "scheduler", store_id = store, "slow trend settled, releasing eviction");
                    cluster.set_pause_leader_transfer_in(store, false);
                    *self.evicting.write() = None;
                    return Vec::new();
                }
                EvictLeaderScheduler::evict_store(
                    cluster,
                    store,
                    &[],
                    "evict-slow-trend",
                    OpPriority::Urgent,
                )
            }
            None => {
                // The worst rising store: both the cause signal and its
                // observable result are deteriorating.
                let candidate = cluster
                    .get_stores()
                    .into_iter()
                    .filter(|s| s.meta.is_up())
                    .filter(|s| {
                        s.stats.slow_trend.is_some_and(|t| {
                            t.cause_rate > TREND_CAPTURE_RATE && t.result_rate > TREND_CAPTURE_RATE
                        })
                    })
                    .max_by(|a, b| {
                        let va = a.stats.slow_trend.map(|t| t.cause_value).unwrap_or(0.0);
                        let vb = b.stats.slow_trend.map(|t| t.cause_value).unwrap_or(0.0);
                        va.total_cmp(&vb)
                    });
                let Some(store) = candidate else {
                    return Vec::new();
                };
                info!(target: "scheduler", store_id = store.id(), "rising slow trend captured for eviction");
                cluster.set_pause_leader_transfer_in(store.id(), true);
                *self.evicting.write() = Some(store.id());
                EvictLeaderScheduler::evict_store(
                    cluster,
                    store.id(),
                    &[],
                    "evict-slow-trend",
                    OpPriority::Urgent,
                )
            }
        }
    }
}
