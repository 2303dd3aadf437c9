// Path: crates/schedule/src/schedulers/mod.rs
//! The scheduler trait, the ticking controller, and the factory.

pub mod balance_leader;
pub mod balance_region;
pub mod controller;
pub mod evict_leader;
pub mod evict_slow;
pub mod grant_hot_region;
pub mod grant_leader;
pub mod hot_region;
pub mod shuffle;
pub mod transfer_witness_leader;

use std::sync::Arc;
use std::time::Duration;

use meridian_types::{PdError, Result};

use crate::idsource::IdSource;
use crate::informer::ClusterInformer;
use crate::operator::{Operator, OperatorController};
use crate::statistics::HotRegionCache;

pub use balance_leader::BalanceLeaderScheduler;
pub use balance_region::BalanceRegionScheduler;
pub use controller::SchedulerController;
pub use evict_leader::EvictLeaderScheduler;
pub use evict_slow::{EvictSlowStoreScheduler, EvictSlowTrendScheduler};
pub use grant_hot_region::GrantHotRegionScheduler;
pub use grant_leader::GrantLeaderScheduler;
pub use hot_region::HotRegionScheduler;
pub use shuffle::{ShuffleHotRegionScheduler, ShuffleLeaderScheduler, ShuffleRegionScheduler};
pub use transfer_witness_leader::TransferWitnessLeaderScheduler;

/// Floor of every scheduler's ticker.
pub const MIN_SCHEDULE_INTERVAL: Duration = Duration::from_millis(10);
/// Ceiling the empty-result backoff grows toward.
pub const MAX_SCHEDULE_INTERVAL: Duration = Duration::from_secs(3);

/// One pluggable scheduler. The set is closed and registered at startup.
pub trait Scheduler: Send + Sync {
    /// Instance name, unique in the controller (`evict-leader-scheduler`).
    fn name(&self) -> String;
    /// Type name, used by the factory (`evict-leader`).
    fn kind(&self) -> &'static str;
    /// Cheap gate consulted before every tick.
    fn is_schedule_allowed(&self, cluster: &dyn ClusterInformer, opc: &OperatorController) -> bool;
    /// Produces operators for this tick; empty grows the tick interval.
    fn schedule(&self, cluster: &dyn ClusterInformer) -> Vec<Operator>;
    fn min_interval(&self) -> Duration {
        MIN_SCHEDULE_INTERVAL
    }
    fn max_interval(&self) -> Duration {
        MAX_SCHEDULE_INTERVAL
    }
    /// Private config blob persisted under `/schedulers/{name}`.
    fn encode_config(&self) -> Result<Vec<u8>> {
        Ok(b"{}".to_vec())
    }
}

/// Exponential backoff toward the scheduler's ceiling.
pub fn grow_interval(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

/// Builds schedulers by type name, wiring in the shared dependencies.
pub struct SchedulerFactory {
    pub hot_cache: Arc<HotRegionCache>,
    pub ids: Arc<dyn IdSource>,
}

impl SchedulerFactory {
    /// `args` meaning is scheduler-specific: store IDs for grant/evict
    /// variants, ignored elsewhere.
    pub fn build(&self, kind: &str, args: &[String]) -> Result<Arc<dyn Scheduler>> {
        let store_arg = || -> Result<u64> {
            args.first()
                .and_then(|a| a.parse().ok())
                .ok_or_else(|| PdError::InvalidInput(format!("{kind} needs a store id argument")))
        };
        Ok(match kind {
            "balance-leader" => Arc::new(BalanceLeaderScheduler::new()),
            "balance-region" => Arc::new(BalanceRegionScheduler::new(Arc::clone(&self.ids))),
            "balance-hot-region" => {
                Arc::new(HotRegionScheduler::new(Arc::clone(&self.hot_cache), Arc::clone(&self.ids)))
            }
            "grant-leader" => {
                let s = GrantLeaderScheduler::new();
                s.add_store(store_arg()?, Vec::new());
                Arc::new(s)
            }
            "evict-leader" => {
                let s = EvictLeaderScheduler::new();
                s.add_store(store_arg()?, Vec::new());
                Arc::new(s)
            }
            "grant-hot-region" => Arc::new(GrantHotRegionScheduler::new(
                store_arg()?,
                Arc::clone(&self.hot_cache),
            )),
            "shuffle-leader" => Arc::new(ShuffleLeaderScheduler),
            "shuffle-region" => Arc::new(ShuffleRegionScheduler::new(Arc::clone(&self.ids))),
            "shuffle-hot-region" => {
                Arc::new(ShuffleHotRegionScheduler::new(Arc::clone(&self.hot_cache)))
            }
            "transfer-witness-leader" => Arc::new(TransferWitnessLeaderScheduler),
            "evict-slow-store" => Arc::new(EvictSlowStoreScheduler::new()),
            "evict-slow-trend" => Arc::new(EvictSlowTrendScheduler::new()),
            other => {
                return Err(PdError::InvalidInput(format!(
                    "unknown scheduler type {other:?}"
                )))
            }
        })
    }

    /// Rebuilds a scheduler from its persisted config blob.
    pub fn build_persisted(&self, kind: &str, config: &[u8]) -> Result<Arc<dyn Scheduler>> {
        Ok(match kind {
            "grant-leader" => Arc::new(GrantLeaderScheduler::from_config(
                meridian_types::codec::from_json_bytes(config)?,
            )),
            "evict-leader" => Arc::new(EvictLeaderScheduler::from_config(
                meridian_types::codec::from_json_bytes(config)?,
            )),
            other => self.build(other, &[])?,
        })
    }
}
