// Path: crates/schedule/src/coordinator.rs
//! The coordinator: the loops that run the scheduling engine on the
//! primary.
//!
//! Patrol walks the region index feeding checkers; the suspect queue gets
//! regions that deserve a look before their patrol turn comes around; the
//! push loop re-drives stalled operators and catches timeouts; the
//! slow-node loop keeps an eye on store health signals.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use meridian_cluster::HeartbeatEffect;
use meridian_types::RegionId;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::checker::CheckerSuite;
use crate::informer::ClusterInformer;
use crate::labeler::RegionLabeler;
use crate::operator::OperatorController;
use crate::statistics::HotRegionCache;

const SUSPECT_INTERVAL: Duration = Duration::from_millis(100);
const PUSH_INTERVAL: Duration = Duration::from_millis(500);
const SLOW_NODE_INTERVAL: Duration = Duration::from_secs(10);
/// Regions examined per patrol tick.
const PATROL_BATCH: usize = 128;

pub struct Coordinator {
    cluster: Arc<dyn ClusterInformer>,
    opc: Arc<OperatorController>,
    checkers: Arc<CheckerSuite>,
    labeler: Arc<RegionLabeler>,
    hot_cache: Arc<HotRegionCache>,
    suspects: Mutex<VecDeque<RegionId>>,
    /// Patrol resumes from this key each tick.
    patrol_cursor: Mutex<Vec<u8>>,
}

impl Coordinator {
    pub fn new(
        cluster: Arc<dyn ClusterInformer>,
        opc: Arc<OperatorController>,
        checkers: Arc<CheckerSuite>,
        labeler: Arc<RegionLabeler>,
        hot_cache: Arc<HotRegionCache>,
    ) -> Self {
        Self {
            cluster,
            opc,
            checkers,
            labeler,
            hot_cache,
            suspects: Mutex::new(VecDeque::new()),
            patrol_cursor: Mutex::new(Vec::new()),
        }
    }

    pub fn operator_controller(&self) -> &Arc<OperatorController> {
        &self.opc
    }

    pub fn checkers(&self) -> &Arc<CheckerSuite> {
        &self.checkers
    }

    pub fn hot_cache(&self) -> &Arc<HotRegionCache> {
        &self.hot_cache
    }

    /// Reaction to one accepted region heartbeat: feed statistics, drive
    /// the region's operator, settle operators of absorbed regions, and
    /// mark the neighborhood suspect when geometry changed.
    pub fn observe_heartbeat(&self, effect: &HeartbeatEffect) {
        self.hot_cache.observe(&effect.region);
        self.opc.dispatch(&effect.region);
        for removed in &effect.removed {
            if removed.id() != effect.region.id() {
                self.opc.on_region_gone(removed.id());
                self.add_suspect(removed.id());
            }
        }
        if effect.meta_changed {
            self.add_suspect(effect.region.id());
        }
    }

    /// Queues a region for early re-examination.
    pub fn add_suspect(&self, region_id: RegionId) {
        let mut suspects = self.suspects.lock();
        if !suspects.contains(&region_id) {
            suspects.push_back(region_id);
        }
    }

    /// Runs the checker pipeline over one region and submits what it
    /// proposes.
    pub fn check_region(&self, region: &meridian_cluster::RegionInfo) {
        if self.labeler.schedule_disabled(region) {
            return;
        }
        if self.opc.get(region.id()).is_some() {
            return;
        }
        let ops = self.checkers.check_region(self.cluster.as_ref(), region);
        for op in ops {
            let Some(target_region) = self.cluster.get_region(op.region_id) else {
                continue;
            };
            if let Err(e) = self.opc.add_operator(&target_region, op) {
                warn!(target: "coordinator", region_id = region.id(), error = %e, "checker operator rejected");
            }
        }
    }

    fn patrol_tick(&self) {
        let start = self.patrol_cursor.lock().clone();
        let regions = self.cluster.scan_regions(&start, &[], PATROL_BATCH);
        let wrapped = regions.len() < PATROL_BATCH;
        for region in &regions {
            self.check_region(region);
        }
        let mut cursor = self.patrol_cursor.lock();
        *cursor = if wrapped {
            Vec::new()
        } else {
            regions
                .last()
                .map(|r| {
                    if r.end_key().is_empty() {
                        Vec::new()
                    } else {
                        r.end_key().to_vec()
                    }
                })
                .unwrap_or_default()
        };
    }

    fn suspect_tick(&self) {
        let drained: Vec<RegionId> = {
            let mut suspects = self.suspects.lock();
            suspects.drain(..).collect()
        };
        for region_id in drained {
            if let Some(region) = self.cluster.get_region(region_id) {
                self.check_region(&region);
            }
        }
    }

    fn slow_node_tick(&self) {
        for store in self.cluster.get_stores() {
            if store.slow {
                debug!(target: "coordinator", store_id = store.id(), score = store.stats.slow_score, "store flagged slow");
            }
        }
    }

    /// Spawns the four coordinator loops.
    pub fn spawn_loops(self: &Arc<Self>, shutdown: watch::Receiver<bool>) {
        let patrol_interval = Duration::from_millis(
            self.cluster.schedule_config().patrol_region_interval_ms.max(1),
        );
        self.spawn_loop("patrol-region", patrol_interval, shutdown.clone(), |c| {
            c.patrol_tick()
        });
        self.spawn_loop("suspect-regions", SUSPECT_INTERVAL, shutdown.clone(), |c| {
            c.suspect_tick()
        });
        {
            let coordinator = Arc::clone(self);
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(PUSH_INTERVAL);
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = tick.tick() => {
                            coordinator.opc.push_operators(coordinator.cluster.as_ref());
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            });
        }
        self.spawn_loop("slow-node", SLOW_NODE_INTERVAL, shutdown, |c| {
            c.slow_node_tick()
        });
    }

    fn spawn_loop(
        self: &Arc<Self>,
        name: &'static str,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
        body: impl Fn(&Coordinator) + Send + Sync + 'static,
    ) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => body(&coordinator),
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!(target: "coordinator", loop_name = name, "loop stopped");
                            return;
                        }
                    }
                }
            }
        });
    }
}
