// Path: crates/schedule/src/schedulers/controller.rs
//! Runs each scheduler on its own ticker with empty-result backoff.

use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use meridian_store::CoordKv;
use meridian_types::{keys, PdError, Result};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::checker::PauseController;
use crate::informer::ClusterInformer;
use crate::labeler::RegionLabeler;
use crate::operator::OperatorController;
use crate::schedulers::{grow_interval, Scheduler, SchedulerFactory};

struct Handle {
    scheduler: Arc<dyn Scheduler>,
    stop: watch::Sender<bool>,
}

/// Owns the active scheduler set. Adding spawns a ticker; removing stops
/// it and deletes the persisted config; pausing is time-bounded.
pub struct SchedulerController {
    kv: Arc<dyn CoordKv>,
    cluster: Arc<dyn ClusterInformer>,
    opc: Arc<OperatorController>,
    labeler: Arc<RegionLabeler>,
    pause: Arc<PauseController>,
    handles: Mutex<AHashMap<String, Handle>>,
    shutdown: watch::Receiver<bool>,
}

impl SchedulerController {
    pub fn new(
        kv: Arc<dyn CoordKv>,
        cluster: Arc<dyn ClusterInformer>,
        opc: Arc<OperatorController>,
        labeler: Arc<RegionLabeler>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            kv,
            cluster,
            opc,
            labeler,
            pause: Arc::new(PauseController::new()),
            handles: Mutex::new(AHashMap::new()),
            shutdown,
        }
    }

    pub fn scheduler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handles.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Scheduler>> {
        self.handles.lock().get(name).map(|h| Arc::clone(&h.scheduler))
    }

    /// Registers and starts a scheduler, persisting its config blob.
    pub async fn add_scheduler(&self, scheduler: Arc<dyn Scheduler>) -> Result<()> {
        let name = scheduler.name();
        if self.handles.lock().contains_key(&name) {
            return Err(PdError::InvalidInput(format!(
                "scheduler {name:?} already exists"
            )));
        }
        self.kv
            .save(&keys::scheduler_config_path(&name), scheduler.encode_config()?)
            .await?;
        let (stop_tx, stop_rx) = watch::channel(false);
        self.spawn_ticker(Arc::clone(&scheduler), stop_rx);
        self.handles.lock().insert(
            name.clone(),
            Handle {
                scheduler,
                stop: stop_tx,
            },
        );
        info!(target: "scheduler", %name, "scheduler added");
        Ok(())
    }

    /// Stops a scheduler and deletes its persisted config.
    pub async fn remove_scheduler(&self, name: &str) -> Result<()> {
        let handle = self
            .handles
            .lock()
            .remove(name)
            .ok_or_else(|| PdError::InvalidInput(format!("scheduler {name:?} not found")))?;
        let _ = handle.stop.send(true);
        self.kv.remove(&keys::scheduler_config_path(name)).await?;
        info!(target: "scheduler", %name, "scheduler removed");
        Ok(())
    }

    /// Pauses a scheduler for `seconds` (0 resumes).
    pub fn pause_scheduler(&self, name: &str, seconds: u64) -> Result<()> {
        if !self.handles.lock().contains_key(name) {
            return Err(PdError::InvalidInput(format!("scheduler {name:?} not found")));
        }
        self.pause.pause(name, Duration::from_secs(seconds));
        info!(target: "scheduler", %name, seconds, "scheduler pause updated");
        Ok(())
    }

    /// Re-creates schedulers from their persisted config blobs; called on
    /// winning leadership, after the defaults are registered.
    pub async fn load_persisted(&self, factory: &SchedulerFactory) -> Result<()> {
        let end = keys::range_end_of_prefix(keys::SCHEDULER_CONFIG_PREFIX);
        for kv in self
            .kv
            .load_range(keys::SCHEDULER_CONFIG_PREFIX, &end, 0)
            .await?
        {
            let name = kv
                .key
                .strip_prefix(keys::SCHEDULER_CONFIG_PREFIX)
                .unwrap_or_default()
                .to_string();
            if self.handles.lock().contains_key(&name) {
                continue;
            }
            let kind = name.strip_suffix("-scheduler").unwrap_or(&name);
            match factory.build_persisted(kind, &kv.value) {
                Ok(scheduler) => {
                    if let Err(e) = self.add_scheduler(scheduler).await {
                        warn!(target: "scheduler", %name, error = %e, "persisted scheduler rejected");
                    }
                }
                Err(e) => {
                    warn!(target: "scheduler", %name, error = %e, "persisted scheduler config unreadable");
                }
            }
        }
        Ok(())
    }

    /// Stops every ticker; called on step-down.
    pub fn stop_all(&self) {
        let mut handles = self.handles.lock();
        for (name, handle) in handles.drain() {
            let _ = handle.stop.send(true);
            debug!(target: "scheduler", %name, "scheduler stopped");
        }
    }

    fn spawn_ticker(&self, scheduler: Arc<dyn Scheduler>, mut stop: watch::Receiver<bool>) {
        let cluster = Arc::clone(&self.cluster);
        let opc = Arc::clone(&self.opc);
        let labeler = Arc::clone(&self.labeler);
        let pause = Arc::clone(&self.pause);
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let name = scheduler.name();
            let mut interval = scheduler.min_interval();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if pause.is_paused(&name) {
                            interval = scheduler.max_interval();
                            continue;
                        }
                        if !scheduler.is_schedule_allowed(cluster.as_ref(), &opc) {
                            interval = grow_interval(interval, scheduler.max_interval());
                            continue;
                        }
                        let ops = scheduler.schedule(cluster.as_ref());
                        let mut added = 0usize;
                        for op in ops {
                            let Some(region) = cluster.get_region(op.region_id) else {
                                continue;
                            };
                            // Deny-labelled ranges are dropped silently.
                            if labeler.schedule_disabled(&region) {
                                continue;
                            }
                            match opc.add_operator(&region, op) {
                                Ok(true) => added += 1,
                                Ok(false) => {}
                                Err(e) => {
                                    warn!(target: "scheduler", scheduler = %name, error = %e, "operator rejected");
                                }
                            }
                        }
                        // Productive ticks reset the cadence; empty ones
                        // back off toward the ceiling.
                        interval = if added > 0 {
                            scheduler.min_interval()
                        } else {
                            grow_interval(interval, scheduler.max_interval())
                        };
                    }
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            return;
                        }
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
}
