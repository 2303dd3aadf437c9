// Path: crates/cluster/src/heartbeat.rs
//! The region-heartbeat worker pool.
//!
//! Heartbeats partition by region-ID hash onto a fixed set of workers:
//! same-region heartbeats serialize, cross-region throughput scales with
//! the worker count. The pool is bounded end to end — a saturated worker
//! backpressures the submitting stream instead of spawning tasks.

use std::sync::Arc;

use meridian_types::{PdError, Result};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::cluster::{Cluster, HeartbeatEffect};
use crate::region::RegionInfo;

const WORKER_QUEUE_DEPTH: usize = 256;

/// One queued heartbeat.
pub struct HeartbeatTask {
    pub region: RegionInfo,
}

/// What the server wires into the pipeline: reactions to accepted
/// heartbeats (synchronizer broadcast, operator dispatch).
pub trait HeartbeatHooks: Send + Sync {
    fn on_region_accepted(&self, effect: &HeartbeatEffect);
}

/// No-op hooks for tests and followers.
pub struct NoHooks;

impl HeartbeatHooks for NoHooks {
    fn on_region_accepted(&self, _effect: &HeartbeatEffect) {}
}

/// Routes heartbeats to the worker owning their region ID.
pub struct HeartbeatRouter {
    senders: Vec<mpsc::Sender<HeartbeatTask>>,
}

impl HeartbeatRouter {
    /// Starts `workers` ingest workers over `cluster`.
    pub fn start(
        cluster: Arc<Cluster>,
        hooks: Arc<dyn HeartbeatHooks>,
        workers: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let workers = workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        for worker_id in 0..workers {
            let (tx, rx) = mpsc::channel(WORKER_QUEUE_DEPTH);
            senders.push(tx);
            let cluster = Arc::clone(&cluster);
            let hooks = Arc::clone(&hooks);
            let shutdown = shutdown.clone();
            tokio::spawn(worker_loop(worker_id, cluster, hooks, rx, shutdown));
        }
        Self { senders }
    }

    /// Enqueues a heartbeat, waiting if the owning worker is saturated.
    pub async fn submit(&self, task: HeartbeatTask) -> Result<()> {
        let shard = (task.region.id() as usize) % self.senders.len();
        let sender = self
            .senders
            .get(shard)
            .ok_or_else(|| PdError::Internal("heartbeat shard out of range".into()))?;
        sender
            .send(task)
            .await
            .map_err(|_| PdError::Unavailable("heartbeat workers stopped".into()))
    }
}

async fn worker_loop(
    worker_id: usize,
    cluster: Arc<Cluster>,
    hooks: Arc<dyn HeartbeatHooks>,
    mut rx: mpsc::Receiver<HeartbeatTask>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            task = rx.recv() => {
                let Some(task) = task else { return };
                let region_id = task.region.id();
                match cluster.handle_region_heartbeat(task.region).await {
                    Ok(effect) => hooks.on_region_accepted(&effect),
                    // Stale heartbeats were already logged at the source;
                    // everything else is worth a warning, and the loop
                    // always continues.
                    Err(PdError::Stale { .. }) => {}
                    Err(e) => {
                        warn!(target: "heartbeat", worker_id, region_id, error = %e, "region heartbeat failed");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!(target: "heartbeat", worker_id, "ingest worker stopped");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterOptions;
    use meridian_store::{CoordKv, MemStore};
    use meridian_types::{Peer, RegionEpoch, RegionMeta, StoreMeta, StoreState};
    use parking_lot::Mutex;

    struct Recorder(Mutex<Vec<u64>>);

    impl HeartbeatHooks for Recorder {
        fn on_region_accepted(&self, effect: &HeartbeatEffect) {
            self.0.lock().push(effect.region.id());
        }
    }

    async fn bootstrapped_cluster() -> Arc<Cluster> {
        let c = Cluster::new(Arc::new(MemStore::new()) as Arc<dyn CoordKv>, ClusterOptions::default());
        c.bootstrap(
            1,
            StoreMeta {
                id: 1,
                address: "mock://s:1".into(),
                state: StoreState::Up,
                ..Default::default()
            },
            RegionMeta {
                id: 2,
                epoch: RegionEpoch::new(1, 1),
                peers: vec![Peer::voter(3, 1)],
                ..Default::default()
            },
        )
        .await
        .unwrap();
        Arc::new(c)
    }

    #[tokio::test]
    async fn router_processes_and_reports() {
        let cluster = bootstrapped_cluster().await;
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let router = HeartbeatRouter::start(
            Arc::clone(&cluster),
            Arc::clone(&recorder) as Arc<dyn HeartbeatHooks>,
            4,
            shutdown_rx,
        );

        let mut update = RegionInfo::new(RegionMeta {
            id: 2,
            epoch: RegionEpoch::new(2, 1),
            peers: vec![Peer::voter(3, 1)],
            ..Default::default()
        });
        update.leader = Some(Peer::voter(3, 1));
        router.submit(HeartbeatTask { region: update }).await.unwrap();

        // Wait for the worker to drain.
        for _ in 0..100 {
            if !recorder.0.lock().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(recorder.0.lock().as_slice(), &[2]);
        assert_eq!(cluster.get_region_by_id(2).unwrap().epoch(), RegionEpoch::new(2, 1));
    }
}
