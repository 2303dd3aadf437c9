// Path: crates/sync/src/client.rs
//! Follower-side apply loop.

use std::sync::Arc;
use std::time::Duration;

use meridian_cluster::Cluster;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::server::SyncMessage;

/// How long the apply loop may linger after a shutdown signal.
const EXIT_DEADLINE: Duration = Duration::from_millis(500);

/// Applies a primary's sync stream into this follower's region index.
pub struct SyncClient {
    cluster: Arc<Cluster>,
    last_applied: u64,
}

impl SyncClient {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self {
            cluster,
            last_applied: 0,
        }
    }

    /// The revision to resume from after a disconnect.
    pub fn next_revision(&self) -> u64 {
        self.last_applied + 1
    }

    /// Drains `stream` until it ends or `shutdown` fires, applying every
    /// message. Returns the revision to resume from. Exit on shutdown is
    /// bounded so step-down never leaks the task.
    pub async fn run(
        &mut self,
        mut stream: mpsc::Receiver<SyncMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) -> u64 {
        loop {
            tokio::select! {
                msg = stream.recv() => {
                    match msg {
                        Some(msg) => self.apply(msg),
                        None => {
                            debug!(target: "sync", "sync stream ended");
                            return self.next_revision();
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // Drain whatever is already buffered, bounded.
                        let deadline = tokio::time::sleep(EXIT_DEADLINE);
                        tokio::pin!(deadline);
                        loop {
                            tokio::select! {
                                msg = stream.recv() => match msg {
                                    Some(msg) => self.apply(msg),
                                    None => break,
                                },
                                _ = &mut deadline => break,
                            }
                        }
                        info!(target: "sync", last_applied = self.last_applied, "sync client stopped");
                        return self.next_revision();
                    }
                }
            }
        }
    }

    fn apply(&mut self, msg: SyncMessage) {
        match msg {
            SyncMessage::Snapshot { revision, regions } => {
                debug!(target: "sync", revision, count = regions.len(), "applying snapshot");
                for region in regions {
                    if let Err(e) = self.cluster.apply_synced_region((*region).clone()) {
                        warn!(target: "sync", error = %e, "snapshot region rejected");
                    }
                }
                self.last_applied = revision;
            }
            SyncMessage::Delta(update) => {
                if let Err(e) = self.cluster.apply_synced_region((*update.region).clone()) {
                    warn!(target: "sync", revision = update.revision, error = %e, "synced region rejected");
                }
                self.last_applied = update.revision;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::RegionSyncer;
    use meridian_cluster::{ClusterOptions, RegionInfo};
    use meridian_store::{CoordKv, MemStore};
    use meridian_types::{Peer, RegionEpoch, RegionMeta};

    fn empty_cluster() -> Arc<Cluster> {
        Arc::new(Cluster::new(
            Arc::new(MemStore::new()) as Arc<dyn CoordKv>,
            ClusterOptions::default(),
        ))
    }

    fn region(id: u64, start: &[u8], end: &[u8], version: u64) -> Arc<RegionInfo> {
        let peers = vec![Peer::voter(id * 10, 1)];
        Arc::new(RegionInfo {
            leader: peers.first().cloned(),
            meta: RegionMeta {
                id,
                start_key: start.to_vec(),
                end_key: end.to_vec(),
                epoch: RegionEpoch::new(1, version),
                peers,
            },
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn follower_converges_with_the_primary() {
        let primary = empty_cluster();
        let follower = empty_cluster();
        let syncer = RegionSyncer::new(100);

        let stream = syncer.start_sync("pd-2", 1, &primary);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut client = SyncClient::new(Arc::clone(&follower));
        let apply = tokio::spawn(async move { client.run(stream, shutdown_rx).await });

        // Primary accepts a split of the key space.
        let updates = [
            region(1, b"", b"", 1),
            region(1, b"", b"m", 2),
            region(2, b"m", b"", 2),
        ];
        for u in updates {
            primary.apply_synced_region((*u).clone()).unwrap();
            syncer.broadcast(u);
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        let resume = apply.await.unwrap();
        assert_eq!(resume, 4);

        assert_eq!(follower.region_count(), primary.region_count());
        for region in primary.all_regions() {
            let mirrored = follower.get_region_by_id(region.id()).unwrap();
            assert_eq!(mirrored.meta, region.meta);
            assert_eq!(mirrored.leader, region.leader);
        }
    }

    #[tokio::test]
    async fn snapshot_bootstraps_a_cold_follower() {
        let primary = empty_cluster();
        let follower = empty_cluster();
        let syncer = RegionSyncer::new(2);

        for (i, (s, e)) in [(b"".as_slice(), b"h".as_slice()), (b"h".as_slice(), b"".as_slice())]
            .iter()
            .enumerate()
        {
            let r = region(i as u64 + 1, s, e, 2);
            primary.apply_synced_region((*r).clone()).unwrap();
            syncer.broadcast(r);
        }
        // Push enough extra updates to age revision 1 out of the ring.
        for v in 3..7 {
            let r = region(1, b"", b"h", v);
            primary.apply_synced_region((*r).clone()).unwrap();
            syncer.broadcast(r);
        }

        let stream = syncer.start_sync("pd-3", 1, &primary);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut client = SyncClient::new(Arc::clone(&follower));
        let apply = tokio::spawn(async move { client.run(stream, shutdown_rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        apply.await.unwrap();

        assert_eq!(follower.region_count(), 2);
        assert_eq!(
            follower.get_region_by_id(1).unwrap().epoch(),
            RegionEpoch::new(1, 6)
        );
    }
}
