// Path: crates/sync/src/server.rs
//! Primary-side broadcaster.

use std::collections::VecDeque;
use std::sync::Arc;

use ahash::AHashMap;
use meridian_cluster::{Cluster, RegionInfo};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const CLIENT_CHANNEL_CAPACITY: usize = 256;

/// One region state change, tagged with its commit revision.
#[derive(Debug, Clone)]
pub struct RegionUpdate {
    pub revision: u64,
    pub region: Arc<RegionInfo>,
}

/// What flows down a sync stream.
#[derive(Debug, Clone)]
pub enum SyncMessage {
    /// Full region state as of `revision`; sent when the requested
    /// starting revision has aged out of the ring.
    Snapshot {
        revision: u64,
        regions: Vec<Arc<RegionInfo>>,
    },
    /// One committed update.
    Delta(RegionUpdate),
}

struct SyncerInner {
    next_revision: u64,
    ring: VecDeque<RegionUpdate>,
    clients: AHashMap<String, mpsc::Sender<SyncMessage>>,
}

/// The primary's broadcaster: bounded ring of recent updates plus the set
/// of connected follower streams.
pub struct RegionSyncer {
    capacity: usize,
    inner: Mutex<SyncerInner>,
}

impl RegionSyncer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(SyncerInner {
                next_revision: 1,
                ring: VecDeque::new(),
                clients: AHashMap::new(),
            }),
        }
    }

    /// The revision the next update will get.
    pub fn current_revision(&self) -> u64 {
        self.inner.lock().next_revision
    }

    /// Number of connected follower streams.
    pub fn client_count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    /// Commits an accepted region update to the ring and fans it out.
    ///
    /// A follower whose stream is saturated misses the delta; it catches
    /// up through a snapshot on its next reconnect, so the heartbeat path
    /// never blocks here.
    pub fn broadcast(&self, region: Arc<RegionInfo>) -> u64 {
        let mut inner = self.inner.lock();
        let revision = inner.next_revision;
        inner.next_revision += 1;
        let update = RegionUpdate { revision, region };
        inner.ring.push_back(update.clone());
        if inner.ring.len() > self.capacity {
            inner.ring.pop_front();
        }
        inner.clients.retain(|name, sender| {
            match sender.try_send(SyncMessage::Delta(update.clone())) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(target: "sync", follower = %name, revision, "sync stream saturated, dropping delta");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    info!(target: "sync", follower = %name, "sync stream closed");
                    false
                }
            }
        });
        revision
    }

    /// Opens a stream for `name` from `from_revision`. The backlog — ring
    /// deltas, or a snapshot of `cluster` when the revision aged out — is
    /// queued onto the stream before it is registered for live updates.
    pub fn start_sync(
        &self,
        name: &str,
        from_revision: u64,
        cluster: &Cluster,
    ) -> mpsc::Receiver<SyncMessage> {
        let (tx, rx) = mpsc::channel(CLIENT_CHANNEL_CAPACITY);
        let mut inner = self.inner.lock();
        let oldest = inner.ring.front().map(|u| u.revision);
        let backlog: Vec<SyncMessage> = match oldest {
            Some(oldest) if from_revision >= oldest => inner
                .ring
                .iter()
                .filter(|u| u.revision >= from_revision)
                .cloned()
                .map(SyncMessage::Delta)
                .collect(),
            None if from_revision >= inner.next_revision => Vec::new(),
            _ => {
                let snapshot_rev = inner.next_revision - 1;
                debug!(target: "sync", follower = %name, from_revision, snapshot_rev, "revision aged out, sending snapshot");
                vec![SyncMessage::Snapshot {
                    revision: snapshot_rev,
                    regions: cluster.all_regions(),
                }]
            }
        };
        for msg in backlog {
            // The fresh channel is at least as large as the ring backlog
            // slice we just built only when the ring is small; if the
            // backlog overflows it, fall back to a snapshot.
            if tx.try_send(msg).is_err() {
                let _ = tx.try_send(SyncMessage::Snapshot {
                    revision: inner.next_revision - 1,
                    regions: cluster.all_regions(),
                });
                break;
            }
        }
        inner.clients.insert(name.to_string(), tx);
        info!(target: "sync", follower = %name, from_revision, "sync stream opened");
        rx
    }

    /// Drops a follower's stream.
    pub fn stop_sync(&self, name: &str) {
        self.inner.lock().clients.remove(name);
    }

    /// Drops every stream and forgets the ring; called on step-down.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.clients.clear();
        inner.ring.clear();
    }
}
