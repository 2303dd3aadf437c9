// Path: crates/cluster/src/region.rs
//! The in-memory view of one region.

use serde::{Deserialize, Serialize};

use meridian_types::stats::{Buckets, PeerStats, RegionStats};
use meridian_types::{Peer, PeerId, RegionEpoch, RegionMeta, StoreId};

/// Where the latest accepted update of a region came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RegionSource {
    /// A storage node's region heartbeat.
    #[default]
    Heartbeat,
    /// The region synchronizer stream (on follower PDs).
    Sync,
    /// The boot-time batched load from the Coordination Store.
    Storage,
}

/// One region as the control plane sees it: persisted metadata plus the
/// volatile leadership, health, and flow information carried by
/// heartbeats.
///
/// `RegionInfo` is never mutated after installation into the region tree;
/// updates build a fresh value and swap the `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RegionInfo {
    /// Persisted metadata.
    pub meta: RegionMeta,
    /// The current leader peer, when known.
    pub leader: Option<Peer>,
    /// Peers the leader reports unreachable.
    pub down_peers: Vec<PeerStats>,
    /// Peers still catching up from a config change.
    pub pending_peers: Vec<Peer>,
    /// Flow statistics.
    pub stats: RegionStats,
    /// Sub-range statistics, when the node reports them.
    pub buckets: Option<Buckets>,
    /// Provenance of this value.
    pub source: RegionSource,
}

impl RegionInfo {
    /// Wraps bare metadata with no volatile state.
    pub fn new(meta: RegionMeta) -> Self {
        Self {
            meta,
            ..Default::default()
        }
    }

    pub fn id(&self) -> u64 {
        self.meta.id
    }

    pub fn epoch(&self) -> RegionEpoch {
        self.meta.epoch
    }

    pub fn start_key(&self) -> &[u8] {
        &self.meta.start_key
    }

    pub fn end_key(&self) -> &[u8] {
        &self.meta.end_key
    }

    /// Store hosting the leader, when known.
    pub fn leader_store_id(&self) -> Option<StoreId> {
        self.leader.as_ref().map(|p| p.store_id)
    }

    /// Peers with learner role.
    pub fn learners(&self) -> impl Iterator<Item = &Peer> {
        self.meta
            .peers
            .iter()
            .filter(|p| p.role == meridian_types::PeerRole::Learner)
    }

    /// Peers with a voting role.
    pub fn voters(&self) -> impl Iterator<Item = &Peer> {
        self.meta.peers.iter().filter(|p| p.role.is_voter())
    }

    /// Witness peers.
    pub fn witnesses(&self) -> impl Iterator<Item = &Peer> {
        self.meta.peers.iter().filter(|p| p.is_witness)
    }

    /// Whether `peer_id` is reported down.
    pub fn is_peer_down(&self, peer_id: PeerId) -> bool {
        self.down_peers.iter().any(|d| d.peer.id == peer_id)
    }

    /// Whether `peer_id` is still pending.
    pub fn is_peer_pending(&self, peer_id: PeerId) -> bool {
        self.pending_peers.iter().any(|p| p.id == peer_id)
    }

    /// A region is healthy when nothing is down, pending, or mid-config-
    /// change; only healthy regions are merge and scatter candidates.
    pub fn is_healthy(&self) -> bool {
        self.down_peers.is_empty()
            && self.pending_peers.is_empty()
            && self.meta.peers.iter().all(|p| {
                !matches!(
                    p.role,
                    meridian_types::PeerRole::IncomingVoter | meridian_types::PeerRole::DemotingVoter
                )
            })
    }

    /// Whether anything a scheduler or the synchronizer cares about
    /// differs from `other`, beyond flow statistics.
    pub fn meta_differs_from(&self, other: &RegionInfo) -> bool {
        self.meta != other.meta
            || self.leader != other.leader
            || self.down_peers != other.down_peers
            || self.pending_peers != other.pending_peers
            || self.buckets.as_ref().map(|b| b.version) != other.buckets.as_ref().map(|b| b.version)
    }
}
