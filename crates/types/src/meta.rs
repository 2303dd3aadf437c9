// Path: crates/types/src/meta.rs
//! Store, region, and peer metadata.
//!
//! These are the persisted shapes of cluster metadata: everything here is
//! plain data, serialized as JSON into the Coordination Store and carried
//! verbatim in heartbeats. Indexes and behavior live in `meridian-cluster`;
//! per the arena-plus-ID design, nothing in this module holds a reference
//! to anything else — cross-references are always IDs.

use serde::{Deserialize, Serialize};

use crate::{Key, PeerId, RegionId, StoreId};

/// Administrative state of a store. Transitions are monotonic:
/// Up → Offline → Tombstone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StoreState {
    /// Serving reads and writes.
    #[default]
    Up,
    /// Being drained; still serving but scheduled away from.
    Offline,
    /// Fully removed; kept only as a grave marker.
    Tombstone,
}

/// Lifecycle state of the storage node process, orthogonal to
/// [`StoreState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum NodeState {
    /// Came up but is still importing or warming.
    Preparing,
    /// Fully serving.
    #[default]
    Serving,
    /// Draining regions ahead of removal.
    Removing,
    /// Gone.
    Removed,
}

/// One `key=value` label on a store, used by placement rules and for
/// isolation-level diversification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreLabel {
    /// Label key, e.g. `zone` or `host`.
    pub key: String,
    /// Label value, e.g. `z1`.
    pub value: String,
}

/// Persisted metadata of a storage node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StoreMeta {
    /// Cluster-unique store ID, from the ID allocator.
    pub id: StoreId,
    /// Network address the node serves on. Unique among non-tombstones.
    pub address: String,
    /// Filesystem path the node stores data under.
    pub deploy_path: String,
    /// Storage node software version.
    pub version: String,
    /// Ordered label set.
    pub labels: Vec<StoreLabel>,
    /// Administrative state.
    pub state: StoreState,
    /// Process lifecycle state.
    pub node_state: NodeState,
    /// Set when the node's disks are gone for good; peers on it can be
    /// replaced without waiting for the down timeout.
    pub physically_destroyed: bool,
}

impl StoreMeta {
    /// Looks up a label value by key.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.key == key)
            .map(|l| l.value.as_str())
    }

    /// Whether the store may still host new peers.
    pub fn is_up(&self) -> bool {
        self.state == StoreState::Up
    }

    /// Whether the store is a grave marker.
    pub fn is_tombstone(&self) -> bool {
        self.state == StoreState::Tombstone
    }
}

/// Consensus role of a peer within its region.
///
/// `IncomingVoter` and `DemotingVoter` only appear while a joint-consensus
/// membership change is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PeerRole {
    /// Full voting member.
    #[default]
    Voter,
    /// Receives the log but does not vote.
    Learner,
    /// Voter being added under joint consensus.
    IncomingVoter,
    /// Voter being demoted under joint consensus.
    DemotingVoter,
}

impl PeerRole {
    /// Whether the role votes in the current configuration.
    pub fn is_voter(&self) -> bool {
        matches!(self, Self::Voter | Self::IncomingVoter | Self::DemotingVoter)
    }
}

/// One replica of a region, hosted on a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Peer {
    /// Globally unique peer ID, from the ID allocator.
    pub id: PeerId,
    /// The store hosting this replica.
    pub store_id: StoreId,
    /// Consensus role.
    pub role: PeerRole,
    /// Participates in consensus without holding data.
    pub is_witness: bool,
}

impl Peer {
    /// A plain voter peer.
    pub fn voter(id: PeerId, store_id: StoreId) -> Self {
        Self {
            id,
            store_id,
            role: PeerRole::Voter,
            is_witness: false,
        }
    }

    /// A learner peer.
    pub fn learner(id: PeerId, store_id: StoreId) -> Self {
        Self {
            id,
            store_id,
            role: PeerRole::Learner,
            is_witness: false,
        }
    }
}

/// Version pair ordering region metadata updates.
///
/// `conf_ver` increments on every membership change, `version` on every
/// split or merge. An update is stale iff it is strictly behind the stored
/// epoch in the product order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RegionEpoch {
    /// Membership-change counter.
    pub conf_ver: u64,
    /// Split/merge counter.
    pub version: u64,
}

impl RegionEpoch {
    /// Builds an epoch pair.
    pub fn new(conf_ver: u64, version: u64) -> Self {
        Self { conf_ver, version }
    }

    /// True when `self` is behind `other` in the product order. Accepted
    /// epochs must be component-wise non-decreasing, so an update that is
    /// behind on either component is stale.
    pub fn is_stale_against(&self, other: &RegionEpoch) -> bool {
        self.conf_ver < other.conf_ver || self.version < other.version
    }
}

/// Persisted metadata of a region: a contiguous `[start, end)` key range
/// replicated as one consensus group.
///
/// An empty `end_key` means the range extends to the end of the key space;
/// an empty `start_key` means it begins at the start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RegionMeta {
    /// Cluster-unique region ID, from the ID allocator.
    pub id: RegionId,
    /// Inclusive start boundary.
    pub start_key: Key,
    /// Exclusive end boundary; empty means +∞.
    pub end_key: Key,
    /// Metadata epoch.
    pub epoch: RegionEpoch,
    /// Ordered replica list; unique by peer ID and by store ID.
    pub peers: Vec<Peer>,
}

impl RegionMeta {
    /// Whether `key` falls inside this region's range.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_slice() && (self.end_key.is_empty() || key < self.end_key.as_slice())
    }

    /// Whether the two ranges intersect.
    pub fn overlaps(&self, other: &RegionMeta) -> bool {
        let self_ends_after_other_starts =
            self.end_key.is_empty() || self.end_key.as_slice() > other.start_key.as_slice();
        let other_ends_after_self_starts =
            other.end_key.is_empty() || other.end_key.as_slice() > self.start_key.as_slice();
        self_ends_after_other_starts && other_ends_after_self_starts
    }

    /// The peer hosted on `store_id`, if any.
    pub fn peer_on_store(&self, store_id: StoreId) -> Option<&Peer> {
        self.peers.iter().find(|p| p.store_id == store_id)
    }

    /// The peer with the given peer ID, if any.
    pub fn peer_by_id(&self, peer_id: PeerId) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == peer_id)
    }

    /// Basic shape validation: non-zero ID, non-empty peers, peers unique
    /// by peer ID and by store ID.
    pub fn validate(&self) -> crate::Result<()> {
        if self.id == 0 {
            return Err(crate::PdError::InvalidInput("region id must not be 0".into()));
        }
        if self.peers.is_empty() {
            return Err(crate::PdError::InvalidInput(format!(
                "region {} has no peers",
                self.id
            )));
        }
        for (i, p) in self.peers.iter().enumerate() {
            for q in &self.peers[..i] {
                if p.id == q.id {
                    return Err(crate::PdError::InvalidInput(format!(
                        "region {} has duplicate peer id {}",
                        self.id, p.id
                    )));
                }
                if p.store_id == q.store_id {
                    return Err(crate::PdError::InvalidInput(format!(
                        "region {} has two peers on store {}",
                        self.id, p.store_id
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: &[u8], end: &[u8]) -> RegionMeta {
        RegionMeta {
            id: 1,
            start_key: start.to_vec(),
            end_key: end.to_vec(),
            epoch: RegionEpoch::new(1, 1),
            peers: vec![Peer::voter(2, 1)],
            ..Default::default()
        }
    }

    #[test]
    fn contains_key_handles_open_end() {
        let r = region(b"b", b"");
        assert!(r.contains_key(b"b"));
        assert!(r.contains_key(b"zzz"));
        assert!(!r.contains_key(b"a"));
    }

    #[test]
    fn overlap_is_exclusive_at_the_boundary() {
        let a = region(b"a", b"m");
        let b = region(b"m", b"z");
        assert!(!a.overlaps(&b));
        let c = region(b"l", b"n");
        assert!(a.overlaps(&c));
        assert!(b.overlaps(&c));
    }

    #[test]
    fn epoch_staleness_is_product_order() {
        let stored = RegionEpoch::new(10, 10);
        assert!(RegionEpoch::new(10, 9).is_stale_against(&stored));
        assert!(RegionEpoch::new(9, 10).is_stale_against(&stored));
        assert!(!RegionEpoch::new(10, 10).is_stale_against(&stored));
        assert!(!RegionEpoch::new(11, 10).is_stale_against(&stored));
        // Ahead on one component does not excuse being behind on the other.
        assert!(RegionEpoch::new(11, 9).is_stale_against(&stored));
    }

    #[test]
    fn validate_rejects_duplicate_stores() {
        let mut r = region(b"", b"");
        r.peers.push(Peer::voter(3, 1));
        assert!(r.validate().is_err());
    }
}
