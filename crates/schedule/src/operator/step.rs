// Path: crates/schedule/src/operator/step.rs
//! Individual operator steps and their completion predicates.
//!
//! A step names the post-state it drives toward; the controller advances
//! when a region heartbeat exhibits that state. Steps that move data get
//! the slow timeout, metadata-only steps the fast one.

use std::time::Duration;

use meridian_cluster::RegionInfo;
use meridian_types::{Key, PeerId, PeerRole, RegionMeta, StoreId};
use serde::{Deserialize, Serialize};

/// Metadata-only steps must complete within this.
pub const FAST_STEP_TIMEOUT: Duration = Duration::from_secs(10);
/// Data-moving and joint-consensus steps get the conservative ceiling;
/// observed progress resets the clock.
pub const SLOW_STEP_TIMEOUT: Duration = Duration::from_secs(600);

/// One step of an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpStep {
    /// Add a learner peer on a store.
    AddLearner { store_id: StoreId, peer_id: PeerId },
    /// Promote a learner to voter.
    PromoteLearner { store_id: StoreId, peer_id: PeerId },
    /// Demote a voter to learner.
    DemoteVoter { store_id: StoreId, peer_id: PeerId },
    /// Remove a peer outright.
    RemovePeer { store_id: StoreId, peer_id: PeerId },
    /// Move leadership onto a store.
    TransferLeader { to_store: StoreId },
    /// Turn a peer into a witness.
    BecomeWitness { peer_id: PeerId },
    /// Give a witness its data back.
    BecomeNonWitness { peer_id: PeerId },
    /// Merge this region into `target` (or absorb, when passive).
    MergeRegion { target: RegionMeta, is_passive: bool },
    /// Split at the given keys; completion is the version bump past
    /// `start_version`.
    SplitRegion { start_version: u64, split_keys: Vec<Key> },
    /// Enter joint consensus: promotions and demotions as one atomic
    /// config change.
    ChangePeerV2Enter {
        promotes: Vec<(StoreId, PeerId)>,
        demotes: Vec<(StoreId, PeerId)>,
    },
    /// Leave joint consensus.
    ChangePeerV2Leave {
        promotes: Vec<(StoreId, PeerId)>,
        demotes: Vec<(StoreId, PeerId)>,
    },
}

impl OpStep {
    /// Whether `region`'s observed state shows the step has taken effect.
    pub fn is_finished(&self, region: &RegionInfo) -> bool {
        match self {
            OpStep::AddLearner { peer_id, .. } => region.meta.peer_by_id(*peer_id).is_some(),
            OpStep::PromoteLearner { peer_id, .. } => region
                .meta
                .peer_by_id(*peer_id)
                .is_some_and(|p| p.role == PeerRole::Voter),
            OpStep::DemoteVoter { peer_id, .. } => region
                .meta
                .peer_by_id(*peer_id)
                .is_some_and(|p| p.role == PeerRole::Learner),
            OpStep::RemovePeer { peer_id, .. } => region.meta.peer_by_id(*peer_id).is_none(),
            OpStep::TransferLeader { to_store } => region.leader_store_id() == Some(*to_store),
            OpStep::BecomeWitness { peer_id } => region
                .meta
                .peer_by_id(*peer_id)
                .is_some_and(|p| p.is_witness),
            OpStep::BecomeNonWitness { peer_id } => region
                .meta
                .peer_by_id(*peer_id)
                .is_some_and(|p| !p.is_witness),
            OpStep::MergeRegion { target, .. } => {
                region.meta.start_key == target.start_key && region.meta.end_key == target.end_key
            }
            OpStep::SplitRegion { start_version, .. } => {
                region.epoch().version > *start_version
            }
            OpStep::ChangePeerV2Enter { promotes, demotes } => {
                promotes.iter().all(|(_, id)| {
                    region
                        .meta
                        .peer_by_id(*id)
                        .is_some_and(|p| p.role.is_voter())
                }) && demotes.iter().all(|(_, id)| {
                    region.meta.peer_by_id(*id).is_some_and(|p| {
                        matches!(p.role, PeerRole::DemotingVoter | PeerRole::Learner)
                    })
                })
            }
            OpStep::ChangePeerV2Leave { promotes, demotes } => {
                let no_joint = region.meta.peers.iter().all(|p| {
                    !matches!(p.role, PeerRole::IncomingVoter | PeerRole::DemotingVoter)
                });
                no_joint
                    && promotes.iter().all(|(_, id)| {
                        region
                            .meta
                            .peer_by_id(*id)
                            .is_some_and(|p| p.role == PeerRole::Voter)
                    })
                    && demotes.iter().all(|(_, id)| {
                        region
                            .meta
                            .peer_by_id(*id)
                            .map_or(true, |p| p.role == PeerRole::Learner)
                    })
            }
        }
    }

    /// How long the step may sit without observed progress.
    pub fn timeout(&self) -> Duration {
        match self {
            OpStep::TransferLeader { .. }
            | OpStep::PromoteLearner { .. }
            | OpStep::DemoteVoter { .. }
            | OpStep::RemovePeer { .. }
            | OpStep::BecomeWitness { .. }
            | OpStep::BecomeNonWitness { .. } => FAST_STEP_TIMEOUT,
            OpStep::AddLearner { .. }
            | OpStep::MergeRegion { .. }
            | OpStep::SplitRegion { .. }
            | OpStep::ChangePeerV2Enter { .. }
            | OpStep::ChangePeerV2Leave { .. } => SLOW_STEP_TIMEOUT,
        }
    }

    /// Admission cost against the per-store limiters.
    pub fn admission_cost(&self) -> Option<(StoreId, crate::operator::limit::LimitType, f64)> {
        use crate::operator::limit::LimitType;
        match self {
            OpStep::AddLearner { store_id, .. } => Some((*store_id, LimitType::AddPeer, 1.0)),
            OpStep::RemovePeer { store_id, .. } => Some((*store_id, LimitType::RemovePeer, 1.0)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_types::{Peer, RegionEpoch};

    fn region(peers: Vec<Peer>, leader_idx: usize, version: u64) -> RegionInfo {
        RegionInfo {
            leader: peers.get(leader_idx).cloned(),
            meta: RegionMeta {
                id: 1,
                epoch: RegionEpoch::new(1, version),
                peers,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn add_learner_completes_when_the_peer_appears() {
        let step = OpStep::AddLearner {
            store_id: 3,
            peer_id: 30,
        };
        let before = region(vec![Peer::voter(10, 1)], 0, 1);
        assert!(!step.is_finished(&before));
        let after = region(vec![Peer::voter(10, 1), Peer::learner(30, 3)], 0, 1);
        assert!(step.is_finished(&after));
    }

    #[test]
    fn transfer_leader_watches_the_leader_store() {
        let step = OpStep::TransferLeader { to_store: 2 };
        let peers = vec![Peer::voter(10, 1), Peer::voter(11, 2)];
        assert!(!step.is_finished(&region(peers.clone(), 0, 1)));
        assert!(step.is_finished(&region(peers, 1, 1)));
    }

    #[test]
    fn split_completes_on_version_bump() {
        let step = OpStep::SplitRegion {
            start_version: 4,
            split_keys: vec![b"m".to_vec()],
        };
        assert!(!step.is_finished(&region(vec![Peer::voter(10, 1)], 0, 4)));
        assert!(step.is_finished(&region(vec![Peer::voter(10, 1)], 0, 5)));
    }

    #[test]
    fn joint_enter_requires_both_sides() {
        let step = OpStep::ChangePeerV2Enter {
            promotes: vec![(3, 30)],
            demotes: vec![(1, 10)],
        };
        let mut peers = vec![Peer::voter(10, 1), Peer::voter(11, 2), Peer::learner(30, 3)];
        assert!(!step.is_finished(&region(peers.clone(), 1, 1)));
        peers[0].role = PeerRole::DemotingVoter;
        peers[2].role = PeerRole::IncomingVoter;
        assert!(step.is_finished(&region(peers, 1, 1)));
    }

    #[test]
    fn data_moving_steps_use_the_slow_timeout() {
        assert_eq!(
            OpStep::AddLearner {
                store_id: 1,
                peer_id: 1
            }
            .timeout(),
            SLOW_STEP_TIMEOUT
        );
        assert_eq!(OpStep::TransferLeader { to_store: 1 }.timeout(), FAST_STEP_TIMEOUT);
    }
}
