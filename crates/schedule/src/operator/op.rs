// Path: crates/schedule/src/operator/op.rs
//! The operator itself: kinds, priorities, status, and step driving.

use std::time::Instant;

use meridian_cluster::RegionInfo;
use meridian_types::{RegionEpoch, RegionId};
use serde::{Deserialize, Serialize};

use crate::operator::step::OpStep;

/// Bitmask of what an operator touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpKind(u16);

impl OpKind {
    pub const LEADER: OpKind = OpKind(1 << 0);
    pub const REGION: OpKind = OpKind(1 << 1);
    pub const SPLIT: OpKind = OpKind(1 << 2);
    pub const MERGE: OpKind = OpKind(1 << 3);
    pub const ADMIN: OpKind = OpKind(1 << 4);
    pub const HOT: OpKind = OpKind(1 << 5);

    pub fn union(self, other: OpKind) -> OpKind {
        OpKind(self.0 | other.0)
    }

    pub fn contains(self, other: OpKind) -> bool {
        self.0 & other.0 == other.0
    }
}

/// Admission priority. `Ord` follows urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub enum OpPriority {
    Low,
    #[default]
    Medium,
    High,
    Urgent,
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    /// Created, admission not granted yet.
    Pending,
    /// First step sent.
    Started,
    /// Advancing step by step against heartbeats.
    Running,
    /// All steps observed complete.
    Finished,
    /// A step sat too long without progress.
    Timeout,
    /// Cancelled (region vanished, or admin action).
    Cancel,
    /// Superseded by a higher-priority operator.
    Replace,
}

/// Outcome of driving an operator against a fresh region state.
#[derive(Debug, Clone)]
pub enum OpCheck {
    /// Every step's post-state is visible.
    Finished,
    /// The current step exceeded its timeout.
    Timeout,
    /// Still working; (re)send this step.
    Progress(OpStep),
}

/// A planned multi-step mutation of one region. At most one exists per
/// region at a time; the operator controller owns them.
#[derive(Debug, Clone)]
pub struct Operator {
    /// Short machine-readable purpose, e.g. `add-rule-peer`.
    pub desc: String,
    pub region_id: RegionId,
    /// Region epoch when the operator was planned.
    pub epoch: RegionEpoch,
    pub kind: OpKind,
    pub priority: OpPriority,
    pub steps: Vec<OpStep>,
    pub status: OpStatus,
    current_step: usize,
    created_at: Instant,
    step_started_at: Instant,
}

impl Operator {
    pub fn new(
        desc: impl Into<String>,
        region_id: RegionId,
        epoch: RegionEpoch,
        kind: OpKind,
        priority: OpPriority,
        steps: Vec<OpStep>,
    ) -> Self {
        let now = Instant::now();
        Self {
            desc: desc.into(),
            region_id,
            epoch,
            kind,
            priority,
            steps,
            status: OpStatus::Pending,
            current_step: 0,
            created_at: now,
            step_started_at: now,
        }
    }

    /// The step currently being driven.
    pub fn current(&self) -> Option<&OpStep> {
        self.steps.get(self.current_step)
    }

    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Marks the operator started (first step handed to a store).
    pub fn start(&mut self) {
        if self.status == OpStatus::Pending {
            self.status = OpStatus::Started;
            self.step_started_at = Instant::now();
        }
    }

    /// Drives the operator against a freshly observed region state:
    /// advances past every completed step (resetting the step clock on
    /// each advance, so observed progress defers the timeout), then
    /// reports what to do next.
    pub fn check(&mut self, region: &RegionInfo) -> OpCheck {
        loop {
            let step = match self.steps.get(self.current_step) {
                Some(step) => step.clone(),
                None => {
                    self.status = OpStatus::Finished;
                    return OpCheck::Finished;
                }
            };
            if step.is_finished(region) {
                self.current_step += 1;
                self.step_started_at = Instant::now();
                continue;
            }
            if self.step_started_at.elapsed() > step.timeout() {
                self.status = OpStatus::Timeout;
                return OpCheck::Timeout;
            }
            self.status = OpStatus::Running;
            return OpCheck::Progress(step);
        }
    }

    /// Admission costs of all steps against the per-store limiters.
    pub fn admission_costs(
        &self,
    ) -> Vec<(meridian_types::StoreId, crate::operator::limit::LimitType, f64)> {
        self.steps.iter().filter_map(|s| s.admission_cost()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_types::{Peer, PeerRole, RegionMeta};

    fn region(peers: Vec<Peer>, leader_idx: usize) -> RegionInfo {
        RegionInfo {
            leader: peers.get(leader_idx).cloned(),
            meta: RegionMeta {
                id: 1,
                epoch: RegionEpoch::new(1, 1),
                peers,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn move_peer_operator() -> Operator {
        Operator::new(
            "move-peer",
            1,
            RegionEpoch::new(1, 1),
            OpKind::REGION,
            OpPriority::Medium,
            vec![
                OpStep::AddLearner {
                    store_id: 3,
                    peer_id: 30,
                },
                OpStep::PromoteLearner {
                    store_id: 3,
                    peer_id: 30,
                },
                OpStep::RemovePeer {
                    store_id: 1,
                    peer_id: 10,
                },
            ],
        )
    }

    #[test]
    fn operator_advances_with_observed_state() {
        let mut op = move_peer_operator();
        let s1 = region(vec![Peer::voter(10, 1), Peer::voter(11, 2)], 1);
        match op.check(&s1) {
            OpCheck::Progress(OpStep::AddLearner { store_id: 3, .. }) => {}
            other => panic!("unexpected {other:?}"),
        }
        let s2 = region(
            vec![Peer::voter(10, 1), Peer::voter(11, 2), Peer::learner(30, 3)],
            1,
        );
        match op.check(&s2) {
            OpCheck::Progress(OpStep::PromoteLearner { .. }) => {}
            other => panic!("unexpected {other:?}"),
        }
        let mut promoted = s2.clone();
        promoted.meta.peers[2].role = PeerRole::Voter;
        match op.check(&promoted) {
            OpCheck::Progress(OpStep::RemovePeer { peer_id: 10, .. }) => {}
            other => panic!("unexpected {other:?}"),
        }
        let done = region(vec![Peer::voter(11, 2), Peer::voter(30, 3)], 0);
        assert!(matches!(op.check(&done), OpCheck::Finished));
        assert_eq!(op.status, OpStatus::Finished);
    }

    #[test]
    fn priorities_order_by_urgency() {
        assert!(OpPriority::Urgent > OpPriority::High);
        assert!(OpPriority::High > OpPriority::Medium);
        assert!(OpPriority::Medium > OpPriority::Low);
    }

    #[test]
    fn kind_mask_composes() {
        let k = OpKind::LEADER.union(OpKind::ADMIN);
        assert!(k.contains(OpKind::LEADER));
        assert!(k.contains(OpKind::ADMIN));
        assert!(!k.contains(OpKind::MERGE));
    }

    #[test]
    fn admission_costs_cover_both_ends_of_a_move() {
        let op = move_peer_operator();
        let costs = op.admission_costs();
        assert_eq!(costs.len(), 2);
        assert_eq!(costs[0].0, 3);
        assert_eq!(costs[1].0, 1);
    }
}
