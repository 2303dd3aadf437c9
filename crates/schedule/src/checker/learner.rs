// Path: crates/schedule/src/checker/learner.rs
//! Promotes learners that placement does not want kept as learners.

use std::sync::Arc;

use meridian_cluster::RegionInfo;
use meridian_types::PeerRole;

use crate::checker::Checker;
use crate::informer::ClusterInformer;
use crate::operator::{OpKind, OpPriority, OpStep, Operator};
use crate::placement::{RuleManager, RuleRole};

pub struct LearnerChecker {
    rules: Arc<RuleManager>,
}

impl LearnerChecker {
    pub fn new(rules: Arc<RuleManager>) -> Self {
        Self { rules }
    }
}

impl Checker for LearnerChecker {
    fn name(&self) -> &'static str {
        "learner-checker"
    }

    fn check(&self, _cluster: &dyn ClusterInformer, region: &RegionInfo) -> Vec<Operator> {
        // Mid-config-change regions settle on their own.
        if !region.is_healthy() {
            return Vec::new();
        }
        // A Learner-role rule means these learners are deliberate.
        if self
            .rules
            .rules_for_region(region)
            .iter()
            .any(|r| r.role == RuleRole::Learner)
        {
            return Vec::new();
        }
        let Some(learner) = region
            .meta
            .peers
            .iter()
            .find(|p| p.role == PeerRole::Learner && !p.is_witness)
        else {
            return Vec::new();
        };
        vec![Operator::new(
            "promote-learner",
            region.id(),
            region.epoch(),
            OpKind::REGION,
            OpPriority::High,
            vec![OpStep::PromoteLearner {
                store_id: learner.store_id,
                peer_id: learner.id,
            }],
        )]
    }
}
