// Path: crates/schedule/src/checker/mod.rs
//! Checkers: per-region repair against the placement policy.
//!
//! Each checker inspects one region and proposes at most one operator
//! (the merge checker proposes the source/target pair). The suite runs
//! them in fixed order under the pause controller; the first checker to
//! propose wins the region for this tick.

pub mod learner;
pub mod merge;
pub mod replica;
pub mod rule_check;

use std::time::{Duration, Instant};

use ahash::AHashMap;
use meridian_cluster::RegionInfo;
use parking_lot::Mutex;

use crate::informer::ClusterInformer;
use crate::operator::Operator;

pub use learner::LearnerChecker;
pub use merge::MergeChecker;
pub use replica::ReplicaChecker;
pub use rule_check::RuleChecker;

/// One repair duty.
pub trait Checker: Send + Sync {
    fn name(&self) -> &'static str;
    /// Proposes operators for `region`; empty means nothing to fix.
    fn check(&self, cluster: &dyn ClusterInformer, region: &RegionInfo) -> Vec<Operator>;
}

/// Time-bounded pausing of individual checkers (and schedulers).
#[derive(Default)]
pub struct PauseController {
    paused_until: Mutex<AHashMap<String, Instant>>,
}

impl PauseController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pauses `name` for `duration`; zero resumes immediately.
    pub fn pause(&self, name: &str, duration: Duration) {
        if duration.is_zero() {
            self.paused_until.lock().remove(name);
        } else {
            self.paused_until
                .lock()
                .insert(name.to_string(), Instant::now() + duration);
        }
    }

    pub fn is_paused(&self, name: &str) -> bool {
        let mut paused = self.paused_until.lock();
        match paused.get(name) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                paused.remove(name);
                false
            }
            None => false,
        }
    }
}

/// The fixed checker pipeline.
pub struct CheckerSuite {
    pub pause: PauseController,
    checkers: Vec<Box<dyn Checker>>,
}

impl CheckerSuite {
    /// Builds the standard order: rules (or the legacy replica checker
    /// when rules are disabled) first, then learner promotion, then merge.
    pub fn new(checkers: Vec<Box<dyn Checker>>) -> Self {
        Self {
            pause: PauseController::new(),
            checkers,
        }
    }

    /// Runs the pipeline for one region; first proposal wins.
    pub fn check_region(
        &self,
        cluster: &dyn ClusterInformer,
        region: &RegionInfo,
    ) -> Vec<Operator> {
        for checker in &self.checkers {
            if self.pause.is_paused(checker.name()) {
                continue;
            }
            let ops = checker.check(cluster, region);
            if !ops.is_empty() {
                return ops;
            }
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_expires() {
        let pause = PauseController::new();
        assert!(!pause.is_paused("rule"));
        pause.pause("rule", Duration::from_secs(60));
        assert!(pause.is_paused("rule"));
        pause.pause("rule", Duration::ZERO);
        assert!(!pause.is_paused("rule"));
    }
}
