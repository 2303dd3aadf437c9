// Path: crates/schedule/src/checker/rule_check.rs
//! The rule checker: repairs one region against its effective rule set.
//!
//! Repairs are ranked; the highest-ranked problem found wins the tick:
//! add-rule-peer, fix-peer-role, orphan handling (swapping an orphan into
//! a down/offline rule slot beats plain removal), fast-replace for down
//! peers, replace for offline peers, move-to-better-location, witness
//! reconciliation, and finally clearing leftover joint-consensus demotions.

use std::sync::Arc;

use meridian_cluster::{RegionInfo, StoreInfo};
use meridian_types::config::ScheduleConfig;
use meridian_types::{Peer, PeerRole, StoreId, StoreState};
use std::time::Duration;
use tracing::debug;

use crate::checker::Checker;
use crate::idsource::IdSource;
use crate::informer::ClusterInformer;
use crate::operator::{OpKind, OpPriority, OpStep, Operator};
use crate::placement::fit::{fit_region, isolation_penalty, violates_isolation_level, RegionFit, RuleFit};
use crate::placement::{Rule, RuleManager, RuleRole};

pub struct RuleChecker {
    rules: Arc<RuleManager>,
    ids: Arc<dyn IdSource>,
}

impl RuleChecker {
    pub fn new(rules: Arc<RuleManager>, ids: Arc<dyn IdSource>) -> Self {
        Self { rules, ids }
    }

    fn build(
        &self,
        cluster: &dyn ClusterInformer,
        region: &RegionInfo,
    ) -> Option<Operator> {
        let rules = self.rules.rules_for_region(region);
        if rules.is_empty() {
            return None;
        }
        let cfg = cluster.schedule_config();
        let fit = fit_region(region, &rules, |id| cluster.get_store(id));

        for rule_fit in &fit.fits {
            if rule_fit.missing() > 0 {
                if let Some(op) = self.add_rule_peer(cluster, region, rule_fit) {
                    return Some(op);
                }
            }
        }
        if let Some(op) = self.fix_peer_role(region, &fit) {
            return Some(op);
        }
        if let Some(op) = self.handle_orphans(cluster, region, &fit, &cfg) {
            return Some(op);
        }
        if let Some(op) = self.replace_unhealthy_peer(cluster, region, &fit, &cfg) {
            return Some(op);
        }
        if let Some(op) = self.move_to_better_location(cluster, region, &fit) {
            return Some(op);
        }
        if let Some(op) = self.fix_witnesses(region, &fit) {
            return Some(op);
        }
        self.fix_demoting_voters(region)
    }

    /// A rule is short of peers: add a learner on the best store and
    /// promote it if the rule wants voters.
    fn add_rule_peer(
        &self,
        cluster: &dyn ClusterInformer,
        region: &RegionInfo,
        rule_fit: &RuleFit,
    ) -> Option<Operator> {
        let rule = &rule_fit.rule;
        let existing: Vec<Arc<StoreInfo>> = rule_fit
            .peers
            .iter()
            .filter_map(|p| cluster.get_store(p.store_id))
            .collect();
        let store = self.select_store_for_rule(cluster, region, rule, &existing)?;
        let peer_id = self.ids.alloc_peer_id()?;
        let mut steps = vec![OpStep::AddLearner {
            store_id: store,
            peer_id,
        }];
        if rule.role != RuleRole::Learner {
            steps.push(OpStep::PromoteLearner {
                store_id: store,
                peer_id,
            });
        }
        Some(Operator::new(
            "add-rule-peer",
            region.id(),
            region.epoch(),
            OpKind::REGION,
            OpPriority::High,
            steps,
        ))
    }

    /// Best store for a new rule peer: most isolation diversity, then the
    /// lightest load, then the lowest ID.
    fn select_store_for_rule(
        &self,
        cluster: &dyn ClusterInformer,
        region: &RegionInfo,
        rule: &Rule,
        existing: &[Arc<StoreInfo>],
    ) -> Option<StoreId> {
        let cfg = cluster.schedule_config();
        let disconnect = Duration::from_secs(cfg.store_disconnect_secs);
        cluster
            .get_stores()
            .into_iter()
            .filter(|s| s.can_accept_peers(disconnect))
            .filter(|s| region.meta.peer_on_store(s.id()).is_none())
            .filter(|s| rule.matches_store(s))
            .filter(|s| !violates_isolation_level(rule, existing, s))
            .min_by_key(|s| {
                (
                    isolation_penalty(rule, existing, s),
                    cluster.store_region_count(s.id()),
                    s.id(),
                )
            })
            .map(|s| s.id())
    }

    /// A peer sits in a rule slot with the wrong consensus role.
    fn fix_peer_role(&self, region: &RegionInfo, fit: &RegionFit) -> Option<Operator> {
        for rule_fit in &fit.fits {
            for peer in &rule_fit.peers {
                if rule_fit.rule.role.accepts(peer.role) {
                    continue;
                }
                let step = if rule_fit.rule.role == RuleRole::Learner {
                    OpStep::DemoteVoter {
                        store_id: peer.store_id,
                        peer_id: peer.id,
                    }
                } else {
                    OpStep::PromoteLearner {
                        store_id: peer.store_id,
                        peer_id: peer.id,
                    }
                };
                return Some(Operator::new(
                    "fix-peer-role",
                    region.id(),
                    region.epoch(),
                    OpKind::REGION,
                    OpPriority::High,
                    vec![step],
                ));
            }
        }
        None
    }

    /// Orphans: swap one into a down/offline rule slot when it fits,
    /// otherwise remove one (the one on a disconnected store first).
    fn handle_orphans(
        &self,
        cluster: &dyn ClusterInformer,
        region: &RegionInfo,
        fit: &RegionFit,
        cfg: &ScheduleConfig,
    ) -> Option<Operator> {
        if fit.orphan_peers.is_empty() {
            return None;
        }
        // Swap path: a healthy orphan standing in for a dead rule peer.
        for rule_fit in &fit.fits {
            for victim in &rule_fit.peers {
                if !self.peer_is_down(cluster, region, victim, cfg)
                    && !self.peer_is_offline(cluster, victim)
                {
                    continue;
                }
                let replacement = fit.orphan_peers.iter().find(|orphan| {
                    !region.is_peer_down(orphan.id)
                        && cluster
                            .get_store(orphan.store_id)
                            .is_some_and(|s| {
                                s.meta.is_up() && rule_fit.rule.matches_store(&s)
                            })
                });
                if let Some(orphan) = replacement {
                    return Some(self.swap_operator(region, cfg, orphan, victim));
                }
            }
        }
        let disconnect = Duration::from_secs(cfg.store_disconnect_secs);
        let orphan = fit
            .orphan_peers
            .iter()
            .min_by_key(|p| {
                let connected = cluster
                    .get_store(p.store_id)
                    .is_some_and(|s| !s.is_disconnected(disconnect));
                (connected, p.id)
            })?;
        Some(Operator::new(
            "remove-orphan-peer",
            region.id(),
            region.epoch(),
            OpKind::REGION,
            OpPriority::High,
            vec![OpStep::RemovePeer {
                store_id: orphan.store_id,
                peer_id: orphan.id,
            }],
        ))
    }

    /// Promote-orphan-and-drop-victim; one atomic joint config change
    /// when joint consensus is enabled.
    fn swap_operator(
        &self,
        region: &RegionInfo,
        cfg: &ScheduleConfig,
        orphan: &Peer,
        victim: &Peer,
    ) -> Operator {
        let mut steps = Vec::new();
        if cfg.enable_joint_consensus && orphan.role == PeerRole::Learner {
            steps.push(OpStep::ChangePeerV2Enter {
                promotes: vec![(orphan.store_id, orphan.id)],
                demotes: vec![(victim.store_id, victim.id)],
            });
            steps.push(OpStep::ChangePeerV2Leave {
                promotes: vec![(orphan.store_id, orphan.id)],
                demotes: vec![(victim.store_id, victim.id)],
            });
        } else if orphan.role == PeerRole::Learner {
            steps.push(OpStep::PromoteLearner {
                store_id: orphan.store_id,
                peer_id: orphan.id,
            });
        }
        steps.push(OpStep::RemovePeer {
            store_id: victim.store_id,
            peer_id: victim.id,
        });
        Operator::new(
            "fast-replace-rule-down-peer",
            region.id(),
            region.epoch(),
            OpKind::REGION,
            OpPriority::Urgent,
            steps,
        )
    }

    /// Down (fast, urgent) or offline (ordinary) rule peers get a fresh
    /// replacement on a better store.
    fn replace_unhealthy_peer(
        &self,
        cluster: &dyn ClusterInformer,
        region: &RegionInfo,
        fit: &RegionFit,
        cfg: &ScheduleConfig,
    ) -> Option<Operator> {
        for rule_fit in &fit.fits {
            for victim in &rule_fit.peers {
                let down = self.peer_is_down(cluster, region, victim, cfg);
                let offline = !down && self.peer_is_offline(cluster, victim);
                if !down && !offline {
                    continue;
                }
                let existing: Vec<Arc<StoreInfo>> = rule_fit
                    .peers
                    .iter()
                    .filter(|p| p.id != victim.id)
                    .filter_map(|p| cluster.get_store(p.store_id))
                    .collect();
                let Some(store) =
                    self.select_store_for_rule(cluster, region, &rule_fit.rule, &existing)
                else {
                    debug!(target: "checker", region_id = region.id(), "no store available to replace peer");
                    continue;
                };
                let peer_id = self.ids.alloc_peer_id()?;
                let mut steps = vec![OpStep::AddLearner {
                    store_id: store,
                    peer_id,
                }];
                if rule_fit.rule.role != RuleRole::Learner {
                    steps.push(OpStep::PromoteLearner {
                        store_id: store,
                        peer_id,
                    });
                }
                steps.push(OpStep::RemovePeer {
                    store_id: victim.store_id,
                    peer_id: victim.id,
                });
                let (desc, priority) = if down {
                    ("fast-replace-rule-down-peer", OpPriority::Urgent)
                } else {
                    ("replace-rule-offline-peer", OpPriority::High)
                };
                return Some(Operator::new(
                    desc,
                    region.id(),
                    region.epoch(),
                    OpKind::REGION,
                    priority,
                    steps,
                ));
            }
        }
        None
    }

    /// With everything healthy, consider strictly better placement.
    fn move_to_better_location(
        &self,
        cluster: &dyn ClusterInformer,
        region: &RegionInfo,
        fit: &RegionFit,
    ) -> Option<Operator> {
        for rule_fit in &fit.fits {
            if rule_fit.rule.location_labels.is_empty() {
                continue;
            }
            // The worst-placed current peer and its penalty against its
            // own siblings.
            let (victim, current_penalty) = rule_fit
                .peers
                .iter()
                .filter_map(|p| {
                    let siblings: Vec<Arc<StoreInfo>> = rule_fit
                        .peers
                        .iter()
                        .filter(|q| q.id != p.id)
                        .filter_map(|q| cluster.get_store(q.store_id))
                        .collect();
                    let store = cluster.get_store(p.store_id)?;
                    Some((p, isolation_penalty(&rule_fit.rule, &siblings, &store)))
                })
                .max_by_key(|(p, penalty)| (*penalty, p.store_id))?;
            if current_penalty == 0 {
                continue;
            }
            let siblings: Vec<Arc<StoreInfo>> = rule_fit
                .peers
                .iter()
                .filter(|q| q.id != victim.id)
                .filter_map(|q| cluster.get_store(q.store_id))
                .collect();
            let candidate = self.select_store_for_rule(cluster, region, &rule_fit.rule, &siblings)?;
            let candidate_store = cluster.get_store(candidate)?;
            if isolation_penalty(&rule_fit.rule, &siblings, &candidate_store) >= current_penalty {
                continue;
            }
            let peer_id = self.ids.alloc_peer_id()?;
            let mut steps = vec![OpStep::AddLearner {
                store_id: candidate,
                peer_id,
            }];
            if rule_fit.rule.role != RuleRole::Learner {
                steps.push(OpStep::PromoteLearner {
                    store_id: candidate,
                    peer_id,
                });
            }
            steps.push(OpStep::RemovePeer {
                store_id: victim.store_id,
                peer_id: victim.id,
            });
            return Some(Operator::new(
                "move-to-better-location",
                region.id(),
                region.epoch(),
                OpKind::REGION,
                OpPriority::Low,
                steps,
            ));
        }
        None
    }

    /// Witness flags must match what the rule declares.
    fn fix_witnesses(&self, region: &RegionInfo, fit: &RegionFit) -> Option<Operator> {
        for rule_fit in &fit.fits {
            for peer in &rule_fit.peers {
                if peer.is_witness == rule_fit.rule.is_witness {
                    continue;
                }
                let (desc, step) = if rule_fit.rule.is_witness {
                    ("fix-witness-peer", OpStep::BecomeWitness { peer_id: peer.id })
                } else {
                    (
                        "fix-non-witness-peer",
                        OpStep::BecomeNonWitness { peer_id: peer.id },
                    )
                };
                return Some(Operator::new(
                    desc,
                    region.id(),
                    region.epoch(),
                    OpKind::REGION,
                    OpPriority::Medium,
                    vec![step],
                ));
            }
        }
        None
    }

    /// A voter stuck mid-demotion means a joint change never completed.
    fn fix_demoting_voters(&self, region: &RegionInfo) -> Option<Operator> {
        let demoting: Vec<(StoreId, u64)> = region
            .meta
            .peers
            .iter()
            .filter(|p| p.role == PeerRole::DemotingVoter)
            .map(|p| (p.store_id, p.id))
            .collect();
        let incoming: Vec<(StoreId, u64)> = region
            .meta
            .peers
            .iter()
            .filter(|p| p.role == PeerRole::IncomingVoter)
            .map(|p| (p.store_id, p.id))
            .collect();
        if demoting.is_empty() {
            return None;
        }
        Some(Operator::new(
            "fix-demote-voter",
            region.id(),
            region.epoch(),
            OpKind::REGION,
            OpPriority::High,
            vec![OpStep::ChangePeerV2Leave {
                promotes: incoming,
                demotes: demoting,
            }],
        ))
    }

    fn peer_is_down(
        &self,
        cluster: &dyn ClusterInformer,
        region: &RegionInfo,
        peer: &Peer,
        cfg: &ScheduleConfig,
    ) -> bool {
        let max_down = Duration::from_secs(cfg.max_store_down_secs);
        let store = cluster.get_store(peer.store_id);
        let store_dead = match &store {
            Some(s) => s.meta.physically_destroyed || s.is_down(max_down),
            None => true,
        };
        let reported_down = region
            .down_peers
            .iter()
            .any(|d| d.peer.id == peer.id && d.down_seconds >= cfg.max_store_down_secs);
        store_dead || reported_down
    }

    fn peer_is_offline(&self, cluster: &dyn ClusterInformer, peer: &Peer) -> bool {
        cluster
            .get_store(peer.store_id)
            .is_some_and(|s| s.meta.state == StoreState::Offline)
    }
}

impl Checker for RuleChecker {
    fn name(&self) -> &'static str {
        "rule-checker"
    }

    fn check(&self, cluster: &dyn ClusterInformer, region: &RegionInfo) -> Vec<Operator> {
        self.build(cluster, region).into_iter().collect()
    }
}
