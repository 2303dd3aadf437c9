// Path: crates/schedule/src/placement/fit.rs
//! Fitting a region's peers against its effective rule set.
//!
//! Each peer is assigned to at most one rule, in rule order; peers nothing
//! claims are orphans. Assignment prefers peers that already conform to
//! the rule (right role, right witness flag) so repairs stay minimal, and
//! breaks remaining ties by lowest store ID to keep results deterministic.

use std::collections::HashSet;
use std::sync::Arc;

use meridian_cluster::{RegionInfo, StoreInfo};
use meridian_types::{Peer, StoreId};

use crate::placement::rule::Rule;

/// One rule's share of the fit.
#[derive(Debug, Clone)]
pub struct RuleFit {
    pub rule: Rule,
    /// Peers assigned to the rule.
    pub peers: Vec<Peer>,
}

impl RuleFit {
    /// Peers still needed to reach the rule's count.
    pub fn missing(&self) -> usize {
        self.rule.count.saturating_sub(self.peers.len())
    }

    /// Assigned peers whose role or witness flag is wrong for the rule.
    pub fn nonconforming(&self) -> Vec<&Peer> {
        self.peers
            .iter()
            .filter(|p| !self.rule.peer_conforms(p))
            .collect()
    }

    pub fn is_satisfied(&self) -> bool {
        self.peers.len() == self.rule.count && self.nonconforming().is_empty()
    }
}

/// The whole region's fit.
#[derive(Debug, Clone)]
pub struct RegionFit {
    pub fits: Vec<RuleFit>,
    /// Peers no rule claimed; the checker removes them.
    pub orphan_peers: Vec<Peer>,
}

impl RegionFit {
    /// True when every rule is satisfied and nothing is left over.
    pub fn is_satisfied(&self) -> bool {
        self.orphan_peers.is_empty() && self.fits.iter().all(|f| f.is_satisfied())
    }
}

/// Assigns `region`'s peers to `rules` (already filtered and ordered for
/// this region). `store_of` resolves peer stores for label matching.
pub fn fit_region(
    region: &RegionInfo,
    rules: &[Rule],
    store_of: impl Fn(StoreId) -> Option<Arc<StoreInfo>>,
) -> RegionFit {
    let mut assigned: HashSet<u64> = HashSet::new();
    let mut fits = Vec::with_capacity(rules.len());
    for rule in rules {
        let mut candidates: Vec<&Peer> = region
            .meta
            .peers
            .iter()
            .filter(|p| !assigned.contains(&p.id))
            .filter(|p| {
                store_of(p.store_id).map_or(false, |s| rule.matches_store(&s))
            })
            .collect();
        // Conforming peers first, then stable order by store ID.
        candidates.sort_by_key(|p| (!rule.peer_conforms(p), p.store_id));
        let picked: Vec<Peer> = candidates
            .into_iter()
            .take(rule.count)
            .cloned()
            .collect();
        for p in &picked {
            assigned.insert(p.id);
        }
        fits.push(RuleFit {
            rule: rule.clone(),
            peers: picked,
        });
    }
    let orphan_peers = region
        .meta
        .peers
        .iter()
        .filter(|p| !assigned.contains(&p.id))
        .cloned()
        .collect();
    RegionFit { fits, orphan_peers }
}

/// Penalty for putting a new peer of `rule` on `candidate`, given the
/// stores already holding the rule's peers. Sharing a location-label value
/// with an existing peer costs more the coarser the label, so minimizing
/// the penalty maximizes isolation diversity.
pub fn isolation_penalty(
    rule: &Rule,
    existing: &[Arc<StoreInfo>],
    candidate: &StoreInfo,
) -> u64 {
    let mut penalty = 0u64;
    let levels = rule.location_labels.len() as u32;
    for (i, label) in rule.location_labels.iter().enumerate() {
        let Some(candidate_value) = candidate.meta.label(label) else {
            continue;
        };
        let weight = 1u64 << (levels - i as u32);
        let shared = existing
            .iter()
            .filter(|s| s.meta.label(label) == Some(candidate_value))
            .count() as u64;
        penalty += weight * shared;
    }
    penalty
}

/// Whether `candidate` violates the rule's hard isolation requirement:
/// some existing peer store shares its value for the isolation label.
pub fn violates_isolation_level(
    rule: &Rule,
    existing: &[Arc<StoreInfo>],
    candidate: &StoreInfo,
) -> bool {
    if rule.isolation_level.is_empty() {
        return false;
    }
    let Some(candidate_value) = candidate.meta.label(&rule.isolation_level) else {
        // A store missing the isolation label cannot prove isolation.
        return true;
    };
    existing
        .iter()
        .any(|s| s.meta.label(&rule.isolation_level) == Some(candidate_value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::placement::rule::RuleRole;
    use meridian_types::{PeerRole, RegionEpoch, RegionMeta, StoreLabel, StoreMeta};

    fn store(id: StoreId, host: &str) -> Arc<StoreInfo> {
        Arc::new(StoreInfo::new(StoreMeta {
            id,
            labels: vec![StoreLabel {
                key: "host".into(),
                value: host.into(),
            }],
            ..Default::default()
        }))
    }

    fn region(peers: Vec<Peer>) -> RegionInfo {
        RegionInfo::new(RegionMeta {
            id: 1,
            epoch: RegionEpoch::new(1, 1),
            peers,
            ..Default::default()
        })
    }

    fn voter_rule(count: usize) -> Rule {
        Rule {
            group_id: "pd".into(),
            id: "default".into(),
            role: RuleRole::Voter,
            count,
            location_labels: vec!["host".into()],
            ..Default::default()
        }
    }

    fn lookup(stores: Vec<Arc<StoreInfo>>) -> impl Fn(StoreId) -> Option<Arc<StoreInfo>> {
        move |id| stores.iter().find(|s| s.id() == id).cloned()
    }

    #[test]
    fn satisfied_fit_has_no_work() {
        let stores = vec![store(1, "h1"), store(2, "h2"), store(3, "h3")];
        let r = region(vec![Peer::voter(10, 1), Peer::voter(11, 2), Peer::voter(12, 3)]);
        let fit = fit_region(&r, &[voter_rule(3)], lookup(stores));
        assert!(fit.is_satisfied());
        assert!(fit.orphan_peers.is_empty());
    }

    #[test]
    fn missing_peer_is_reported() {
        let stores = vec![store(1, "h1"), store(2, "h2"), store(3, "h3")];
        let r = region(vec![Peer::voter(10, 1), Peer::voter(11, 2)]);
        let fit = fit_region(&r, &[voter_rule(3)], lookup(stores));
        assert!(!fit.is_satisfied());
        assert_eq!(fit.fits[0].missing(), 1);
    }

    #[test]
    fn unclaimed_peer_is_an_orphan() {
        let stores = vec![store(1, "h1"), store(2, "h2"), store(3, "h3"), store(4, "h4")];
        let r = region(vec![
            Peer::voter(10, 1),
            Peer::voter(11, 2),
            Peer::voter(12, 3),
            Peer::voter(13, 4),
        ]);
        let fit = fit_region(&r, &[voter_rule(3)], lookup(stores));
        assert_eq!(fit.orphan_peers.len(), 1);
        // Assignment is by store-ID order, so the highest store loses.
        assert_eq!(fit.orphan_peers[0].store_id, 4);
    }

    #[test]
    fn learner_peer_does_not_conform_to_a_voter_rule() {
        let stores = vec![store(1, "h1"), store(2, "h2"), store(3, "h3")];
        let mut peers = vec![Peer::voter(10, 1), Peer::voter(11, 2), Peer::voter(12, 3)];
        peers[2].role = PeerRole::Learner;
        let fit = fit_region(&region(peers), &[voter_rule(3)], lookup(stores));
        assert!(!fit.is_satisfied());
        assert_eq!(fit.fits[0].nonconforming().len(), 1);
    }

    #[test]
    fn isolation_penalty_prefers_fresh_hosts() {
        let rule = voter_rule(3);
        let existing = vec![store(1, "h1"), store(2, "h2")];
        let fresh = store(3, "h3");
        let colocated = store(4, "h1");
        assert!(
            isolation_penalty(&rule, &existing, &fresh)
                < isolation_penalty(&rule, &existing, &colocated)
        );
    }

    #[test]
    fn isolation_level_is_a_hard_bound() {
        let mut rule = voter_rule(3);
        rule.isolation_level = "host".into();
        let existing = vec![store(1, "h1")];
        assert!(violates_isolation_level(&rule, &existing, &store(4, "h1")));
        assert!(!violates_isolation_level(&rule, &existing, &store(5, "h2")));
    }
}
