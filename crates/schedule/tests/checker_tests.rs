// Path: crates/schedule/tests/checker_tests.rs
//! Checker behavior against realistic little clusters.

mod common;

use std::sync::Arc;

use common::{cluster_with_stores, install, region_on};
use meridian_schedule::checker::{Checker, MergeChecker, RuleChecker};
use meridian_schedule::{OpStep, RuleManager, SequentialIds};
use meridian_store::{CoordKv, MemStore};
use meridian_types::config::ReplicationConfig;
use meridian_types::stats::PeerStats;
use meridian_types::{Peer, PeerRole};

async fn rule_checker(replication: &ReplicationConfig) -> (Arc<RuleManager>, RuleChecker) {
    let rules = Arc::new(RuleManager::new(Arc::new(MemStore::new()) as Arc<dyn CoordKv>));
    rules.load(replication).await.unwrap();
    let checker = RuleChecker::new(Arc::clone(&rules), Arc::new(SequentialIds::starting_at(1000)));
    (rules, checker)
}

#[tokio::test]
async fn missing_rule_peer_adds_a_learner_on_the_free_host() {
    // Three hosts, two voters on h1 and h2, default rule wants three.
    let cluster = cluster_with_stores(&[
        (1, &[("host", "h1")]),
        (2, &[("host", "h2")]),
        (3, &[("host", "h3")]),
    ])
    .await;
    let mut replication = ReplicationConfig::default();
    replication.location_labels = vec!["host".to_string()];
    *cluster.replication.write() = replication.clone();

    let region = region_on(1, 10, &[1, 2]);
    install(&cluster, region.clone());

    let (_rules, checker) = rule_checker(&replication).await;
    let ops = checker.check(&cluster, &region);
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].desc, "add-rule-peer");
    assert!(matches!(
        ops[0].steps.first(),
        Some(OpStep::AddLearner { store_id: 3, .. })
    ));
    assert!(matches!(
        ops[0].steps.get(1),
        Some(OpStep::PromoteLearner { store_id: 3, .. })
    ));
}

#[tokio::test]
async fn equal_scores_tie_break_to_the_lowest_store_id() {
    // Hosts h3 and h4 are both empty and equally distant; the lower ID
    // must win.
    let cluster = cluster_with_stores(&[
        (1, &[("host", "h1")]),
        (2, &[("host", "h2")]),
        (4, &[("host", "h4")]),
        (3, &[("host", "h3")]),
    ])
    .await;
    let mut replication = ReplicationConfig::default();
    replication.location_labels = vec!["host".to_string()];
    *cluster.replication.write() = replication.clone();

    let region = region_on(1, 10, &[1, 2]);
    install(&cluster, region.clone());

    let (_rules, checker) = rule_checker(&replication).await;
    let ops = checker.check(&cluster, &region);
    assert!(matches!(
        ops[0].steps.first(),
        Some(OpStep::AddLearner { store_id: 3, .. })
    ));
}

#[tokio::test]
async fn satisfied_cluster_reaches_a_fixpoint() {
    let cluster = cluster_with_stores(&[
        (1, &[("host", "h1")]),
        (2, &[("host", "h2")]),
        (3, &[("host", "h3")]),
    ])
    .await;
    let mut replication = ReplicationConfig::default();
    replication.location_labels = vec!["host".to_string()];
    *cluster.replication.write() = replication.clone();

    let region = region_on(1, 10, &[1, 2, 3]);
    install(&cluster, region.clone());

    let (_rules, checker) = rule_checker(&replication).await;
    // Repeated checks on a stable, satisfied region propose nothing.
    for _ in 0..3 {
        assert!(checker.check(&cluster, &region).is_empty());
    }
}

#[tokio::test]
async fn orphan_peer_is_removed() {
    let cluster = cluster_with_stores(&[
        (1, &[("host", "h1")]),
        (2, &[("host", "h2")]),
        (3, &[("host", "h3")]),
        (4, &[("host", "h4")]),
    ])
    .await;
    let replication = ReplicationConfig::default();
    let region = region_on(1, 10, &[1, 2, 3, 4]);
    install(&cluster, region.clone());

    let (_rules, checker) = rule_checker(&replication).await;
    let ops = checker.check(&cluster, &region);
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].desc, "remove-orphan-peer");
    assert!(matches!(
        ops[0].steps.first(),
        Some(OpStep::RemovePeer { store_id: 4, .. })
    ));
}

#[tokio::test]
async fn down_peer_with_fitting_orphan_swaps_atomically() {
    let cluster = cluster_with_stores(&[
        (1, &[("host", "h1")]),
        (2, &[("host", "h2")]),
        (3, &[("host", "h3")]),
        (4, &[("host", "h4")]),
    ])
    .await;
    let replication = ReplicationConfig::default();

    // Peer on store 3 is long down; a learner orphan waits on store 4.
    let mut region = region_on(1, 10, &[1, 2, 3]);
    region.meta.peers.push(Peer::learner(13, 4));
    region.down_peers = vec![PeerStats {
        peer: region.meta.peers[2].clone(),
        down_seconds: 4000,
    }];
    install(&cluster, region.clone());

    let (_rules, checker) = rule_checker(&replication).await;
    let ops = checker.check(&cluster, &region);
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].desc, "fast-replace-rule-down-peer");
    assert!(matches!(
        ops[0].steps.first(),
        Some(OpStep::ChangePeerV2Enter { .. })
    ));
    assert!(matches!(
        ops[0].steps.last(),
        Some(OpStep::RemovePeer { store_id: 3, .. })
    ));
}

#[tokio::test]
async fn stuck_demoting_voter_is_cleared() {
    let cluster = cluster_with_stores(&[
        (1, &[("host", "h1")]),
        (2, &[("host", "h2")]),
        (3, &[("host", "h3")]),
    ])
    .await;
    let replication = ReplicationConfig::default();
    let mut region = region_on(1, 10, &[1, 2, 3]);
    region.meta.peers[2].role = PeerRole::DemotingVoter;
    install(&cluster, region.clone());

    let (_rules, checker) = rule_checker(&replication).await;
    let ops = checker.check(&cluster, &region);
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].desc, "fix-demote-voter");
    assert!(matches!(
        ops[0].steps.first(),
        Some(OpStep::ChangePeerV2Leave { .. })
    ));
}

#[tokio::test]
async fn small_adjacent_regions_merge_as_a_pair() {
    let cluster = cluster_with_stores(&[(1, &[]), (2, &[]), (3, &[])]).await;
    let mut left = common::region_in(1, 10, &[1, 2, 3], b"", b"m");
    left.stats.approximate_size = 1;
    left.stats.approximate_keys = 10;
    let mut right = common::region_in(2, 20, &[1, 2, 3], b"m", b"");
    right.stats.approximate_size = 1;
    right.stats.approximate_keys = 10;
    install(&cluster, left.clone());
    install(&cluster, right.clone());

    let ops = MergeChecker.check(&cluster, &left);
    assert_eq!(ops.len(), 2);
    assert_eq!(ops[0].region_id, 1);
    assert_eq!(ops[1].region_id, 2);
    let Some(OpStep::MergeRegion { target, is_passive }) = ops[0].steps.first() else {
        panic!("expected a merge step");
    };
    assert!(!is_passive);
    assert!(target.start_key.is_empty() && target.end_key.is_empty());
}

#[tokio::test]
async fn big_regions_do_not_merge() {
    let cluster = cluster_with_stores(&[(1, &[]), (2, &[]), (3, &[])]).await;
    let mut left = common::region_in(1, 10, &[1, 2, 3], b"", b"m");
    left.stats.approximate_size = 10_000;
    let right = common::region_in(2, 20, &[1, 2, 3], b"m", b"");
    install(&cluster, left.clone());
    install(&cluster, right);
    assert!(MergeChecker.check(&cluster, &left).is_empty());
}
