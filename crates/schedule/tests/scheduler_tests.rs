// Path: crates/schedule/tests/scheduler_tests.rs
//! Scheduler behavior: forced leader placement, balance idempotence, and
//! slow-store eviction.

mod common;

use common::{cluster_with_stores, install, region_in};
use meridian_schedule::schedulers::{
    BalanceLeaderScheduler, EvictLeaderScheduler, EvictSlowStoreScheduler, GrantLeaderScheduler,
    Scheduler,
};
use meridian_schedule::{ClusterInformer, OpPriority, OpStep};
use meridian_types::stats::StoreStats;

#[tokio::test]
async fn grant_leader_pulls_leadership_onto_the_store() {
    let cluster = cluster_with_stores(&[(1, &[]), (2, &[]), (3, &[])]).await;
    // Leader on store 1, follower on store 3.
    install(&cluster, region_in(1, 10, &[1, 2, 3], b"", b""));

    let scheduler = GrantLeaderScheduler::new();
    scheduler.add_store(3, Vec::new());

    // Within two ticks a High-priority transfer to store 3 must appear.
    let mut produced = Vec::new();
    for _ in 0..2 {
        produced = scheduler.schedule(&cluster);
        if !produced.is_empty() {
            break;
        }
    }
    assert!(!produced.is_empty());
    let op = &produced[0];
    assert_eq!(op.desc, "grant-leader");
    assert_eq!(op.priority, OpPriority::High);
    assert!(matches!(
        op.steps.as_slice(),
        [OpStep::TransferLeader { to_store: 3 }]
    ));
}

#[tokio::test]
async fn grant_leader_is_quiet_once_leadership_arrived() {
    let cluster = cluster_with_stores(&[(1, &[]), (2, &[]), (3, &[])]).await;
    // Leader already on store 3.
    install(&cluster, region_in(1, 10, &[3, 1, 2], b"", b""));
    let scheduler = GrantLeaderScheduler::new();
    scheduler.add_store(3, Vec::new());
    assert!(scheduler.schedule(&cluster).is_empty());
}

#[tokio::test]
async fn evict_leader_pushes_leadership_away_and_pauses_inbound() {
    let cluster = cluster_with_stores(&[(1, &[]), (2, &[]), (3, &[])]).await;
    install(&cluster, region_in(1, 10, &[1, 2, 3], b"", b""));
    let scheduler = EvictLeaderScheduler::new();
    scheduler.add_store(1, Vec::new());

    let ops = scheduler.schedule(&cluster);
    assert!(!ops.is_empty());
    assert!(matches!(
        ops[0].steps.as_slice(),
        [OpStep::TransferLeader { to_store }] if *to_store != 1
    ));
    // Stickiness: the store must refuse inbound transfers afterwards.
    assert!(cluster.get_store(1).unwrap().pause_leader_transfer_in);
}

#[tokio::test]
async fn balanced_leaders_produce_no_operators_until_state_changes() {
    let cluster = cluster_with_stores(&[(1, &[]), (2, &[]), (3, &[])]).await;
    // One leader per store: perfectly balanced.
    install(&cluster, region_in(1, 10, &[1, 2, 3], b"", b"h"));
    install(&cluster, region_in(2, 20, &[2, 3, 1], b"h", b"p"));
    install(&cluster, region_in(3, 30, &[3, 1, 2], b"p", b""));

    let scheduler = BalanceLeaderScheduler::new();
    for _ in 0..5 {
        assert!(
            scheduler.schedule(&cluster).is_empty(),
            "stable state must stay quiet"
        );
    }
}

#[tokio::test]
async fn skewed_leaders_produce_a_transfer() {
    let cluster = cluster_with_stores(&[(1, &[]), (2, &[]), (3, &[])]).await;
    // Every leader piled on store 1.
    install(&cluster, region_in(1, 10, &[1, 2, 3], b"", b"e"));
    install(&cluster, region_in(2, 20, &[1, 2, 3], b"e", b"j"));
    install(&cluster, region_in(3, 30, &[1, 3, 2], b"j", b"p"));
    install(&cluster, region_in(4, 40, &[1, 3, 2], b"p", b""));

    let scheduler = BalanceLeaderScheduler::new();
    let mut ops = Vec::new();
    for _ in 0..8 {
        ops = scheduler.schedule(&cluster);
        if !ops.is_empty() {
            break;
        }
    }
    assert!(!ops.is_empty(), "skew must eventually produce a move");
    assert!(matches!(
        ops[0].steps.as_slice(),
        [OpStep::TransferLeader { to_store }] if *to_store != 1
    ));
}

#[tokio::test]
async fn slow_store_is_captured_and_released() {
    let cluster = cluster_with_stores(&[(1, &[]), (2, &[]), (3, &[])]).await;
    install(&cluster, region_in(1, 10, &[1, 2, 3], b"", b""));
    let scheduler = EvictSlowStoreScheduler::new();

    // Healthy cluster: nothing to do.
    assert!(scheduler.schedule(&cluster).is_empty());

    // Store 1 reports itself stuck.
    cluster
        .core
        .handle_store_heartbeat(StoreStats {
            store_id: 1,
            capacity: 1 << 40,
            available: 1 << 39,
            slow_score: 100,
            ..Default::default()
        })
        .unwrap();
    let ops = scheduler.schedule(&cluster);
    assert!(!ops.is_empty());
    assert_eq!(ops[0].desc, "evict-slow-store");
    assert_eq!(ops[0].priority, OpPriority::Urgent);
    assert!(cluster.get_store(1).unwrap().pause_leader_transfer_in);

    // Recovery clears the capture and the pause flag.
    cluster
        .core
        .handle_store_heartbeat(StoreStats {
            store_id: 1,
            capacity: 1 << 40,
            available: 1 << 39,
            slow_score: 1,
            ..Default::default()
        })
        .unwrap();
    assert!(scheduler.schedule(&cluster).is_empty());
    assert!(!cluster.get_store(1).unwrap().pause_leader_transfer_in);
}
