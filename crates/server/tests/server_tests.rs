// Path: crates/server/tests/server_tests.rs
//! End-to-end flows over in-process replicas sharing one Coordination
//! Store: bootstrap, timestamps across graceful failover, redirects,
//! heartbeat streams, and follower synchronization.

use std::sync::Arc;
use std::time::Duration;

use meridian_schedule::{OpKind, OpPriority, OpStep, Operator};
use meridian_server::rpc::{RegionHeartbeatRequest, RequestHeader};
use meridian_test_utils::{header, region_meta, store_meta, wait_for, TestPd};
use meridian_types::stats::StoreStats;
use meridian_types::{PdError, RegionEpoch, RegionMeta};
use tokio::sync::watch;

const CLUSTER_ID: u64 = 7;

fn hdr() -> RequestHeader {
    header(CLUSTER_ID)
}

fn first_region() -> RegionMeta {
    region_meta(2, (1, 1), &[(3, 1)])
}

async fn bootstrapped_pd(name: &str) -> TestPd {
    let pd = TestPd::start(name);
    pd.wait_leader().await;
    pd.service
        .bootstrap(hdr(), store_meta(1, &[]), first_region())
        .await
        .unwrap();
    pd
}

#[tokio::test]
async fn bootstrap_and_first_timestamp() {
    let pd = TestPd::start("pd-1");
    pd.wait_leader().await;

    assert!(!pd.service.is_bootstrapped().await.unwrap());
    pd.service
        .bootstrap(hdr(), store_meta(1, &[]), first_region())
        .await
        .unwrap();
    assert!(pd.service.is_bootstrapped().await.unwrap());

    let err = pd
        .service
        .bootstrap(hdr(), store_meta(1, &[]), first_region())
        .await
        .unwrap_err();
    assert_eq!(err, PdError::AlreadyBootstrapped);

    let ts = pd.service.get_ts(hdr(), 1).await.unwrap();
    assert!(ts.into_u64() > 0);

    // Timestamps keep strictly increasing within the term.
    let later = pd.service.get_ts(hdr(), 5).await.unwrap();
    assert!(later.into_u64() > ts.into_u64());
}

#[tokio::test]
async fn cluster_mismatch_is_rejected() {
    let pd = bootstrapped_pd("pd-1").await;
    let err = pd
        .service
        .get_ts(header(999), 1)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PdError::ClusterMismatch {
            expected: 7,
            got: 999
        }
    ));
}

#[tokio::test]
async fn allocated_ids_are_monotonic() {
    let pd = bootstrapped_pd("pd-1").await;
    let (first, count) = pd.service.alloc_id(hdr(), 10).await.unwrap();
    assert!(count >= 1);
    let (second, _) = pd.service.alloc_id(hdr(), 10).await.unwrap();
    assert!(second > first);
}

#[tokio::test]
async fn follower_redirects_to_the_leader() {
    let a = bootstrapped_pd("pd-1").await;
    let b = TestPd::start_on(Arc::clone(&a.kv), "pd-2");

    let err = b.service.get_ts(hdr(), 1).await.unwrap_err();
    match err {
        PdError::NotLeader { leader } => assert_eq!(leader.as_deref(), Some("mock://pd-1")),
        other => panic!("expected NotLeader, got {other:?}"),
    }
}

#[tokio::test]
async fn graceful_transfer_keeps_timestamps_monotonic() {
    let a = bootstrapped_pd("pd-1").await;
    let t1 = a.service.get_ts(hdr(), 1).await.unwrap();

    let b = TestPd::start_on(Arc::clone(&a.kv), "pd-2");

    // Hand leadership to pd-2; pd-1 abdicates, pd-2 campaigns.
    a.service.transfer_primary(hdr(), "pd-2").await.unwrap();
    b.wait_leader().await;
    {
        let a_server = Arc::clone(&a.server);
        wait_for("pd-1 step-down", move || !a_server.is_leader()).await;
    }

    let t2 = b.service.get_ts(hdr(), 1).await.unwrap();
    assert!(
        t2.into_u64() > t1.into_u64(),
        "first timestamp after failover must exceed every earlier one"
    );
}

#[tokio::test]
async fn heartbeat_stream_carries_operator_steps() {
    let pd = bootstrapped_pd("pd-1").await;
    pd.service.put_store(hdr(), store_meta(4, &[])).await.unwrap();
    for store_id in [1, 4] {
        pd.service
            .store_heartbeat(
                hdr(),
                StoreStats {
                    store_id,
                    capacity: 1 << 30,
                    available: 1 << 29,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    let (tx, mut responses) = pd.service.region_heartbeat_stream(hdr(), 1).await.unwrap();

    // A region with peers on both stores, led from store 1.
    let mut meta = region_meta(2, (2, 1), &[(3, 1), (5, 4)]);
    let mut request = RegionHeartbeatRequest {
        header: hdr(),
        leader: meta.peers.first().cloned(),
        region: std::mem::take(&mut meta),
        ..Default::default()
    };
    tx.send(request.clone()).await.unwrap();
    {
        let server = Arc::clone(&pd.server);
        wait_for("heartbeat applied", move || {
            server
                .cluster()
                .get_region_by_id(2)
                .map(|r| r.epoch() == RegionEpoch::new(2, 1))
                .unwrap_or(false)
        })
        .await;
    }

    // Plan a leader transfer; the step must be echoed down the stream.
    let region = pd.server.cluster().get_region_by_id(2).unwrap();
    let op = Operator::new(
        "grant-leader",
        2,
        region.epoch(),
        OpKind::LEADER,
        OpPriority::High,
        vec![OpStep::TransferLeader { to_store: 4 }],
    );
    assert!(pd.server.operators().add_operator(&region, op).unwrap());

    tx.send(request.clone()).await.unwrap();
    let response = tokio::time::timeout(Duration::from_secs(5), responses.recv())
        .await
        .expect("no heartbeat response")
        .expect("stream closed");
    assert_eq!(response.region_id, 2);
    assert!(matches!(response.step, OpStep::TransferLeader { to_store: 4 }));

    // The confirming heartbeat finishes the operator.
    request.leader = request.region.peers.get(1).cloned();
    tx.send(request).await.unwrap();
    {
        let server = Arc::clone(&pd.server);
        wait_for("operator finished", move || {
            server.operators().get(2).is_none()
        })
        .await;
    }
}

#[tokio::test]
async fn follower_mirrors_the_leader_through_sync() {
    let a = bootstrapped_pd("pd-1").await;
    let b = TestPd::start_on(Arc::clone(&a.kv), "pd-2");

    let stream = a.server.connect_sync("pd-2", 1);
    let (sync_stop_tx, sync_stop_rx) = watch::channel(false);
    let follower = Arc::clone(&b.server);
    let apply = tokio::spawn(async move { follower.run_sync_client(stream, sync_stop_rx).await });

    // The leader accepts a split into two regions.
    for (id, peer, start, end) in [
        (2u64, 3u64, b"".as_slice(), b"m".as_slice()),
        (9, 10, b"m".as_slice(), b"".as_slice()),
    ] {
        let mut meta = region_meta(id, (1, 2), &[(peer, 1)]);
        meta.start_key = start.to_vec();
        meta.end_key = end.to_vec();
        let request = RegionHeartbeatRequest {
            header: hdr(),
            leader: meta.peers.first().cloned(),
            region: meta,
            ..Default::default()
        };
        a.service.region_heartbeat(request).await.unwrap();
    }

    {
        let follower = Arc::clone(&b.server);
        wait_for("follower caught up", move || {
            follower.cluster().region_count() == 2
        })
        .await;
    }
    sync_stop_tx.send(true).unwrap();
    apply.await.unwrap();

    for region in a.server.cluster().all_regions() {
        let mirrored = b.server.cluster().get_region_by_id(region.id()).unwrap();
        assert_eq!(mirrored.meta, region.meta);
        assert_eq!(mirrored.leader, region.leader);
    }
}

#[tokio::test]
async fn split_grants_fresh_ids() {
    let pd = bootstrapped_pd("pd-1").await;
    let grant = pd.service.ask_split(hdr(), 2).await.unwrap();
    assert!(grant.new_region_id > 3);
    assert_eq!(grant.new_peer_ids.len(), 1);
    let batch = pd.service.ask_batch_split(hdr(), 2, 3).await.unwrap();
    assert_eq!(batch.len(), 3);
    let mut ids: Vec<u64> = batch.iter().map(|g| g.new_region_id).collect();
    ids.push(grant.new_region_id);
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 4, "granted ids must be unique");
}

#[tokio::test]
async fn gc_surface_round_trips() {
    let pd = bootstrapped_pd("pd-1").await;
    pd.service
        .update_service_gc_safe_point(hdr(), 0, "a", 60, 100)
        .await
        .unwrap();
    let min = pd
        .service
        .update_service_gc_safe_point(hdr(), 0, "b", 60, 80)
        .await
        .unwrap();
    assert_eq!(min, 80);
    assert!(pd.service.update_gc_safe_point(hdr(), 0, 90).await.is_err());
    assert_eq!(
        pd.service.update_gc_safe_point(hdr(), 0, 80).await.unwrap(),
        80
    );
    assert_eq!(pd.service.get_gc_safe_point(hdr(), 0).await.unwrap(), 80);
}

#[tokio::test]
async fn external_timestamp_is_bounded_by_the_tso() {
    let pd = bootstrapped_pd("pd-1").await;
    let now = pd.service.get_ts(hdr(), 1).await.unwrap().into_u64();
    pd.service
        .set_external_timestamp(hdr(), now.saturating_sub(1))
        .await
        .unwrap();
    assert_eq!(
        pd.service.get_external_timestamp(hdr()).await.unwrap(),
        now - 1
    );
    // A value from the future is refused.
    let err = pd
        .service
        .set_external_timestamp(hdr(), u64::MAX)
        .await
        .unwrap_err();
    assert!(matches!(err, PdError::InvalidInput(_)));
}

#[tokio::test]
async fn scheduler_admin_surface() {
    let pd = bootstrapped_pd("pd-1").await;
    let controller = pd.server.scheduler_controller().unwrap();
    let defaults = controller.scheduler_names();
    assert!(defaults.contains(&"balance-leader-scheduler".to_string()));

    pd.service
        .add_scheduler(hdr(), "grant-leader", vec!["1".to_string()])
        .await
        .unwrap();
    assert!(controller
        .scheduler_names()
        .contains(&"grant-leader-scheduler".to_string()));

    pd.service
        .pause_scheduler(hdr(), "grant-leader-scheduler", 60)
        .await
        .unwrap();
    pd.service
        .remove_scheduler(hdr(), "grant-leader-scheduler")
        .await
        .unwrap();
    assert!(!controller
        .scheduler_names()
        .contains(&"grant-leader-scheduler".to_string()));

    pd.service.pause_checker(hdr(), "rule-checker", 60).await.unwrap();
}
