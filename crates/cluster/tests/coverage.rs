// Path: crates/cluster/tests/coverage.rs
//! Key-space coverage under random split/merge heartbeat sequences: after
//! any accepted sequence, the sorted regions tile the key space with no
//! gap and no overlap, and rejected heartbeats change nothing.

use std::sync::Arc;

use meridian_cluster::{Cluster, ClusterOptions, RegionInfo};
use meridian_store::{CoordKv, MemStore};
use meridian_types::{Peer, PdError, RegionEpoch, RegionMeta, StoreMeta, StoreState};
use proptest::prelude::*;

fn new_cluster(rt: &tokio::runtime::Runtime) -> Cluster {
    let cluster = Cluster::new(
        Arc::new(MemStore::new()) as Arc<dyn CoordKv>,
        ClusterOptions::default(),
    );
    rt.block_on(cluster.bootstrap(
        1,
        StoreMeta {
            id: 1,
            address: "mock://s:1".into(),
            state: StoreState::Up,
            ..Default::default()
        },
        RegionMeta {
            id: 1,
            epoch: RegionEpoch::new(1, 1),
            peers: vec![Peer::voter(100, 1)],
            ..Default::default()
        },
    ))
    .unwrap();
    cluster
}

fn assert_full_coverage(cluster: &Cluster) {
    let regions = cluster.all_regions();
    assert!(!regions.is_empty());
    let first = regions.first().unwrap();
    assert!(first.start_key().is_empty(), "key space must start at -inf");
    for pair in regions.windows(2) {
        assert_eq!(
            pair[0].end_key(),
            pair[1].start_key(),
            "adjacent regions must abut exactly"
        );
    }
    let last = regions.last().unwrap();
    assert!(last.end_key().is_empty(), "key space must end at +inf");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn splits_never_break_coverage(points in proptest::collection::btree_set(1u8..250, 0..12)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let cluster = new_cluster(&rt);

        let mut next_id = 2u64;
        let mut next_peer = 200u64;
        for point in points {
            let boundary = vec![point];
            // Split the region containing the boundary into two halves,
            // both one version ahead, the way a storage node reports it.
            let victim = cluster.get_region_by_key(&boundary).unwrap();
            if victim.start_key() == boundary.as_slice() {
                continue;
            }
            let new_version = victim.epoch().version + 1;
            let mut left = RegionInfo::new(RegionMeta {
                id: victim.id(),
                start_key: victim.start_key().to_vec(),
                end_key: boundary.clone(),
                epoch: RegionEpoch::new(victim.epoch().conf_ver, new_version),
                peers: victim.meta.peers.clone(),
            });
            left.leader = victim.meta.peers.first().cloned();
            let mut right = RegionInfo::new(RegionMeta {
                id: next_id,
                start_key: boundary.clone(),
                end_key: victim.end_key().to_vec(),
                epoch: RegionEpoch::new(victim.epoch().conf_ver, new_version),
                peers: vec![Peer::voter(next_peer, 1)],
            });
            right.leader = right.meta.peers.first().cloned();
            next_id += 1;
            next_peer += 1;
            rt.block_on(cluster.handle_region_heartbeat(right)).unwrap();
            rt.block_on(cluster.handle_region_heartbeat(left)).unwrap();
            assert_full_coverage(&cluster);
        }
        assert_full_coverage(&cluster);
    }

    #[test]
    fn stale_heartbeats_change_nothing(conf in 2u64..20, version in 2u64..20) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let cluster = new_cluster(&rt);

        let mut current = RegionInfo::new(RegionMeta {
            id: 1,
            epoch: RegionEpoch::new(conf, version),
            peers: vec![Peer::voter(100, 1)],
            ..Default::default()
        });
        current.leader = Some(Peer::voter(100, 1));
        rt.block_on(cluster.handle_region_heartbeat(current)).unwrap();
        let before = cluster.get_region_by_id(1).unwrap();

        for (c, v) in [(conf - 1, version), (conf, version - 1), (conf - 1, version - 1)] {
            if c == 1 && v == 1 {
                continue; // recovery epoch, accepted by design
            }
            let stale = RegionInfo::new(RegionMeta {
                id: 1,
                epoch: RegionEpoch::new(c, v),
                peers: vec![Peer::voter(100, 1)],
                ..Default::default()
            });
            let err = rt.block_on(cluster.handle_region_heartbeat(stale)).unwrap_err();
            let is_stale = matches!(err, PdError::Stale { .. });
            prop_assert!(is_stale);
            let after = cluster.get_region_by_id(1).unwrap();
            prop_assert_eq!(&before.meta, &after.meta);
        }
    }
}
