// Path: crates/schedule/tests/scatter_tests.rs
//! Scatter uniformity: K uniform regions over S homogeneous stores with
//! replication factor R end up with per-store peer counts within the
//! tight bound ⌈K·R/S⌉ − ⌊K·R/S⌋ + 1.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::{cluster_with_stores, install, region_in};
use meridian_schedule::{OpStep, RegionScatterer, RuleManager, SequentialIds};
use meridian_store::{CoordKv, MemStore};
use meridian_types::config::ReplicationConfig;
use meridian_types::StoreId;

#[tokio::test]
async fn scatter_spreads_peers_evenly() {
    const STORES: u64 = 5;
    const REGIONS: u64 = 20;
    const REPLICAS: u64 = 3;

    let store_list: Vec<(StoreId, &[(&str, &str)])> =
        (1..=STORES).map(|id| (id, &[] as &[(&str, &str)])).collect();
    let cluster = cluster_with_stores(&store_list).await;

    // All regions start piled on stores 1..=3.
    let mut installed = Vec::new();
    for i in 0..REGIONS {
        let start = vec![b'a' + i as u8];
        let end = if i == REGIONS - 1 {
            Vec::new()
        } else {
            vec![b'a' + i as u8 + 1]
        };
        let region = region_in(i + 1, (i + 1) * 100, &[1, 2, 3], &start, &end);
        install(&cluster, region.clone());
        installed.push(region);
    }

    let rules = Arc::new(RuleManager::new(Arc::new(MemStore::new()) as Arc<dyn CoordKv>));
    rules.load(&ReplicationConfig::default()).await.unwrap();
    let scatterer = RegionScatterer::new(rules, Arc::new(SequentialIds::starting_at(10_000)));

    // Simulate execution: apply each plan's final placement.
    let mut per_store: HashMap<StoreId, u64> = (1..=STORES).map(|s| (s, 0)).collect();
    for region in &installed {
        let plan = scatterer.scatter_region(&cluster, region, "group-a");
        let mut stores: Vec<StoreId> = region.meta.peers.iter().map(|p| p.store_id).collect();
        if let Some(op) = plan {
            let mut added = Vec::new();
            for step in &op.steps {
                match step {
                    OpStep::AddLearner { store_id, .. } => added.push(*store_id),
                    OpStep::RemovePeer { store_id, .. } => {
                        if let Some(pos) = stores.iter().position(|s| s == store_id) {
                            stores.remove(pos);
                        }
                    }
                    _ => {}
                }
            }
            stores.extend(added);
        }
        assert_eq!(stores.len(), REPLICAS as usize);
        for s in stores {
            *per_store.get_mut(&s).unwrap() += 1;
        }
    }

    let max = per_store.values().max().copied().unwrap();
    let min = per_store.values().min().copied().unwrap();
    let total = REGIONS * REPLICAS;
    let bound = total.div_ceil(STORES) - total / STORES + 1;
    assert!(
        max - min <= bound,
        "per-store counts {per_store:?} spread {max}-{min} exceeds bound {bound}"
    );
}

#[tokio::test]
async fn already_even_region_is_left_in_place() {
    let cluster = cluster_with_stores(&[(1, &[]), (2, &[]), (3, &[])]).await;
    let region = region_in(1, 10, &[1, 2, 3], b"", b"");
    install(&cluster, region.clone());
    let rules = Arc::new(RuleManager::new(Arc::new(MemStore::new()) as Arc<dyn CoordKv>));
    rules.load(&ReplicationConfig::default()).await.unwrap();
    let scatterer = RegionScatterer::new(rules, Arc::new(SequentialIds::starting_at(10_000)));
    // Every store holds exactly one peer; there is nowhere better.
    assert!(scatterer.scatter_region(&cluster, &region, "g").is_none());
}

#[tokio::test]
async fn special_engine_peers_stay_within_their_engine() {
    let cluster = cluster_with_stores(&[
        (1, &[]),
        (2, &[]),
        (3, &[]),
        (4, &[("engine", "columnar")]),
        (5, &[("engine", "columnar")]),
    ])
    .await;
    let mut first = region_in(1, 10, &[1, 2, 3], b"", b"m");
    first.meta.peers.push(meridian_types::Peer::learner(14, 4));
    let mut second = region_in(2, 20, &[1, 2, 3], b"m", b"");
    second.meta.peers.push(meridian_types::Peer::learner(24, 4));
    install(&cluster, first.clone());
    install(&cluster, second.clone());

    let rules = Arc::new(RuleManager::new(Arc::new(MemStore::new()) as Arc<dyn CoordKv>));
    rules.load(&ReplicationConfig::default()).await.unwrap();
    let scatterer = RegionScatterer::new(rules, Arc::new(SequentialIds::starting_at(10_000)));

    // The first scatter charges store 4's columnar count; the second
    // region's columnar learner must therefore land on store 5, and only
    // there.
    let _ = scatterer.scatter_region(&cluster, &first, "g");
    let op = scatterer
        .scatter_region(&cluster, &second, "g")
        .expect("the columnar learner should move");
    let added: Vec<_> = op
        .steps
        .iter()
        .filter_map(|s| match s {
            OpStep::AddLearner { store_id, .. } => Some(*store_id),
            _ => None,
        })
        .collect();
    assert_eq!(added, vec![5], "only the columnar learner moves, to the free columnar store");
    assert!(op
        .steps
        .iter()
        .any(|s| matches!(s, OpStep::RemovePeer { store_id: 4, .. })));
}
