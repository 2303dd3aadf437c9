// Path: crates/schedule/src/checker/merge.rs
//! Merges small, quiet regions into an adjacent neighbor.

use meridian_cluster::RegionInfo;
use meridian_types::{RegionEpoch, RegionMeta};
use std::collections::HashSet;
use std::sync::Arc;

use crate::checker::Checker;
use crate::informer::ClusterInformer;
use crate::operator::{OpKind, OpPriority, OpStep, Operator};

pub struct MergeChecker;

impl MergeChecker {
    /// Whether a region is small and quiet enough to give up its identity.
    fn is_merge_candidate(region: &RegionInfo, max_size_mb: u64, max_keys: u64) -> bool {
        region.is_healthy()
            && region.leader.is_some()
            && region.stats.approximate_size <= max_size_mb
            && region.stats.approximate_keys <= max_keys
    }

    /// Placement compatibility: both regions live on exactly the same
    /// stores, so the merged region fits wherever both fit.
    fn stores_match(a: &RegionInfo, b: &RegionInfo) -> bool {
        let left: HashSet<u64> = a.meta.peers.iter().map(|p| p.store_id).collect();
        let right: HashSet<u64> = b.meta.peers.iter().map(|p| p.store_id).collect();
        left == right
    }

    /// The meta both sides converge to when the merge commits.
    fn merged_meta(source: &RegionInfo, target: &RegionInfo) -> RegionMeta {
        let (start_key, end_key) = if source.start_key() < target.start_key() {
            (source.meta.start_key.clone(), target.meta.end_key.clone())
        } else {
            (target.meta.start_key.clone(), source.meta.end_key.clone())
        };
        RegionMeta {
            id: target.id(),
            start_key,
            end_key,
            epoch: RegionEpoch::new(
                target.epoch().conf_ver,
                source.epoch().version.max(target.epoch().version) + 1,
            ),
            peers: target.meta.peers.clone(),
        }
    }
}

impl Checker for MergeChecker {
    fn name(&self) -> &'static str {
        "merge-checker"
    }

    fn check(&self, cluster: &dyn ClusterInformer, region: &RegionInfo) -> Vec<Operator> {
        let cfg = cluster.schedule_config();
        if !Self::is_merge_candidate(region, cfg.max_merge_region_size_mb, cfg.max_merge_region_keys)
        {
            return Vec::new();
        }
        // Try both neighbors; prefer the smaller one so merges drain the
        // quiet end of the key space evenly.
        let mut neighbors: Vec<Arc<RegionInfo>> = [
            cluster.adjacent_before(region),
            cluster.adjacent_after(region),
        ]
        .into_iter()
        .flatten()
        .filter(|n| n.is_healthy() && n.leader.is_some())
        .filter(|n| Self::stores_match(region, n))
        .collect();
        neighbors.sort_by_key(|n| n.stats.approximate_size);
        let Some(target) = neighbors.into_iter().next() else {
            return Vec::new();
        };
        let merged = Self::merged_meta(region, &target);
        let source_op = Operator::new(
            "merge-region",
            region.id(),
            region.epoch(),
            OpKind::MERGE,
            OpPriority::Medium,
            vec![OpStep::MergeRegion {
                target: merged.clone(),
                is_passive: false,
            }],
        );
        let target_op = Operator::new(
            "merge-region",
            target.id(),
            target.epoch(),
            OpKind::MERGE,
            OpPriority::Medium,
            vec![OpStep::MergeRegion {
                target: merged,
                is_passive: true,
            }],
        );
        vec![source_op, target_op]
    }
}
