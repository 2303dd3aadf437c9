// Path: crates/schedule/src/operator/controller.rs
//! The operator controller: admission, lifecycle, and execution driving.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use ahash::AHashMap;
use meridian_cluster::RegionInfo;
use meridian_types::{RegionId, Result};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::informer::ClusterInformer;
use crate::operator::limit::StoreLimiters;
use crate::operator::op::{OpCheck, OpKind, OpStatus, Operator};
use crate::operator::step::OpStep;

/// How operator steps reach the storage nodes: the server implements this
/// over the region-heartbeat response streams.
pub trait StepResponder: Send + Sync {
    fn send(&self, region: &RegionInfo, operator: &Operator, step: &OpStep);
}

/// Responder for tests and followers; steps go nowhere.
pub struct NoopResponder;

impl StepResponder for NoopResponder {
    fn send(&self, _region: &RegionInfo, _operator: &Operator, _step: &OpStep) {}
}

struct PendingEntry {
    seq: u64,
    op: Operator,
}

impl PartialEq for PendingEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}
impl Eq for PendingEntry {}
impl PartialOrd for PendingEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for PendingEntry {
    // Max-heap: higher priority first, then FIFO within a priority.
    fn cmp(&self, other: &Self) -> Ordering {
        self.op
            .priority
            .cmp(&other.op.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Owns every live operator. At most one per region, always.
pub struct OperatorController {
    running: Mutex<AHashMap<RegionId, Operator>>,
    pending: Mutex<BinaryHeap<PendingEntry>>,
    limiters: StoreLimiters,
    responder: RwLock<Arc<dyn StepResponder>>,
    seq: AtomicU64,
}

impl OperatorController {
    pub fn new(limiters: StoreLimiters) -> Self {
        Self {
            running: Mutex::new(AHashMap::new()),
            pending: Mutex::new(BinaryHeap::new()),
            limiters,
            responder: RwLock::new(Arc::new(NoopResponder)),
            seq: AtomicU64::new(0),
        }
    }

    /// Wires the transport the server provides.
    pub fn set_responder(&self, responder: Arc<dyn StepResponder>) {
        *self.responder.write() = responder;
    }

    pub fn limiters(&self) -> &StoreLimiters {
        &self.limiters
    }

    /// Proposes an operator. Returns whether it was accepted (running or
    /// queued). A region with a live operator only yields to strictly
    /// higher priority.
    pub fn add_operator(&self, region: &RegionInfo, mut op: Operator) -> Result<bool> {
        {
            let mut running = self.running.lock();
            if let Some(existing) = running.get_mut(&op.region_id) {
                if op.priority <= existing.priority {
                    debug!(
                        target: "operator",
                        region_id = op.region_id,
                        desc = %op.desc,
                        "rejected: operator already present"
                    );
                    return Ok(false);
                }
                existing.status = OpStatus::Replace;
                info!(
                    target: "operator",
                    region_id = op.region_id,
                    old = %existing.desc,
                    new = %op.desc,
                    "operator replaced by higher priority"
                );
                running.remove(&op.region_id);
            }
        }
        if !self.limiters.take_all(&op.admission_costs()) {
            let seq = self.seq.fetch_add(1, AtomicOrdering::SeqCst);
            debug!(target: "operator", region_id = op.region_id, desc = %op.desc, "rate limited, queued");
            self.pending.lock().push(PendingEntry { seq, op });
            return Ok(true);
        }
        self.start_operator(region, &mut op);
        self.running.lock().insert(op.region_id, op);
        Ok(true)
    }

    fn start_operator(&self, region: &RegionInfo, op: &mut Operator) {
        op.start();
        if let Some(step) = op.current() {
            self.responder.read().send(region, op, step);
        }
        info!(
            target: "operator",
            region_id = op.region_id,
            desc = %op.desc,
            steps = op.steps.len(),
            "operator started"
        );
    }

    /// Drives the region's operator against a fresh heartbeat-observed
    /// state. Called from the heartbeat pipeline.
    pub fn dispatch(&self, region: &RegionInfo) {
        let mut running = self.running.lock();
        let Some(op) = running.get_mut(&region.id()) else {
            return;
        };
        match op.check(region) {
            OpCheck::Finished => {
                info!(target: "operator", region_id = region.id(), desc = %op.desc, "operator finished");
                running.remove(&region.id());
            }
            OpCheck::Timeout => {
                warn!(target: "operator", region_id = region.id(), desc = %op.desc, "operator timed out");
                running.remove(&region.id());
            }
            OpCheck::Progress(step) => {
                self.responder.read().send(region, op, &step);
            }
        }
    }

    /// Region vanished from the index (merge completion). Merge operators
    /// finished their job; anything else is cancelled.
    pub fn on_region_gone(&self, region_id: RegionId) {
        let mut running = self.running.lock();
        if let Some(mut op) = running.remove(&region_id) {
            if op.kind.contains(OpKind::MERGE) {
                op.status = OpStatus::Finished;
                info!(target: "operator", region_id, desc = %op.desc, "merge source absorbed");
            } else {
                op.status = OpStatus::Cancel;
                warn!(target: "operator", region_id, desc = %op.desc, "region gone, operator cancelled");
            }
        }
    }

    /// Cancels a region's operator outright.
    pub fn cancel(&self, region_id: RegionId) -> bool {
        self.running.lock().remove(&region_id).is_some()
    }

    /// The push loop body: re-drive every running operator (catching
    /// timeouts even without heartbeats) and admit queued operators as
    /// tokens free up.
    pub fn push_operators(&self, cluster: &dyn ClusterInformer) {
        let region_ids: Vec<RegionId> = self.running.lock().keys().copied().collect();
        for region_id in region_ids {
            match cluster.get_region(region_id) {
                Some(region) => self.dispatch(&region),
                None => self.on_region_gone(region_id),
            }
        }
        self.promote_pending(cluster);
    }

    fn promote_pending(&self, cluster: &dyn ClusterInformer) {
        loop {
            let entry = {
                let mut pending = self.pending.lock();
                let Some(top) = pending.peek() else { return };
                if !self.limiters.take_all(&top.op.admission_costs()) {
                    return;
                }
                pending.pop()
            };
            let Some(entry) = entry else { return };
            let mut op = entry.op;
            let Some(region) = cluster.get_region(op.region_id) else {
                continue;
            };
            if self.running.lock().contains_key(&op.region_id) {
                continue;
            }
            self.start_operator(&region, &mut op);
            self.running.lock().insert(op.region_id, op);
        }
    }

    /// The live operator for a region, cloned.
    pub fn get(&self, region_id: RegionId) -> Option<Operator> {
        self.running.lock().get(&region_id).cloned()
    }

    /// Running operators carrying `kind`, for scheduler allowance checks.
    pub fn count_by_kind(&self, kind: OpKind) -> usize {
        self.running
            .lock()
            .values()
            .filter(|op| op.kind.contains(kind))
            .count()
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }

    /// Drops everything; operators are transient across failover by
    /// design — the next primary's heartbeats re-surface the mismatches.
    pub fn clear(&self) {
        self.running.lock().clear();
        self.pending.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::informer::SharedCluster;
    use meridian_cluster::{Cluster, ClusterOptions};
    use meridian_store::{CoordKv, MemStore};
    use meridian_types::config::{ReplicationConfig, ScheduleConfig};
    use meridian_types::{Peer, PeerRole, RegionEpoch, RegionMeta};
    use parking_lot::Mutex as PMutex;

    fn region(id: RegionId, peers: Vec<Peer>, leader_idx: usize) -> RegionInfo {
        RegionInfo {
            leader: peers.get(leader_idx).cloned(),
            meta: RegionMeta {
                id,
                epoch: RegionEpoch::new(1, 1),
                peers,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn transfer_op(region_id: RegionId, to_store: u64, priority: crate::operator::op::OpPriority) -> Operator {
        Operator::new(
            "transfer-leader",
            region_id,
            RegionEpoch::new(1, 1),
            OpKind::LEADER,
            priority,
            vec![OpStep::TransferLeader { to_store }],
        )
    }

    struct RecordingResponder(PMutex<Vec<(RegionId, OpStep)>>);

    impl StepResponder for RecordingResponder {
        fn send(&self, region: &RegionInfo, _op: &Operator, step: &OpStep) {
            self.0.lock().push((region.id(), step.clone()));
        }
    }

    fn controller() -> OperatorController {
        OperatorController::new(StoreLimiters::new(60.0, 60.0))
    }

    #[test]
    fn at_most_one_operator_per_region() {
        use crate::operator::op::OpPriority;
        let opc = controller();
        let r = region(1, vec![Peer::voter(10, 1), Peer::voter(11, 2)], 0);
        assert!(opc.add_operator(&r, transfer_op(1, 2, OpPriority::Medium)).unwrap());
        // Same or lower priority is rejected.
        assert!(!opc.add_operator(&r, transfer_op(1, 2, OpPriority::Medium)).unwrap());
        assert!(!opc.add_operator(&r, transfer_op(1, 2, OpPriority::Low)).unwrap());
        assert_eq!(opc.running_count(), 1);
        // Strictly higher priority replaces.
        assert!(opc.add_operator(&r, transfer_op(1, 2, OpPriority::Urgent)).unwrap());
        assert_eq!(opc.running_count(), 1);
        assert_eq!(opc.get(1).unwrap().priority, OpPriority::Urgent);
    }

    #[test]
    fn dispatch_advances_and_finishes() {
        use crate::operator::op::OpPriority;
        let opc = controller();
        let responder = Arc::new(RecordingResponder(PMutex::new(Vec::new())));
        opc.set_responder(Arc::clone(&responder) as Arc<dyn StepResponder>);
        let peers = vec![Peer::voter(10, 1), Peer::voter(11, 2)];
        let r = region(1, peers.clone(), 0);
        opc.add_operator(&r, transfer_op(1, 2, OpPriority::High)).unwrap();
        assert_eq!(responder.0.lock().len(), 1);

        // Heartbeat still shows the old leader: step re-sent.
        opc.dispatch(&r);
        assert_eq!(responder.0.lock().len(), 2);

        // Leader moved: operator completes and leaves the table.
        let moved = region(1, peers, 1);
        opc.dispatch(&moved);
        assert!(opc.get(1).is_none());
    }

    #[test]
    fn rate_limited_operators_queue_until_tokens_free_up() {
        use crate::operator::op::OpPriority;
        let opc = OperatorController::new(StoreLimiters::new(1.0, 60.0));
        let kv: Arc<dyn CoordKv> = Arc::new(MemStore::new());
        let core = Arc::new(Cluster::new(kv, ClusterOptions::default()));
        let shared =
            SharedCluster::new(Arc::clone(&core), ScheduleConfig::default(), ReplicationConfig::default());

        let mk_add = |region_id: u64, priority| {
            Operator::new(
                "add-rule-peer",
                region_id,
                RegionEpoch::new(1, 1),
                OpKind::REGION,
                priority,
                vec![OpStep::AddLearner {
                    store_id: 5,
                    peer_id: region_id * 10,
                }],
            )
        };
        let r1 = region(1, vec![Peer::voter(10, 1)], 0);
        let r2 = region(2, vec![Peer::voter(20, 2)], 0);
        core.apply_synced_region(r1.clone()).unwrap();
        core.apply_synced_region(r2.clone()).unwrap();
        // First consumes the only token; the second queues.
        assert!(opc.add_operator(&r1, mk_add(1, OpPriority::Medium)).unwrap());
        assert!(opc.add_operator(&r2, mk_add(2, OpPriority::Medium)).unwrap());
        assert_eq!(opc.running_count(), 1);

        opc.limiters().set_unlimited(5, true);
        opc.promote_pending(&shared);
        assert_eq!(opc.running_count(), 2);
        assert!(opc.get(2).is_some());
    }

    #[test]
    fn pending_queue_orders_by_priority_then_fifo() {
        use crate::operator::op::OpPriority;
        let mut heap = BinaryHeap::new();
        let mk = |seq: u64, region_id: u64, priority| PendingEntry {
            seq,
            op: transfer_op(region_id, 2, priority),
        };
        heap.push(mk(0, 1, OpPriority::Medium));
        heap.push(mk(1, 2, OpPriority::Urgent));
        heap.push(mk(2, 3, OpPriority::Medium));
        heap.push(mk(3, 4, OpPriority::High));
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|e| e.op.region_id)).collect();
        assert_eq!(order, vec![2, 4, 1, 3]);
    }

    #[test]
    fn merge_completion_counts_as_finished() {
        use crate::operator::op::OpPriority;
        let opc = controller();
        let r = region(7, vec![Peer::voter(70, 1)], 0);
        let op = Operator::new(
            "merge-region",
            7,
            RegionEpoch::new(1, 1),
            OpKind::MERGE,
            OpPriority::Medium,
            vec![OpStep::MergeRegion {
                target: RegionMeta::default(),
                is_passive: false,
            }],
        );
        opc.add_operator(&r, op).unwrap();
        opc.on_region_gone(7);
        assert!(opc.get(7).is_none());
    }
}
