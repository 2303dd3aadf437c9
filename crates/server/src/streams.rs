// Path: crates/server/src/streams.rs
//! Per-store heartbeat response streams.
//!
//! Each storage node's region-heartbeat stream registers a sender here;
//! the operator controller pushes steps to the region's leader store
//! through it. Streams are best-effort: a saturated or gone stream drops
//! the push and the next heartbeat re-surfaces the step.

use ahash::AHashMap;
use meridian_cluster::RegionInfo;
use meridian_schedule::{OpStep, Operator, StepResponder};
use meridian_types::{RegionId, StoreId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

const STREAM_DEPTH: usize = 256;

/// One operator step pushed down a heartbeat stream.
#[derive(Debug, Clone)]
pub struct RegionHeartbeatResponse {
    pub region_id: RegionId,
    /// What the operator is doing, for the node's logs.
    pub desc: String,
    pub step: OpStep,
}

/// The registry of live heartbeat response streams.
#[derive(Default)]
pub struct HeartbeatStreams {
    streams: Mutex<AHashMap<StoreId, mpsc::Sender<RegionHeartbeatResponse>>>,
}

impl HeartbeatStreams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a store's stream, returning the response receiver.
    /// Re-registering replaces the previous stream.
    pub fn register(&self, store_id: StoreId) -> mpsc::Receiver<RegionHeartbeatResponse> {
        let (tx, rx) = mpsc::channel(STREAM_DEPTH);
        self.streams.lock().insert(store_id, tx);
        rx
    }

    pub fn deregister(&self, store_id: StoreId) {
        self.streams.lock().remove(&store_id);
    }

    /// Drops every stream; step-down closes them all cleanly.
    pub fn clear(&self) {
        self.streams.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.lock().is_empty()
    }
}

impl StepResponder for HeartbeatStreams {
    fn send(&self, region: &RegionInfo, operator: &Operator, step: &OpStep) {
        let Some(store_id) = region.leader_store_id() else {
            return;
        };
        let streams = self.streams.lock();
        let Some(sender) = streams.get(&store_id) else {
            debug!(target: "server", store_id, region_id = region.id(), "no heartbeat stream for step");
            return;
        };
        let _ = sender.try_send(RegionHeartbeatResponse {
            region_id: region.id(),
            desc: operator.desc.clone(),
            step: step.clone(),
        });
    }
}
