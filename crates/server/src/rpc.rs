// Path: crates/server/src/rpc.rs
//! The typed RPC surface.
//!
//! Every request carries a cluster-ID header; a mismatch answers
//! `ClusterMismatch`. Mutating calls on a non-leader answer `NotLeader`
//! with the current leader's address for client redirection. A transport
//! (gRPC or otherwise) would wrap these handlers one-to-one; mutating
//! responses carry their typed error in the response header there, which
//! is exactly the `Result` these methods return.

use std::sync::Arc;

use meridian_cluster::RegionInfo;
use meridian_election::Member;
use meridian_schedule::{OpKind, OpPriority, OpStep, Operator};
use meridian_types::config::{ReplicationConfig, ScheduleConfig};
use meridian_types::stats::{Buckets, PeerStats, RegionStats, StoreStats};
use meridian_types::{
    codec, keys, KeyspaceId, PdError, Peer, RegionId, RegionMeta, Result, StoreId, StoreMeta,
    Timestamp,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::server::{PdServer, ELECTION_SERVICE};
use crate::streams::RegionHeartbeatResponse;

/// Carried by every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RequestHeader {
    pub cluster_id: u64,
}

/// Membership view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembersResponse {
    pub members: Vec<Member>,
    pub leader: Option<Member>,
}

/// One region heartbeat as a storage node reports it.
#[derive(Debug, Clone, Default)]
pub struct RegionHeartbeatRequest {
    pub header: RequestHeader,
    pub region: RegionMeta,
    pub leader: Option<Peer>,
    pub down_peers: Vec<PeerStats>,
    pub pending_peers: Vec<Peer>,
    pub stats: RegionStats,
    pub buckets: Option<Buckets>,
}

impl RegionHeartbeatRequest {
    fn into_region_info(self) -> RegionInfo {
        RegionInfo {
            meta: self.region,
            leader: self.leader,
            down_peers: self.down_peers,
            pending_peers: self.pending_peers,
            stats: self.stats,
            buckets: self.buckets,
            ..Default::default()
        }
    }
}

/// Store heartbeat reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreHeartbeatResponse {
    pub cluster_version: String,
}

/// Split grant: fresh IDs for the new region and its peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitGrant {
    pub new_region_id: RegionId,
    pub new_peer_ids: Vec<u64>,
}

/// Runtime-mutable cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub schedule: ScheduleConfig,
    pub replication: ReplicationConfig,
}

/// The typed service layer over one PD replica.
#[derive(Clone)]
pub struct PdService {
    server: Arc<PdServer>,
}

impl PdService {
    pub fn new(server: Arc<PdServer>) -> Self {
        Self { server }
    }

    async fn not_leader(&self) -> PdError {
        PdError::NotLeader {
            leader: self.server.leader_addr().await,
        }
    }

    async fn check_header(&self, header: &RequestHeader) -> Result<()> {
        let ours = match self.server.cluster().cluster_id() {
            Some(id) => Some(id),
            // Followers learn the cluster ID lazily from the store.
            None => self
                .server
                .cluster()
                .load_meta()
                .await?
                .map(|m| m.cluster_id),
        };
        match ours {
            Some(ours) if ours == header.cluster_id => Ok(()),
            Some(ours) => Err(PdError::ClusterMismatch {
                expected: ours,
                got: header.cluster_id,
            }),
            None => Err(PdError::NotBootstrapped),
        }
    }

    async fn ensure_leader(&self) -> Result<()> {
        if self.server.is_leader() {
            Ok(())
        } else {
            Err(self.not_leader().await)
        }
    }

    // ---- bootstrap & membership ----

    pub async fn is_bootstrapped(&self) -> Result<bool> {
        Ok(self.server.cluster().is_bootstrapped())
    }

    /// Idempotent in the error sense: the second caller gets
    /// `AlreadyBootstrapped` and may treat it as success.
    pub async fn bootstrap(
        &self,
        header: RequestHeader,
        store: StoreMeta,
        region: RegionMeta,
    ) -> Result<()> {
        self.ensure_leader().await?;
        self.server
            .cluster()
            .bootstrap(header.cluster_id, store, region)
            .await
    }

    pub async fn get_members(&self) -> Result<MembersResponse> {
        let prefix = keys::election_participant_prefix(ELECTION_SERVICE);
        let end = keys::range_end_of_prefix(&prefix);
        let mut members = Vec::new();
        for kv in self.server.kv().load_range(&prefix, &end, 0).await? {
            members.push(Member::from_bytes(&kv.value)?);
        }
        if members.is_empty() {
            members.push(self.server.member().clone());
        }
        Ok(MembersResponse {
            members,
            leader: self.server.leader_member().await,
        })
    }

    /// Registers this replica as a participant; called at startup.
    pub async fn register_participant(&self) -> Result<()> {
        let member = self.server.member();
        self.server
            .kv()
            .save(
                &keys::election_participant_path(ELECTION_SERVICE, &member.name),
                member.to_bytes()?,
            )
            .await
    }

    pub async fn get_cluster_config(&self, header: RequestHeader) -> Result<ClusterConfig> {
        self.check_header(&header).await?;
        Ok(ClusterConfig {
            schedule: self.server.shared().schedule.read().clone(),
            replication: self.server.shared().replication.read().clone(),
        })
    }

    pub async fn put_cluster_config(
        &self,
        header: RequestHeader,
        config: ClusterConfig,
    ) -> Result<()> {
        self.check_header(&header).await?;
        self.ensure_leader().await?;
        *self.server.shared().schedule.write() = config.schedule;
        *self.server.shared().replication.write() = config.replication;
        info!(target: "rpc", "cluster config updated");
        Ok(())
    }

    // ---- ids & timestamps ----

    pub async fn alloc_id(&self, header: RequestHeader, count: u64) -> Result<(u64, u64)> {
        self.check_header(&header).await?;
        self.ensure_leader().await?;
        self.server.id_alloc().alloc(count).await
    }

    pub async fn get_ts(&self, header: RequestHeader, count: u64) -> Result<Timestamp> {
        self.check_header(&header).await?;
        if count == 0 {
            return Err(PdError::InvalidInput("timestamp count must be >= 1".into()));
        }
        match self.server.tso_dispatcher().get_ts(count).await {
            Err(PdError::NotLeader { .. }) => Err(self.not_leader().await),
            other => other,
        }
    }

    pub async fn get_external_timestamp(&self, header: RequestHeader) -> Result<u64> {
        self.check_header(&header).await?;
        Ok(self.server.cluster().external_timestamp())
    }

    pub async fn set_external_timestamp(&self, header: RequestHeader, ts: u64) -> Result<()> {
        self.check_header(&header).await?;
        self.ensure_leader().await?;
        let current = self.server.tso_dispatcher().get_ts(1).await?.into_u64();
        self.server.cluster().set_external_timestamp(ts, current).await
    }

    pub async fn report_min_resolved_ts(
        &self,
        header: RequestHeader,
        store_id: StoreId,
        ts: u64,
    ) -> Result<()> {
        self.check_header(&header).await?;
        self.ensure_leader().await?;
        self.server.cluster().report_min_resolved_ts(store_id, ts)
    }

    pub async fn get_min_resolved_ts(&self, header: RequestHeader) -> Result<u64> {
        self.check_header(&header).await?;
        Ok(self.server.cluster().min_resolved_ts())
    }

    // ---- stores ----

    pub async fn put_store(&self, header: RequestHeader, store: StoreMeta) -> Result<()> {
        self.check_header(&header).await?;
        self.ensure_leader().await?;
        self.server.cluster().put_store(store).await
    }

    pub async fn get_store(
        &self,
        header: RequestHeader,
        store_id: StoreId,
    ) -> Result<Arc<meridian_cluster::StoreInfo>> {
        self.check_header(&header).await?;
        self.server.cluster().get_store(store_id)
    }

    pub async fn get_all_stores(
        &self,
        header: RequestHeader,
        exclude_tombstone: bool,
    ) -> Result<Vec<Arc<meridian_cluster::StoreInfo>>> {
        self.check_header(&header).await?;
        let mut stores = self.server.cluster().get_all_stores();
        if exclude_tombstone {
            stores.retain(|s| !s.meta.is_tombstone());
        }
        Ok(stores)
    }

    pub async fn delete_store(
        &self,
        header: RequestHeader,
        store_id: StoreId,
        physically_destroyed: bool,
    ) -> Result<()> {
        self.check_header(&header).await?;
        self.ensure_leader().await?;
        let result = self
            .server
            .cluster()
            .delete_store(store_id, physically_destroyed)
            .await;
        if result.is_ok() {
            // Draining stores get unlimited removal so they empty fast.
            self.server
                .operators()
                .limiters()
                .set_unlimited(store_id, true);
        }
        result
    }

    pub async fn remove_tombstone_stores(&self, header: RequestHeader) -> Result<Vec<StoreId>> {
        self.check_header(&header).await?;
        self.ensure_leader().await?;
        self.server.cluster().remove_tombstone_stores().await
    }

    pub async fn set_store_weight(
        &self,
        header: RequestHeader,
        store_id: StoreId,
        leader_weight: f64,
        region_weight: f64,
    ) -> Result<()> {
        self.check_header(&header).await?;
        self.ensure_leader().await?;
        self.server
            .cluster()
            .set_store_weight(store_id, leader_weight, region_weight)
            .await
    }

    pub async fn store_heartbeat(
        &self,
        header: RequestHeader,
        stats: StoreStats,
    ) -> Result<StoreHeartbeatResponse> {
        self.check_header(&header).await?;
        self.ensure_leader().await?;
        let damaged = self.server.cluster().handle_store_heartbeat(stats)?;
        for region_id in damaged {
            self.remove_damaged_peer(region_id).await;
        }
        Ok(StoreHeartbeatResponse {
            cluster_version: self.server.cluster().cluster_version(),
        })
    }

    async fn remove_damaged_peer(&self, region_id: RegionId) {
        let Ok(region) = self.server.cluster().get_region_by_id(region_id) else {
            return;
        };
        // The damaged replica is on the reporting store; without the
        // report's store context the peer set tells us which one is gone.
        let Some(stats) = region.down_peers.first() else {
            warn!(target: "rpc", region_id, "damaged region has no down peer to remove");
            return;
        };
        let op = Operator::new(
            "remove-damaged-peer",
            region.id(),
            region.epoch(),
            OpKind::ADMIN.union(OpKind::REGION),
            OpPriority::Urgent,
            vec![OpStep::RemovePeer {
                store_id: stats.peer.store_id,
                peer_id: stats.peer.id,
            }],
        );
        if let Err(e) = self.server.operators().add_operator(&region, op) {
            warn!(target: "rpc", region_id, error = %e, "damaged-peer operator rejected");
        }
    }

    // ---- regions ----

    /// Opens the bidirectional heartbeat stream for one store: requests
    /// flow in through the returned sender, operator steps flow back out
    /// of the returned receiver.
    pub async fn region_heartbeat_stream(
        &self,
        header: RequestHeader,
        store_id: StoreId,
    ) -> Result<(
        mpsc::Sender<RegionHeartbeatRequest>,
        mpsc::Receiver<RegionHeartbeatResponse>,
    )> {
        self.check_header(&header).await?;
        self.ensure_leader().await?;
        let Some(router) = self.server.heartbeat_router() else {
            return Err(self.not_leader().await);
        };
        let responses = self.server.heartbeat_streams().register(store_id);
        let (tx, mut rx) = mpsc::channel::<RegionHeartbeatRequest>(256);
        let service = self.clone();
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                if service.check_header(&request.header).await.is_err() {
                    break;
                }
                let task = meridian_cluster::HeartbeatTask {
                    region: request.into_region_info(),
                };
                if router.submit(task).await.is_err() {
                    break;
                }
            }
            service.server.heartbeat_streams().deregister(store_id);
        });
        Ok((tx, responses))
    }

    /// One-shot heartbeat ingestion, for clients that do not hold a
    /// stream open.
    pub async fn region_heartbeat(&self, request: RegionHeartbeatRequest) -> Result<()> {
        self.check_header(&request.header).await?;
        self.ensure_leader().await?;
        let Some(router) = self.server.heartbeat_router() else {
            return Err(self.not_leader().await);
        };
        router
            .submit(meridian_cluster::HeartbeatTask {
                region: request.into_region_info(),
            })
            .await
    }

    pub async fn get_region(
        &self,
        header: RequestHeader,
        key: &[u8],
    ) -> Result<Arc<RegionInfo>> {
        self.check_header(&header).await?;
        self.server
            .cluster()
            .get_region_by_key(key)
            .ok_or(PdError::RegionNotFound(0))
    }

    pub async fn get_prev_region(
        &self,
        header: RequestHeader,
        key: &[u8],
    ) -> Result<Arc<RegionInfo>> {
        self.check_header(&header).await?;
        self.server
            .cluster()
            .get_prev_region(key)
            .ok_or(PdError::RegionNotFound(0))
    }

    pub async fn get_region_by_id(
        &self,
        header: RequestHeader,
        region_id: RegionId,
    ) -> Result<Arc<RegionInfo>> {
        self.check_header(&header).await?;
        self.server.cluster().get_region_by_id(region_id)
    }

    pub async fn scan_regions(
        &self,
        header: RequestHeader,
        start: &[u8],
        end: &[u8],
        limit: usize,
    ) -> Result<Vec<Arc<RegionInfo>>> {
        self.check_header(&header).await?;
        Ok(self.server.cluster().scan_regions(start, end, limit))
    }

    // ---- splits & scatter ----

    pub async fn ask_split(&self, header: RequestHeader, region_id: RegionId) -> Result<SplitGrant> {
        let grants = self.ask_batch_split(header, region_id, 1).await?;
        grants
            .into_iter()
            .next()
            .ok_or_else(|| PdError::Internal("empty split grant".into()))
    }

    /// Grants IDs for `count` new regions split out of `region_id`.
    pub async fn ask_batch_split(
        &self,
        header: RequestHeader,
        region_id: RegionId,
        count: usize,
    ) -> Result<Vec<SplitGrant>> {
        self.check_header(&header).await?;
        self.ensure_leader().await?;
        if count == 0 {
            return Err(PdError::InvalidInput("split count must be >= 1".into()));
        }
        let region = self.server.cluster().get_region_by_id(region_id)?;
        let mut grants = Vec::with_capacity(count);
        for _ in 0..count {
            let new_region_id = self.server.id_alloc().alloc_one().await?;
            let mut new_peer_ids = Vec::with_capacity(region.meta.peers.len());
            for _ in 0..region.meta.peers.len() {
                new_peer_ids.push(self.server.id_alloc().alloc_one().await?);
            }
            grants.push(SplitGrant {
                new_region_id,
                new_peer_ids,
            });
        }
        info!(target: "rpc", region_id, count, "split ids granted");
        Ok(grants)
    }

    /// Acknowledges a finished split; the new geometry arrives through
    /// heartbeats, this just queues the children for early checking.
    pub async fn report_batch_split(
        &self,
        header: RequestHeader,
        regions: Vec<RegionMeta>,
    ) -> Result<()> {
        self.check_header(&header).await?;
        self.ensure_leader().await?;
        info!(target: "rpc", count = regions.len(), "batch split reported");
        for region in regions {
            self.server.coordinator().add_suspect(region.id);
        }
        Ok(())
    }

    pub async fn scatter_regions(
        &self,
        header: RequestHeader,
        region_ids: Vec<RegionId>,
        group: &str,
    ) -> Result<usize> {
        self.check_header(&header).await?;
        self.ensure_leader().await?;
        let shared = self.server.shared().clone();
        let ops = self
            .server
            .scatterer()
            .scatter_regions(&shared, &region_ids, group)
            .await?;
        let mut accepted = 0;
        for op in ops {
            if let Ok(region) = self.server.cluster().get_region_by_id(op.region_id) {
                if self.server.operators().add_operator(&region, op)? {
                    accepted += 1;
                }
            }
        }
        Ok(accepted)
    }

    // ---- gc safe points ----

    pub async fn get_gc_safe_point(
        &self,
        header: RequestHeader,
        keyspace: KeyspaceId,
    ) -> Result<u64> {
        self.check_header(&header).await?;
        self.server.safe_points().gc_safe_point(keyspace).await
    }

    pub async fn update_gc_safe_point(
        &self,
        header: RequestHeader,
        keyspace: KeyspaceId,
        safe_point: u64,
    ) -> Result<u64> {
        self.check_header(&header).await?;
        self.ensure_leader().await?;
        self.server
            .safe_points()
            .update_gc_safe_point(keyspace, safe_point)
            .await
    }

    pub async fn update_service_gc_safe_point(
        &self,
        header: RequestHeader,
        keyspace: KeyspaceId,
        service_id: &str,
        ttl_secs: u64,
        safe_point: u64,
    ) -> Result<u64> {
        self.check_header(&header).await?;
        self.ensure_leader().await?;
        self.server
            .safe_points()
            .update_service_gc_safe_point(keyspace, service_id, ttl_secs, safe_point)
            .await
    }

    // ---- scheduler & checker admin ----

    pub async fn add_scheduler(
        &self,
        header: RequestHeader,
        kind: &str,
        args: Vec<String>,
    ) -> Result<()> {
        self.check_header(&header).await?;
        self.ensure_leader().await?;
        let controller = self
            .server
            .scheduler_controller()
            .ok_or_else(|| PdError::Unavailable("scheduling not running".into()))?;
        let scheduler = self.server.build_scheduler(kind, &args)?;
        controller.add_scheduler(scheduler).await
    }

    pub async fn remove_scheduler(&self, header: RequestHeader, name: &str) -> Result<()> {
        self.check_header(&header).await?;
        self.ensure_leader().await?;
        let controller = self
            .server
            .scheduler_controller()
            .ok_or_else(|| PdError::Unavailable("scheduling not running".into()))?;
        controller.remove_scheduler(name).await
    }

    pub async fn pause_scheduler(
        &self,
        header: RequestHeader,
        name: &str,
        seconds: u64,
    ) -> Result<()> {
        self.check_header(&header).await?;
        self.ensure_leader().await?;
        let controller = self
            .server
            .scheduler_controller()
            .ok_or_else(|| PdError::Unavailable("scheduling not running".into()))?;
        controller.pause_scheduler(name, seconds)
    }

    pub async fn pause_checker(
        &self,
        header: RequestHeader,
        name: &str,
        seconds: u64,
    ) -> Result<()> {
        self.check_header(&header).await?;
        self.ensure_leader().await?;
        self.server.pause_checker(name, seconds);
        Ok(())
    }

    // ---- membership admin ----

    pub async fn transfer_primary(&self, header: RequestHeader, target: &str) -> Result<()> {
        self.check_header(&header).await?;
        self.server.transfer_primary(target).await
    }

    // ---- encoded blobs for admin tooling ----

    pub async fn get_placement_rules(&self, header: RequestHeader) -> Result<Vec<u8>> {
        self.check_header(&header).await?;
        codec::to_json_bytes(&self.server.rules().all_rules())
    }
}
