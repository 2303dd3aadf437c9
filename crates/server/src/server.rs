// Path: crates/server/src/server.rs
//! The server proper: subsystem composition and the leader lifecycle.

use std::sync::Arc;
use std::time::Duration;

use meridian_alloc::IdAllocator;
use meridian_cluster::{
    Cluster, ClusterOptions, HeartbeatEffect, HeartbeatHooks, HeartbeatRouter,
};
use meridian_election::{
    claim_expected_primary, expected_primary, transfer_expected_primary, Leadership, Member,
    PrimaryGuard,
};
use meridian_resource::{ResourceGroupManager, SafePointManager};
use meridian_schedule::checker::{CheckerSuite, LearnerChecker, MergeChecker, ReplicaChecker, RuleChecker};
use meridian_schedule::schedulers::SchedulerFactory;
use meridian_schedule::statistics::HotRegionCache;
use meridian_schedule::{
    Coordinator, IdSource, OperatorController, RegionLabeler, RegionScatterer, ReplenishedIdPool,
    RuleManager, SchedulerController, SharedCluster,
};
use meridian_schedule::operator::StoreLimiters;
use meridian_store::CoordKv;
use meridian_sync::{RegionSyncer, SyncClient, SyncMessage};
use meridian_tso::{TimestampOracle, TsoConnector, TsoDispatcher, TsoProvider};
use meridian_types::config::PdConfig;
use meridian_types::{PdError, Result, DEFAULT_KEYSPACE_ID};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::streams::HeartbeatStreams;

/// The service name under the election prefix.
pub const ELECTION_SERVICE: &str = "pd";
/// Low-water mark of the synchronous peer-ID pool.
const ID_POOL_LOW_WATER: usize = 64;
const ID_POOL_REFILL_BATCH: u64 = 256;
const ID_POOL_REFILL_INTERVAL: Duration = Duration::from_secs(1);

/// A connector for deployments without delegated TSO replicas.
struct NoDelegates;

impl TsoConnector for NoDelegates {
    fn connect(&self, addr: &str) -> Result<Arc<dyn TsoProvider>> {
        Err(PdError::Unavailable(format!(
            "no transport to delegated tso replica {addr}"
        )))
    }
}

/// What accepted heartbeats fan out into: the synchronizer and the
/// scheduling engine.
pub struct ServerHooks {
    syncer: Arc<RegionSyncer>,
    coordinator: Arc<Coordinator>,
}

impl HeartbeatHooks for ServerHooks {
    fn on_region_accepted(&self, effect: &HeartbeatEffect) {
        // Stats-only updates sync too; followers mirror flow data.
        self.syncer.broadcast(Arc::clone(&effect.region));
        self.coordinator.observe_heartbeat(effect);
    }
}

/// One PD replica.
pub struct PdServer {
    config: PdConfig,
    kv: Arc<dyn CoordKv>,
    election: Arc<Leadership>,
    cluster: Arc<Cluster>,
    shared: SharedCluster,
    tso: Arc<TimestampOracle>,
    tso_dispatcher: Arc<TsoDispatcher>,
    id_alloc: Arc<IdAllocator>,
    id_pool: Arc<ReplenishedIdPool>,
    rules: Arc<RuleManager>,
    labeler: Arc<RegionLabeler>,
    opc: Arc<OperatorController>,
    coordinator: Arc<Coordinator>,
    scatterer: Arc<RegionScatterer>,
    syncer: Arc<RegionSyncer>,
    safe_points: Arc<SafePointManager>,
    resource_mgr: Arc<ResourceGroupManager>,
    streams: Arc<HeartbeatStreams>,
    hot_cache: Arc<HotRegionCache>,
    heartbeats: RwLock<Option<Arc<HeartbeatRouter>>>,
    schedulers: RwLock<Option<Arc<SchedulerController>>>,
    term_shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl PdServer {
    pub fn new(kv: Arc<dyn CoordKv>, config: PdConfig) -> Arc<Self> {
        let member = Member::new(config.name.clone(), config.client_urls.clone());
        let election = Arc::new(Leadership::new(
            Arc::clone(&kv),
            ELECTION_SERVICE,
            member,
            Duration::from_secs(config.election.leader_lease_secs),
        ));
        let cluster = Arc::new(Cluster::new(
            Arc::clone(&kv),
            ClusterOptions {
                slow_store_score_threshold: config.schedule.slow_store_score_threshold,
                max_store_down: Duration::from_secs(config.schedule.max_store_down_secs),
                disconnect_timeout: Duration::from_secs(config.schedule.store_disconnect_secs),
            },
        ));
        let shared = SharedCluster::new(
            Arc::clone(&cluster),
            config.schedule.clone(),
            config.replication.clone(),
        );
        let tso = Arc::new(TimestampOracle::new(
            Arc::clone(&kv),
            Duration::from_millis(config.tso.save_ahead_ms),
            Duration::from_millis(config.tso.update_physical_interval_ms),
        ));
        let tso_dispatcher = Arc::new(TsoDispatcher::new(
            Arc::clone(&tso),
            Arc::clone(&kv),
            Arc::new(NoDelegates),
            config.tso.enable_dynamic_switching,
            Duration::from_millis(config.tso.switch_interval_ms),
        ));
        let id_alloc = Arc::new(IdAllocator::new(Arc::clone(&kv)));
        let id_pool = Arc::new(ReplenishedIdPool::new(ID_POOL_LOW_WATER));
        let rules = Arc::new(RuleManager::new(Arc::clone(&kv)));
        let labeler = Arc::new(RegionLabeler::new(Arc::clone(&kv)));
        let opc = Arc::new(OperatorController::new(StoreLimiters::new(
            config.schedule.store_limit_add_peer_per_min,
            config.schedule.store_limit_remove_peer_per_min,
        )));
        let streams = Arc::new(HeartbeatStreams::new());
        opc.set_responder(Arc::clone(&streams) as Arc<dyn meridian_schedule::StepResponder>);
        let hot_cache = Arc::new(HotRegionCache::new());
        let ids: Arc<dyn IdSource> = Arc::clone(&id_pool) as Arc<dyn IdSource>;
        let checkers = if config.replication.enable_placement_rules {
            vec![
                Box::new(RuleChecker::new(Arc::clone(&rules), Arc::clone(&ids)))
                    as Box<dyn meridian_schedule::checker::Checker>,
                Box::new(LearnerChecker::new(Arc::clone(&rules))),
                Box::new(MergeChecker),
            ]
        } else {
            vec![
                Box::new(ReplicaChecker::new(Arc::clone(&ids)))
                    as Box<dyn meridian_schedule::checker::Checker>,
                Box::new(LearnerChecker::new(Arc::clone(&rules))),
                Box::new(MergeChecker),
            ]
        };
        let coordinator = Arc::new(Coordinator::new(
            Arc::new(shared.clone()) as Arc<dyn meridian_schedule::ClusterInformer>,
            Arc::clone(&opc),
            Arc::new(CheckerSuite::new(checkers)),
            Arc::clone(&labeler),
            Arc::clone(&hot_cache),
        ));
        let scatterer = Arc::new(RegionScatterer::new(Arc::clone(&rules), Arc::clone(&ids)));
        let syncer = Arc::new(RegionSyncer::new(
            config.schedule.region_sync_ring_capacity,
        ));
        let safe_points = Arc::new(SafePointManager::new(Arc::clone(&kv)));
        let resource_mgr = Arc::new(ResourceGroupManager::new(Arc::clone(&kv)));

        Arc::new(Self {
            config,
            kv,
            election,
            cluster,
            shared,
            tso,
            tso_dispatcher,
            id_alloc,
            id_pool,
            rules,
            labeler,
            opc,
            coordinator,
            scatterer,
            syncer,
            safe_points,
            resource_mgr,
            streams,
            hot_cache,
            heartbeats: RwLock::new(None),
            schedulers: RwLock::new(None),
            term_shutdown: Mutex::new(None),
        })
    }

    // ---- accessors the RPC layer and tests use ----

    pub fn config(&self) -> &PdConfig {
        &self.config
    }

    pub fn kv(&self) -> &Arc<dyn CoordKv> {
        &self.kv
    }

    pub fn member(&self) -> &Member {
        self.election.member()
    }

    pub fn is_leader(&self) -> bool {
        self.election.is_leader()
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn shared(&self) -> &SharedCluster {
        &self.shared
    }

    pub fn tso_dispatcher(&self) -> &Arc<TsoDispatcher> {
        &self.tso_dispatcher
    }

    pub fn id_alloc(&self) -> &Arc<IdAllocator> {
        &self.id_alloc
    }

    pub fn rules(&self) -> &Arc<RuleManager> {
        &self.rules
    }

    pub fn labeler(&self) -> &Arc<RegionLabeler> {
        &self.labeler
    }

    pub fn operators(&self) -> &Arc<OperatorController> {
        &self.opc
    }

    pub fn scatterer(&self) -> &Arc<RegionScatterer> {
        &self.scatterer
    }

    pub fn safe_points(&self) -> &Arc<SafePointManager> {
        &self.safe_points
    }

    pub fn resource_manager(&self) -> &Arc<ResourceGroupManager> {
        &self.resource_mgr
    }

    pub fn heartbeat_streams(&self) -> &Arc<HeartbeatStreams> {
        &self.streams
    }

    pub fn heartbeat_router(&self) -> Option<Arc<HeartbeatRouter>> {
        self.heartbeats.read().clone()
    }

    pub fn scheduler_controller(&self) -> Option<Arc<SchedulerController>> {
        self.schedulers.read().clone()
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub async fn leader_addr(&self) -> Option<String> {
        self.election.leader_addr().await.ok().flatten()
    }

    pub async fn leader_member(&self) -> Option<Member> {
        self.election.current_leader().await.ok().flatten()
    }

    /// Admin handoff: name the replica that should hold leadership next.
    pub async fn transfer_primary(&self, target: &str) -> Result<()> {
        transfer_expected_primary(self.kv.as_ref(), ELECTION_SERVICE, target).await
    }

    // ---- follower-side sync ----

    /// Leader side: opens a sync stream for a follower.
    pub fn connect_sync(&self, follower: &str, from_revision: u64) -> mpsc::Receiver<SyncMessage> {
        self.syncer
            .start_sync(follower, from_revision, &self.cluster)
    }

    /// Follower side: applies a leader's stream into the local index
    /// until it ends or `shutdown` fires.
    pub async fn run_sync_client(
        &self,
        stream: mpsc::Receiver<SyncMessage>,
        shutdown: watch::Receiver<bool>,
    ) -> u64 {
        let mut client = SyncClient::new(Arc::clone(&self.cluster));
        client.run(stream, shutdown).await
    }

    // ---- the election loop ----

    /// Runs the replica until `shutdown` fires: campaign, serve a term,
    /// step down, repeat.
    pub async fn run(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            // The expected-primary flag gates campaigning: while it names
            // someone else, wait instead of fighting them for the key.
            match expected_primary(self.kv.as_ref(), ELECTION_SERVICE).await {
                Ok(Some(expected)) if expected != self.member().name => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(200)) => continue,
                        _ = shutdown.changed() => continue,
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(target: "server", error = %e, "expected-primary read failed");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    continue;
                }
            }
            match self.election.campaign().await {
                Ok(true) => {
                    if let Err(e) = self.serve_term(&mut shutdown).await {
                        error!(target: "server", error = %e, "leader term ended with error");
                    }
                    self.stop_term().await;
                }
                Ok(false) => {
                    tokio::select! {
                        result = self.election.wait_leader_change() => {
                            if let Err(e) = result {
                                warn!(target: "server", error = %e, "leader watch failed");
                                tokio::time::sleep(Duration::from_millis(200)).await;
                            }
                        }
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    warn!(target: "server", error = %e, "campaign failed");
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }
    }

    /// Brings up every leader-only task, then blocks until the term ends
    /// for any reason.
    async fn serve_term(self: &Arc<Self>, shutdown: &mut watch::Receiver<bool>) -> Result<()> {
        info!(target: "server", name = %self.member().name, "starting leader term");
        let (term_tx, term_rx) = watch::channel(false);
        *self.term_shutdown.lock() = Some(term_tx);

        self.cluster.load_from_store().await?;
        let replication = self.shared.replication.read().clone();
        self.rules.load(&replication).await?;
        self.labeler.load().await?;
        self.resource_mgr.load().await?;
        self.id_alloc.reset().await;
        self.refill_id_pool().await?;
        self.tso.sync_timestamp().await?;

        let mut tso_failed = self.tso.spawn_update_loop(term_rx.clone());
        self.tso_dispatcher.spawn_switch_loop(term_rx.clone());
        let mut lease_lost = self.election.spawn_keep_alive(term_rx.clone());

        let flag_lease = claim_expected_primary(
            self.kv.as_ref(),
            ELECTION_SERVICE,
            &self.member().name,
            Duration::from_secs(self.config.election.expected_primary_lease_secs),
        )
        .await?;
        let mut guard = PrimaryGuard::spawn(
            Arc::clone(&self.kv),
            ELECTION_SERVICE,
            self.member().name.clone(),
            flag_lease,
            Duration::from_secs(self.config.election.expected_primary_lease_secs),
            term_rx.clone(),
        );

        let hooks = Arc::new(ServerHooks {
            syncer: Arc::clone(&self.syncer),
            coordinator: Arc::clone(&self.coordinator),
        });
        *self.heartbeats.write() = Some(Arc::new(HeartbeatRouter::start(
            Arc::clone(&self.cluster),
            hooks,
            self.config.schedule.heartbeat_workers,
            term_rx.clone(),
        )));

        let informer: Arc<dyn meridian_schedule::ClusterInformer> =
            Arc::new(self.shared.clone());
        let scheduler_controller = Arc::new(SchedulerController::new(
            Arc::clone(&self.kv),
            informer,
            Arc::clone(&self.opc),
            Arc::clone(&self.labeler),
            term_rx.clone(),
        ));
        let factory = SchedulerFactory {
            hot_cache: Arc::clone(&self.hot_cache),
            ids: Arc::clone(&self.id_pool) as Arc<dyn IdSource>,
        };
        for kind in [
            "balance-leader",
            "balance-region",
            "balance-hot-region",
            "transfer-witness-leader",
            "evict-slow-store",
            "evict-slow-trend",
        ] {
            match factory.build(kind, &[]) {
                Ok(scheduler) => {
                    if let Err(e) = scheduler_controller.add_scheduler(scheduler).await {
                        warn!(target: "server", kind, error = %e, "default scheduler not added");
                    }
                }
                Err(e) => warn!(target: "server", kind, error = %e, "default scheduler not built"),
            }
        }
        if let Err(e) = scheduler_controller.load_persisted(&factory).await {
            warn!(target: "server", error = %e, "persisted schedulers not loaded");
        }
        *self.schedulers.write() = Some(scheduler_controller);

        self.coordinator.spawn_loops(term_rx.clone());
        self.labeler.spawn_gc_loop(term_rx.clone());
        self.safe_points
            .spawn_expiry_loop(vec![DEFAULT_KEYSPACE_ID], term_rx.clone());
        self.resource_mgr.spawn_loops(term_rx.clone());
        self.spawn_id_pool_refill(term_rx.clone());

        info!(target: "server", name = %self.member().name, "leader term running");
        tokio::select! {
            _ = lease_lost.changed() => {
                warn!(target: "server", "leader lease lost, stepping down");
            }
            _ = guard.abdicate.changed() => {
                info!(target: "server", "expected primary moved, stepping down");
                let _ = self.election.resign().await;
            }
            _ = tso_failed.changed() => {
                error!(target: "server", "timestamp oracle failed, stepping down");
                let _ = self.election.resign().await;
            }
            _ = shutdown.changed() => {
                info!(target: "server", "process shutdown, resigning");
                let _ = self.election.resign().await;
            }
        }
        Ok(())
    }

    /// Cancels every leader task and resets leader-only state. All tasks
    /// watch the term channel, so the whole term unwinds within their
    /// select loops.
    async fn stop_term(&self) {
        if let Some(tx) = self.term_shutdown.lock().take() {
            let _ = tx.send(true);
        }
        if let Some(controller) = self.schedulers.write().take() {
            controller.stop_all();
        }
        *self.heartbeats.write() = None;
        self.election.mark_lost();
        self.tso.reset();
        self.opc.clear();
        self.syncer.reset();
        self.hot_cache.reset();
        self.streams.clear();
        info!(target: "server", name = %self.member().name, "leader term stopped");
    }

    /// Builds a scheduler wired to this server's hot cache and ID pool.
    pub fn build_scheduler(
        &self,
        kind: &str,
        args: &[String],
    ) -> Result<Arc<dyn meridian_schedule::Scheduler>> {
        let factory = SchedulerFactory {
            hot_cache: Arc::clone(&self.hot_cache),
            ids: Arc::clone(&self.id_pool) as Arc<dyn IdSource>,
        };
        factory.build(kind, args)
    }

    /// Pauses (or resumes, with 0 seconds) one checker.
    pub fn pause_checker(&self, name: &str, seconds: u64) {
        self.coordinator
            .checkers()
            .pause
            .pause(name, Duration::from_secs(seconds));
    }

    async fn refill_id_pool(&self) -> Result<()> {
        while self.id_pool.needs_refill() {
            let (base, count) = self.id_alloc.alloc(ID_POOL_REFILL_BATCH).await?;
            self.id_pool.refill_with(base, count);
        }
        Ok(())
    }

    fn spawn_id_pool_refill(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let server = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(ID_POOL_REFILL_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = server.refill_id_pool().await {
                            warn!(target: "server", error = %e, "peer id pool refill failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }
}
