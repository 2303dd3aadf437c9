// Path: crates/test-utils/src/lib.rs

//! Fixtures shared by the workspace's test suites: metadata builders and
//! an in-process PD replica bundle.

use std::sync::Arc;
use std::time::Duration;

use meridian_cluster::RegionInfo;
use meridian_server::rpc::RequestHeader;
use meridian_server::{PdServer, PdService};
use meridian_store::{CoordKv, MemStore};
use meridian_types::config::PdConfig;
use meridian_types::{
    Peer, RegionEpoch, RegionMeta, StoreId, StoreLabel, StoreMeta, StoreState,
};
use tokio::sync::watch;

/// A config with sane test defaults.
pub fn pd_config(name: &str) -> PdConfig {
    PdConfig {
        name: name.to_string(),
        client_urls: vec![format!("mock://{name}")],
        ..Default::default()
    }
}

/// A request header for the given cluster.
pub fn header(cluster_id: u64) -> RequestHeader {
    RequestHeader { cluster_id }
}

/// An Up store with a mock address.
pub fn store_meta(id: StoreId, labels: &[(&str, &str)]) -> StoreMeta {
    StoreMeta {
        id,
        address: format!("mock://s:{id}"),
        version: "1.0.0".to_string(),
        state: StoreState::Up,
        labels: labels
            .iter()
            .map(|(k, v)| StoreLabel {
                key: k.to_string(),
                value: v.to_string(),
            })
            .collect(),
        ..Default::default()
    }
}

/// Region metadata with voter peers `(peer_id, store_id)`.
pub fn region_meta(id: u64, epoch: (u64, u64), peers: &[(u64, StoreId)]) -> RegionMeta {
    RegionMeta {
        id,
        epoch: RegionEpoch::new(epoch.0, epoch.1),
        peers: peers.iter().map(|(p, s)| Peer::voter(*p, *s)).collect(),
        ..Default::default()
    }
}

/// A region led from its first peer, covering `[start, end)`.
pub fn region_info(
    id: u64,
    epoch: (u64, u64),
    peers: &[(u64, StoreId)],
    start: &[u8],
    end: &[u8],
) -> RegionInfo {
    let mut meta = region_meta(id, epoch, peers);
    meta.start_key = start.to_vec();
    meta.end_key = end.to_vec();
    RegionInfo {
        leader: meta.peers.first().cloned(),
        meta,
        ..Default::default()
    }
}

/// Polls `cond` for up to five seconds.
pub async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// One in-process PD replica with its election loop running.
pub struct TestPd {
    pub kv: Arc<dyn CoordKv>,
    pub server: Arc<PdServer>,
    pub service: PdService,
    shutdown: watch::Sender<bool>,
}

impl TestPd {
    /// Starts a replica over a fresh Coordination Store.
    pub fn start(name: &str) -> Self {
        Self::start_on(Arc::new(MemStore::new()) as Arc<dyn CoordKv>, name)
    }

    /// Starts a replica sharing an existing Coordination Store.
    pub fn start_on(kv: Arc<dyn CoordKv>, name: &str) -> Self {
        let server = PdServer::new(Arc::clone(&kv), pd_config(name));
        let (shutdown, rx) = watch::channel(false);
        let replica = Arc::clone(&server);
        tokio::spawn(async move { replica.run(rx).await });
        Self {
            service: PdService::new(Arc::clone(&server)),
            server,
            kv,
            shutdown,
        }
    }

    /// Waits until this replica holds leadership.
    pub async fn wait_leader(&self) {
        let server = Arc::clone(&self.server);
        wait_for("leadership", move || server.is_leader()).await;
    }
}

impl Drop for TestPd {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
