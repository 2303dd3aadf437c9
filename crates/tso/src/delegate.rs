// Path: crates/tso/src/delegate.rs
//! Dynamic delegation of timestamp allocation.
//!
//! Specialized TSO replicas register themselves under a discovery prefix.
//! When any are present and dynamic switching is enabled, the primary
//! forwards `get_ts` to them; when they all deregister, the primary takes
//! allocation back within one switch interval.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meridian_store::CoordKv;
use meridian_types::{keys, Result, Timestamp};
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::oracle::TimestampOracle;

/// Anything that can answer a timestamp request.
#[async_trait]
pub trait TsoProvider: Send + Sync {
    /// Allocates `count` timestamps, returning the last of the range.
    async fn get_ts(&self, count: u64) -> Result<Timestamp>;
}

#[async_trait]
impl TsoProvider for TimestampOracle {
    async fn get_ts(&self, count: u64) -> Result<Timestamp> {
        TimestampOracle::get_ts(self, count).await
    }
}

/// Opens a connection to a registered TSO replica. The transport is out of
/// scope here; deployments supply the real client, tests supply stubs.
pub trait TsoConnector: Send + Sync {
    /// Connects to the replica advertised at `addr`.
    fn connect(&self, addr: &str) -> Result<Arc<dyn TsoProvider>>;
}

/// Registration surface for specialized TSO replicas.
pub struct TsoRegistry {
    kv: Arc<dyn CoordKv>,
}

impl TsoRegistry {
    pub fn new(kv: Arc<dyn CoordKv>) -> Self {
        Self { kv }
    }

    /// Registers a replica by its advertised address.
    pub async fn register(&self, addr: &str) -> Result<()> {
        self.kv
            .save(&keys::tso_discovery_path(addr), addr.as_bytes().to_vec())
            .await
    }

    /// Removes a replica's registration.
    pub async fn deregister(&self, addr: &str) -> Result<()> {
        self.kv.remove(&keys::tso_discovery_path(addr)).await
    }

    /// Addresses of all registered replicas, in registration-key order.
    pub async fn list(&self) -> Result<Vec<String>> {
        let end = keys::range_end_of_prefix(keys::TSO_DISCOVERY_PREFIX);
        let kvs = self
            .kv
            .load_range(keys::TSO_DISCOVERY_PREFIX, &end, 0)
            .await?;
        Ok(kvs
            .into_iter()
            .map(|kv| String::from_utf8_lossy(&kv.value).into_owned())
            .collect())
    }
}

/// Routes `get_ts` to the local oracle or a delegated replica.
pub struct TsoDispatcher {
    local: Arc<TimestampOracle>,
    registry: TsoRegistry,
    connector: Arc<dyn TsoConnector>,
    dynamic_switching: bool,
    switch_interval: Duration,
    delegate: RwLock<Option<(String, Arc<dyn TsoProvider>)>>,
}

impl TsoDispatcher {
    pub fn new(
        local: Arc<TimestampOracle>,
        kv: Arc<dyn CoordKv>,
        connector: Arc<dyn TsoConnector>,
        dynamic_switching: bool,
        switch_interval: Duration,
    ) -> Self {
        Self {
            local,
            registry: TsoRegistry::new(kv),
            connector,
            dynamic_switching,
            switch_interval,
            delegate: RwLock::new(None),
        }
    }

    /// Serves a timestamp request from whichever allocator is active.
    pub async fn get_ts(&self, count: u64) -> Result<Timestamp> {
        let delegate = self.delegate.read().as_ref().map(|(_, p)| Arc::clone(p));
        match delegate {
            Some(provider) => provider.get_ts(count).await,
            None => self.local.get_ts(count).await,
        }
    }

    /// Whether allocation is currently delegated.
    pub fn is_delegated(&self) -> bool {
        self.delegate.read().is_some()
    }

    /// One pass of the discovery check; factored out of the loop for
    /// deterministic tests.
    pub async fn check_delegation(&self) -> Result<()> {
        if !self.dynamic_switching {
            return Ok(());
        }
        let registered = self.registry.list().await?;
        let current = self.delegate.read().as_ref().map(|(addr, _)| addr.clone());
        match registered.first() {
            Some(addr) => {
                if current.as_deref() != Some(addr.as_str()) {
                    match self.connector.connect(addr) {
                        Ok(provider) => {
                            info!(target: "tso", %addr, "delegating timestamp allocation");
                            *self.delegate.write() = Some((addr.clone(), provider));
                        }
                        Err(e) => {
                            warn!(target: "tso", %addr, error = %e, "tso delegate unreachable");
                        }
                    }
                }
            }
            None => {
                if current.is_some() {
                    info!(target: "tso", "no tso replicas registered, resuming local allocation");
                    *self.delegate.write() = None;
                }
            }
        }
        Ok(())
    }

    /// Spawns the switch loop.
    pub fn spawn_switch_loop(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(dispatcher.switch_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = dispatcher.check_delegation().await {
                            warn!(target: "tso", error = %e, "delegation discovery failed");
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

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_store::MemStore;
    use meridian_types::PdError;

    struct FixedProvider(Timestamp);

    #[async_trait]
    impl TsoProvider for FixedProvider {
        async fn get_ts(&self, _count: u64) -> Result<Timestamp> {
            Ok(self.0)
        }
    }

    struct StubConnector;

    impl TsoConnector for StubConnector {
        fn connect(&self, _addr: &str) -> Result<Arc<dyn TsoProvider>> {
            Ok(Arc::new(FixedProvider(Timestamp::new(42, 7))))
        }
    }

    fn dispatcher(store: &Arc<MemStore>, dynamic: bool) -> Arc<TsoDispatcher> {
        let kv = Arc::clone(store) as Arc<dyn CoordKv>;
        let local = Arc::new(TimestampOracle::new(
            Arc::clone(&kv),
            Duration::from_millis(3000),
            Duration::from_millis(50),
        ));
        Arc::new(TsoDispatcher::new(
            local,
            kv,
            Arc::new(StubConnector),
            dynamic,
            Duration::from_millis(10),
        ))
    }

    #[tokio::test]
    async fn switches_to_registered_replica_and_back() {
        let store = Arc::new(MemStore::new());
        let d = dispatcher(&store, true);
        let registry = TsoRegistry::new(Arc::clone(&store) as Arc<dyn CoordKv>);

        d.check_delegation().await.unwrap();
        assert!(!d.is_delegated());

        registry.register("tso-1:4000").await.unwrap();
        d.check_delegation().await.unwrap();
        assert!(d.is_delegated());
        assert_eq!(d.get_ts(1).await.unwrap(), Timestamp::new(42, 7));

        registry.deregister("tso-1:4000").await.unwrap();
        d.check_delegation().await.unwrap();
        assert!(!d.is_delegated());
    }

    #[tokio::test]
    async fn static_mode_never_delegates() {
        let store = Arc::new(MemStore::new());
        let d = dispatcher(&store, false);
        let registry = TsoRegistry::new(Arc::clone(&store) as Arc<dyn CoordKv>);
        registry.register("tso-1:4000").await.unwrap();
        d.check_delegation().await.unwrap();
        assert!(!d.is_delegated());
        // Local oracle is not synced, so the request surfaces NotLeader
        // rather than silently delegating.
        assert!(matches!(
            d.get_ts(1).await.unwrap_err(),
            PdError::NotLeader { .. }
        ));
    }
}
