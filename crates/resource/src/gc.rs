// Path: crates/resource/src/gc.rs
//! GC safe points.
//!
//! Every keyspace carries one global GC safe point and any number of
//! service safe points with TTLs. The global point may only advance, and
//! never past the minimum live service point; expired service points are
//! swept lazily on read, so a crashed service stops holding GC back after
//! its TTL.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use meridian_store::CoordKv;
use meridian_types::{codec, keys, KeyspaceId, PdError, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

/// The distinguished GC owner: infinite TTL, cannot be removed.
pub const GC_WORKER_SERVICE: &str = "gc_worker";

const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One service's hold on GC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSafePoint {
    pub service_id: String,
    pub safe_point: u64,
    /// Unix seconds; `u64::MAX` means never.
    pub expired_at: u64,
}

impl ServiceSafePoint {
    fn is_expired(&self, now: u64) -> bool {
        self.expired_at != u64::MAX && self.expired_at <= now
    }
}

/// The safe-point registry, all state persisted in the Coordination Store.
pub struct SafePointManager {
    kv: Arc<dyn CoordKv>,
}

impl SafePointManager {
    pub fn new(kv: Arc<dyn CoordKv>) -> Self {
        Self { kv }
    }

    /// The keyspace's GC safe point, 0 when never set.
    pub async fn gc_safe_point(&self, keyspace: KeyspaceId) -> Result<u64> {
        match self.kv.load(&keys::gc_safe_point_path(keyspace)).await? {
            Some(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                codec::u64_from_hex(&text)
            }
            None => Ok(0),
        }
    }

    /// Advances the GC safe point. Rejects regressions and anything above
    /// the minimum live service safe point.
    pub async fn update_gc_safe_point(&self, keyspace: KeyspaceId, new_point: u64) -> Result<u64> {
        let current = self.gc_safe_point(keyspace).await?;
        if new_point < current {
            return Err(PdError::InvalidInput(format!(
                "gc safe point regresses: {new_point} < {current}"
            )));
        }
        let services = self.live_service_safe_points(keyspace).await?;
        if let Some(min) = services.iter().map(|s| s.safe_point).min() {
            if new_point > min {
                return Err(PdError::InvalidInput(format!(
                    "gc safe point {new_point} exceeds the minimum service safe point {min}"
                )));
            }
        }
        self.kv
            .save(
                &keys::gc_safe_point_path(keyspace),
                codec::u64_to_hex(new_point).into_bytes(),
            )
            .await?;
        info!(target: "gc", keyspace, new_point, "gc safe point advanced");
        Ok(new_point)
    }

    /// Registers or refreshes one service's safe point, returning the
    /// minimum across all live services afterwards.
    ///
    /// A service may never drag its own point below the global GC safe
    /// point. `ttl_secs` of `u64::MAX` pins the point forever; a TTL of 0
    /// removes it (except for `gc_worker`, which is permanent).
    pub async fn update_service_gc_safe_point(
        &self,
        keyspace: KeyspaceId,
        service_id: &str,
        ttl_secs: u64,
        safe_point: u64,
    ) -> Result<u64> {
        if service_id.is_empty() {
            return Err(PdError::InvalidInput("service id must not be empty".into()));
        }
        if ttl_secs == 0 {
            if service_id == GC_WORKER_SERVICE {
                return Err(PdError::InvalidInput(
                    "the gc_worker service safe point cannot be removed".into(),
                ));
            }
            self.kv
                .remove(&keys::service_safe_point_path(keyspace, service_id))
                .await?;
            return self.min_service_safe_point(keyspace).await;
        }
        let global = self.gc_safe_point(keyspace).await?;
        if safe_point < global {
            return Err(PdError::InvalidInput(format!(
                "service safe point {safe_point} is below the gc safe point {global}"
            )));
        }
        let expired_at = if ttl_secs == u64::MAX || service_id == GC_WORKER_SERVICE {
            u64::MAX
        } else {
            unix_now().saturating_add(ttl_secs)
        };
        let record = ServiceSafePoint {
            service_id: service_id.to_string(),
            safe_point,
            expired_at,
        };
        self.kv
            .save(
                &keys::service_safe_point_path(keyspace, service_id),
                codec::to_json_bytes(&record)?,
            )
            .await?;
        self.min_service_safe_point(keyspace).await
    }

    /// Minimum across live service safe points; `u64::MAX` with none.
    pub async fn min_service_safe_point(&self, keyspace: KeyspaceId) -> Result<u64> {
        Ok(self
            .live_service_safe_points(keyspace)
            .await?
            .iter()
            .map(|s| s.safe_point)
            .min()
            .unwrap_or(u64::MAX))
    }

    /// Loads service safe points, sweeping expired ones as it goes.
    pub async fn live_service_safe_points(
        &self,
        keyspace: KeyspaceId,
    ) -> Result<Vec<ServiceSafePoint>> {
        let prefix = keys::service_safe_point_prefix(keyspace);
        let end = keys::range_end_of_prefix(&prefix);
        let now = unix_now();
        let mut live = Vec::new();
        for kv in self.kv.load_range(&prefix, &end, 0).await? {
            let record: ServiceSafePoint = codec::from_json_bytes(&kv.value)?;
            if record.is_expired(now) {
                warn!(target: "gc", keyspace, service = %record.service_id, "expired service safe point swept");
                self.kv.remove(&kv.key).await?;
            } else {
                live.push(record);
            }
        }
        Ok(live)
    }

    /// Periodic sweep so expired points vanish even without reads.
    pub fn spawn_expiry_loop(
        self: &Arc<Self>,
        keyspaces: Vec<KeyspaceId>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        for keyspace in &keyspaces {
                            if let Err(e) = manager.live_service_safe_points(*keyspace).await {
                                warn!(target: "gc", keyspace = *keyspace, error = %e, "safe point sweep failed");
                            }
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
    use meridian_types::DEFAULT_KEYSPACE_ID as KS;

    fn manager() -> SafePointManager {
        SafePointManager::new(Arc::new(MemStore::new()) as Arc<dyn CoordKv>)
    }

    #[tokio::test]
    async fn gc_point_is_bounded_by_the_service_minimum() {
        let m = manager();
        m.update_service_gc_safe_point(KS, "a", 60, 100).await.unwrap();
        let min = m.update_service_gc_safe_point(KS, "b", 60, 80).await.unwrap();
        assert_eq!(min, 80);

        assert!(m.update_gc_safe_point(KS, 90).await.is_err());
        assert_eq!(m.update_gc_safe_point(KS, 80).await.unwrap(), 80);
        assert_eq!(m.gc_safe_point(KS).await.unwrap(), 80);
    }

    #[tokio::test]
    async fn gc_point_never_regresses() {
        let m = manager();
        m.update_service_gc_safe_point(KS, "a", 60, 100).await.unwrap();
        m.update_gc_safe_point(KS, 50).await.unwrap();
        assert!(m.update_gc_safe_point(KS, 40).await.is_err());
        assert_eq!(m.gc_safe_point(KS).await.unwrap(), 50);
    }

    #[tokio::test]
    async fn expired_service_points_stop_binding() {
        let m = manager();
        m.update_service_gc_safe_point(KS, "a", 60, 100).await.unwrap();
        // Service b with an already-expired TTL: swept on next read.
        let record = ServiceSafePoint {
            service_id: "b".to_string(),
            safe_point: 80,
            expired_at: 1,
        };
        m.kv
            .save(
                &keys::service_safe_point_path(KS, "b"),
                codec::to_json_bytes(&record).unwrap(),
            )
            .await
            .unwrap();
        // b has expired, so c and then a bound the minimum.
        m.update_service_gc_safe_point(KS, "c", 60, 120).await.unwrap();
        assert_eq!(m.update_gc_safe_point(KS, 100).await.unwrap(), 100);
    }

    #[tokio::test]
    async fn own_point_may_not_drop_below_global() {
        let m = manager();
        m.update_service_gc_safe_point(KS, "a", 60, 100).await.unwrap();
        m.update_gc_safe_point(KS, 90).await.unwrap();
        assert!(m
            .update_service_gc_safe_point(KS, "a", 60, 50)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn gc_worker_is_permanent() {
        let m = manager();
        m.update_service_gc_safe_point(KS, GC_WORKER_SERVICE, 1, 100)
            .await
            .unwrap();
        assert!(m
            .update_service_gc_safe_point(KS, GC_WORKER_SERVICE, 0, 0)
            .await
            .is_err());
        let live = m.live_service_safe_points(KS).await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].expired_at, u64::MAX);
    }

    #[tokio::test]
    async fn keyspaces_are_independent() {
        let m = manager();
        m.update_service_gc_safe_point(0, "a", 60, 10).await.unwrap();
        m.update_service_gc_safe_point(7, "a", 60, 100).await.unwrap();
        m.update_gc_safe_point(7, 100).await.unwrap();
        assert_eq!(m.gc_safe_point(0).await.unwrap(), 0);
        assert_eq!(m.gc_safe_point(7).await.unwrap(), 100);
    }
}
