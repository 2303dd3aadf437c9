// Path: crates/tso/src/oracle.rs
//! The timestamp allocator itself.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use meridian_store::CoordKv;
use meridian_types::timestamp::{LOGICAL_BITS, MAX_LOGICAL};
use meridian_types::{codec, keys, PdError, Result, Timestamp};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Retries of `get_ts` against logical-counter exhaustion before giving up.
const GET_TS_MAX_RETRIES: u32 = 100;
/// Logical watermark past which the update loop persists early.
const LOGICAL_RESAVE_THRESHOLD: u64 = MAX_LOGICAL / 2;

/// Injectable wall clock, milliseconds since the epoch.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

fn system_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, Copy)]
struct TsoState {
    physical_ms: u64,
    logical: u64,
    /// End of the persisted safe window; `physical_ms` never reaches it.
    saved_end_ms: u64,
}

/// The timestamp oracle. Initialized on winning leadership, reset on
/// step-down; `get_ts` on an uninitialized oracle answers `NotLeader`.
pub struct TimestampOracle {
    kv: Arc<dyn CoordKv>,
    key: String,
    save_ahead: Duration,
    update_interval: Duration,
    clock: Clock,
    state: Mutex<Option<TsoState>>,
}

impl TimestampOracle {
    /// Builds the oracle for the default timestamp group.
    pub fn new(kv: Arc<dyn CoordKv>, save_ahead: Duration, update_interval: Duration) -> Self {
        Self::with_clock(
            kv,
            keys::DEFAULT_TSO_GROUP,
            save_ahead,
            update_interval,
            Arc::new(system_now_ms),
        )
    }

    /// Builds the oracle with an explicit group and clock. Tests inject a
    /// controlled clock here.
    pub fn with_clock(
        kv: Arc<dyn CoordKv>,
        group: &str,
        save_ahead: Duration,
        update_interval: Duration,
        clock: Clock,
    ) -> Self {
        Self {
            kv,
            key: keys::timestamp_path(group),
            save_ahead,
            update_interval,
            clock,
            state: Mutex::new(None),
        }
    }

    /// Whether the oracle is initialized and serving.
    pub fn is_ready(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Initializes the oracle on a fresh primary term: start strictly past
    /// everything the previous term could have issued, then persist the new
    /// window before serving a single timestamp.
    pub async fn sync_timestamp(&self) -> Result<()> {
        let saved_end = self.load_saved_end().await?;
        let now = (self.clock)();
        let next = now.max(saved_end);
        if next > now {
            warn!(
                target: "tso",
                saved_end, now,
                "wall clock is behind the persisted window, starting from the window end"
            );
        }
        let new_end = next + self.save_ahead.as_millis() as u64;
        self.persist_end(new_end).await?;
        *self.state.lock() = Some(TsoState {
            physical_ms: next,
            logical: 0,
            saved_end_ms: new_end,
        });
        info!(target: "tso", physical_ms = next, window_end_ms = new_end, "timestamp oracle synced");
        Ok(())
    }

    /// One tick of the physical-clock maintenance loop.
    ///
    /// Advances the physical clock toward wall time and re-persists the
    /// window when the margin thins or the logical counter runs hot. An
    /// error here is fatal to the term: the caller resets and steps down.
    pub async fn update_physical(&self) -> Result<()> {
        let now = (self.clock)();
        // Decide under the lock, persist outside it.
        let persist_target = {
            let mut guard = self.state.lock();
            let Some(state) = guard.as_mut() else {
                return Ok(());
            };
            if now > state.physical_ms && now < state.saved_end_ms {
                state.physical_ms = now;
                state.logical = 0;
            }
            let margin = state.saved_end_ms.saturating_sub(state.physical_ms);
            let need_resave = margin < self.save_ahead.as_millis() as u64 / 2
                || state.logical > LOGICAL_RESAVE_THRESHOLD
                || now >= state.saved_end_ms;
            need_resave.then(|| now.max(state.physical_ms) + self.save_ahead.as_millis() as u64)
        };
        if let Some(new_end) = persist_target {
            self.persist_end(new_end).await?;
            let mut guard = self.state.lock();
            if let Some(state) = guard.as_mut() {
                state.saved_end_ms = new_end;
                // With the window extended the clock may now catch up.
                if now > state.physical_ms {
                    state.physical_ms = now;
                    state.logical = 0;
                }
            }
        }
        Ok(())
    }

    /// Allocates `count` timestamps, returning the last of the range.
    ///
    /// Waits out logical-counter exhaustion by yielding until the update
    /// loop ticks the physical clock forward.
    pub async fn get_ts(&self, count: u64) -> Result<Timestamp> {
        if count == 0 {
            return Err(PdError::InvalidInput("timestamp count must be >= 1".into()));
        }
        if count > MAX_LOGICAL {
            return Err(PdError::InvalidInput(format!(
                "timestamp count {count} exceeds 2^{LOGICAL_BITS} - 1"
            )));
        }
        for _ in 0..GET_TS_MAX_RETRIES {
            {
                let mut guard = self.state.lock();
                let Some(state) = guard.as_mut() else {
                    return Err(PdError::NotLeader { leader: None });
                };
                if state.logical + count <= MAX_LOGICAL {
                    state.logical += count;
                    return Ok(Timestamp::new(state.physical_ms, state.logical));
                }
            }
            // Logical space exhausted inside this millisecond; wait for the
            // physical tick.
            tokio::time::sleep(self.update_interval / 2).await;
        }
        Err(PdError::Internal(
            "logical clock exhausted and physical clock did not advance".into(),
        ))
    }

    /// Forgets all in-memory state. The persisted window stays, which is
    /// exactly what keeps the next primary strictly ahead.
    pub fn reset(&self) {
        *self.state.lock() = None;
        info!(target: "tso", "timestamp oracle reset");
    }

    /// Spawns the maintenance loop. The returned channel flips to `true`
    /// if persisting fails, signalling the server to step down.
    pub fn spawn_update_loop(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> watch::Receiver<bool> {
        let (failed_tx, failed_rx) = watch::channel(false);
        let oracle = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(oracle.update_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = oracle.update_physical().await {
                            error!(target: "tso", error = %e, "physical clock update failed");
                            oracle.reset();
                            let _ = failed_tx.send(true);
                            return;
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
        failed_rx
    }

    /// The persisted window end, for tests and diagnostics.
    pub async fn load_saved_end(&self) -> Result<u64> {
        match self.kv.load(&self.key).await? {
            Some(bytes) => Ok(codec::u64_from_be_bytes(&bytes)? >> LOGICAL_BITS),
            None => Ok(0),
        }
    }

    async fn persist_end(&self, end_ms: u64) -> Result<()> {
        self.kv
            .save(&self.key, codec::u64_to_be_bytes(end_ms << LOGICAL_BITS))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_store::MemStore;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn oracle_with_clock(store: &Arc<MemStore>, start_ms: u64) -> (Arc<TimestampOracle>, Arc<AtomicU64>) {
        let now = Arc::new(AtomicU64::new(start_ms));
        let handle = Arc::clone(&now);
        let clock: Clock = Arc::new(move || handle.load(Ordering::SeqCst));
        let oracle = TimestampOracle::with_clock(
            Arc::clone(store) as Arc<dyn CoordKv>,
            keys::DEFAULT_TSO_GROUP,
            Duration::from_millis(3000),
            Duration::from_millis(50),
            clock,
        );
        (Arc::new(oracle), now)
    }

    #[tokio::test]
    async fn timestamps_increase_within_a_term() {
        let store = Arc::new(MemStore::new());
        let (oracle, _) = oracle_with_clock(&store, 1000);
        oracle.sync_timestamp().await.unwrap();
        let mut last = 0u64;
        for _ in 0..100 {
            let ts = oracle.get_ts(1).await.unwrap().into_u64();
            assert!(ts > last);
            last = ts;
        }
    }

    #[tokio::test]
    async fn uninitialized_oracle_is_not_leader() {
        let store = Arc::new(MemStore::new());
        let (oracle, _) = oracle_with_clock(&store, 1000);
        assert!(matches!(
            oracle.get_ts(1).await.unwrap_err(),
            PdError::NotLeader { .. }
        ));
    }

    #[tokio::test]
    async fn failover_starts_past_the_saved_window() {
        let store = Arc::new(MemStore::new());
        let (a, _) = oracle_with_clock(&store, 1000);
        a.sync_timestamp().await.unwrap();
        let t1 = a.get_ts(1).await.unwrap();
        a.reset();

        // The new primary's wall clock is *behind* the old one's.
        let (b, _) = oracle_with_clock(&store, 500);
        b.sync_timestamp().await.unwrap();
        let t2 = b.get_ts(1).await.unwrap();
        assert!(t2.into_u64() > t1.into_u64());
        // The window end floor: 1000 + 3000 from A's sync.
        assert!(t2.physical >= 4000);
    }

    #[tokio::test]
    async fn physical_advance_resets_logical() {
        let store = Arc::new(MemStore::new());
        let (oracle, now) = oracle_with_clock(&store, 1000);
        oracle.sync_timestamp().await.unwrap();
        let before = oracle.get_ts(10).await.unwrap();
        assert_eq!(before.logical, 10);
        now.store(1500, Ordering::SeqCst);
        oracle.update_physical().await.unwrap();
        let after = oracle.get_ts(1).await.unwrap();
        assert_eq!(after.physical, 1500);
        assert_eq!(after.logical, 1);
        assert!(after.into_u64() > before.into_u64());
    }

    #[tokio::test]
    async fn window_is_repersisted_before_it_thins_out() {
        let store = Arc::new(MemStore::new());
        let (oracle, now) = oracle_with_clock(&store, 1000);
        oracle.sync_timestamp().await.unwrap();
        assert_eq!(oracle.load_saved_end().await.unwrap(), 4000);
        // Clock marches to the middle of the window; the margin falls
        // below half the save-ahead and the loop extends it.
        now.store(2600, Ordering::SeqCst);
        oracle.update_physical().await.unwrap();
        assert_eq!(oracle.load_saved_end().await.unwrap(), 5600);
    }

    #[tokio::test]
    async fn get_ts_rejects_zero_and_oversized_counts() {
        let store = Arc::new(MemStore::new());
        let (oracle, _) = oracle_with_clock(&store, 1000);
        oracle.sync_timestamp().await.unwrap();
        assert!(oracle.get_ts(0).await.is_err());
        assert!(oracle.get_ts(MAX_LOGICAL + 1).await.is_err());
    }
}
