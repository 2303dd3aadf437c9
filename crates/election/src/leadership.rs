// Path: crates/election/src/leadership.rs
//! Campaigning for and holding the lease-bound leader key.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use meridian_store::{Compare, CoordKv, LeaseId, Op, WatchEvent};
use meridian_types::{keys, PdError, Result};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::member::Member;

/// One replica's participation in the election for `service`.
///
/// The winner holds a lease-bound key at `elect/{service}/leader` whose
/// value is its [`Member`] identity. Losing the lease (Coordination Store
/// outage, process death) deletes the key and lets someone else win within
/// one lease period.
pub struct Leadership {
    kv: Arc<dyn CoordKv>,
    member: Member,
    leader_key: String,
    lease_ttl: Duration,
    lease: Mutex<Option<LeaseId>>,
    is_leader: AtomicBool,
}

impl Leadership {
    /// Builds a participant. Nothing happens until [`campaign`] is called.
    ///
    /// [`campaign`]: Leadership::campaign
    pub fn new(kv: Arc<dyn CoordKv>, service: &str, member: Member, lease_ttl: Duration) -> Self {
        Self {
            kv,
            member,
            leader_key: keys::election_leader_path(service),
            lease_ttl,
            lease: Mutex::new(None),
            is_leader: AtomicBool::new(false),
        }
    }

    /// This replica's identity.
    pub fn member(&self) -> &Member {
        &self.member
    }

    /// Whether this replica currently believes it is the leader.
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Attempts to win the election: create-if-absent of the leader key
    /// under a fresh lease. Returns whether we won.
    pub async fn campaign(&self) -> Result<bool> {
        let lease = self.kv.grant_lease(self.lease_ttl).await?;
        let outcome = self
            .kv
            .txn(
                vec![Compare::ValueEquals(self.leader_key.clone(), None)],
                vec![Op::Put {
                    key: self.leader_key.clone(),
                    value: self.member.to_bytes()?,
                    lease: Some(lease),
                }],
                vec![],
            )
            .await?;
        if outcome.succeeded {
            *self.lease.lock() = Some(lease);
            self.is_leader.store(true, Ordering::SeqCst);
            info!(target: "election", name = %self.member.name, key = %self.leader_key, "won election");
            Ok(true)
        } else {
            self.kv.revoke_lease(lease).await?;
            Ok(false)
        }
    }

    /// Reads the current leader's identity, if any.
    pub async fn current_leader(&self) -> Result<Option<Member>> {
        match self.kv.load(&self.leader_key).await? {
            Some(bytes) => Ok(Some(Member::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Address of the current leader, for `NotLeader` redirects.
    pub async fn leader_addr(&self) -> Result<Option<String>> {
        Ok(self
            .current_leader()
            .await?
            .and_then(|m| m.primary_url().map(|s| s.to_string())))
    }

    /// Steps down deliberately: deletes the key and revokes the lease.
    pub async fn resign(&self) -> Result<()> {
        let lease = self.lease.lock().take();
        self.is_leader.store(false, Ordering::SeqCst);
        if let Some(lease) = lease {
            self.kv.remove(&self.leader_key).await?;
            self.kv.revoke_lease(lease).await?;
            info!(target: "election", name = %self.member.name, "resigned leadership");
        }
        Ok(())
    }

    /// Marks leadership lost without touching the store (the lease already
    /// lapsed or someone else owns the key).
    pub fn mark_lost(&self) {
        *self.lease.lock() = None;
        self.is_leader.store(false, Ordering::SeqCst);
    }

    /// Spawns the keep-alive loop for the held lease. The returned channel
    /// flips to `true` when the lease can no longer be refreshed, at which
    /// point leadership must be treated as lost.
    pub fn spawn_keep_alive(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> watch::Receiver<bool> {
        let (expired_tx, expired_rx) = watch::channel(false);
        let this = Arc::clone(self);
        let lease = *this.lease.lock();
        tokio::spawn(async move {
            let Some(lease) = lease else {
                let _ = expired_tx.send(true);
                return;
            };
            let period = this.lease_ttl / 3;
            let mut tick = tokio::time::interval(period);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Refreshes must land within one TTL; two consecutive failures
            // with a ttl/3 period means the window is about to close.
            let mut failures = 0u32;
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        match this.kv.keep_alive(lease).await {
                            Ok(()) => failures = 0,
                            Err(e) => {
                                failures += 1;
                                warn!(target: "election", error = %e, failures, "lease keep-alive failed");
                                if failures >= 2 {
                                    this.mark_lost();
                                    let _ = expired_tx.send(true);
                                    return;
                                }
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
        expired_rx
    }

    /// Blocks until the leader key is deleted or rewritten, i.e. until the
    /// current leadership (ours or someone else's) ends.
    pub async fn wait_leader_change(&self) -> Result<()> {
        let current = self.kv.load(&self.leader_key).await?;
        let rev = self.kv.current_revision().await?;
        // Watching from rev + 1 replays anything that lands between the
        // read above and the watch registration.
        let mut rx = self.kv.watch(&self.leader_key, rev + 1).await?;
        if current.is_none() {
            return Ok(());
        }
        loop {
            match rx.recv().await {
                Some(WatchEvent::Delete { .. }) => return Ok(()),
                Some(WatchEvent::Put(kv)) => {
                    if Some(&kv.value) != current.as_ref() {
                        return Ok(());
                    }
                }
                None => {
                    return Err(PdError::Unavailable(
                        "leader watch disconnected".to_string(),
                    ))
                }
            }
        }
    }
}
