// Path: crates/election/src/primary.rs
//! The expected-primary flag.
//!
//! A freshly elected leader claims the flag at
//! `elect/{service}/primary/expected` under a short lease and then guards
//! it: the moment the flag names someone else, or vanishes because the
//! lease lapsed, the guard signals and the leader abdicates. An operator
//! triggers a graceful handoff by rewriting the flag to the chosen
//! replica's name.

use std::sync::Arc;
use std::time::Duration;

use meridian_store::{CoordKv, LeaseId, Op, WatchEvent};
use meridian_types::{keys, Result};
use tokio::sync::watch;
use tracing::{info, warn};

/// Reads the currently expected primary's name, if the flag is set.
pub async fn expected_primary(kv: &dyn CoordKv, service: &str) -> Result<Option<String>> {
    Ok(kv
        .load(&keys::expected_primary_path(service))
        .await?
        .map(|b| String::from_utf8_lossy(&b).into_owned()))
}

/// Claims the flag for `name` under a fresh short lease. Called right
/// after winning the election.
pub async fn claim_expected_primary(
    kv: &dyn CoordKv,
    service: &str,
    name: &str,
    ttl: Duration,
) -> Result<LeaseId> {
    let lease = kv.grant_lease(ttl).await?;
    kv.txn(
        vec![],
        vec![Op::Put {
            key: keys::expected_primary_path(service),
            value: name.as_bytes().to_vec(),
            lease: Some(lease),
        }],
        vec![],
    )
    .await?;
    Ok(lease)
}

/// Operator-initiated graceful handoff: rewrite the flag to `target`. The
/// incumbent's guard notices and abdicates; `target` wins the re-election
/// and re-claims the flag under its own lease.
pub async fn transfer_expected_primary(
    kv: &dyn CoordKv,
    service: &str,
    target: &str,
) -> Result<()> {
    kv.save(
        &keys::expected_primary_path(service),
        target.as_bytes().to_vec(),
    )
    .await?;
    info!(target: "election", %target, "expected primary transferred");
    Ok(())
}

/// Background guard over a claimed flag.
pub struct PrimaryGuard {
    /// Flips to `true` when the holder must abdicate.
    pub abdicate: watch::Receiver<bool>,
}

impl PrimaryGuard {
    /// Spawns the guard: keep-alives the flag's lease and watches the flag
    /// for reassignment or expiry.
    pub fn spawn(
        kv: Arc<dyn CoordKv>,
        service: &str,
        my_name: String,
        lease: LeaseId,
        ttl: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (abdicate_tx, abdicate_rx) = watch::channel(false);
        let flag_key = keys::expected_primary_path(service);
        tokio::spawn(async move {
            let mut rx = match kv.watch(&flag_key, 0).await {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(target: "election", error = %e, "expected-primary watch failed");
                    let _ = abdicate_tx.send(true);
                    return;
                }
            };
            let mut tick = tokio::time::interval(ttl / 3);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if kv.keep_alive(lease).await.is_err() {
                            warn!(target: "election", "expected-primary lease lost");
                            let _ = abdicate_tx.send(true);
                            return;
                        }
                    }
                    event = rx.recv() => {
                        match event {
                            Some(WatchEvent::Put(kv_pair)) => {
                                if kv_pair.value != my_name.as_bytes() {
                                    info!(
                                        target: "election",
                                        new = %String::from_utf8_lossy(&kv_pair.value),
                                        "expected primary changed, abdicating"
                                    );
                                    let _ = abdicate_tx.send(true);
                                    return;
                                }
                            }
                            Some(WatchEvent::Delete { .. }) | None => {
                                warn!(target: "election", "expected-primary flag gone, abdicating");
                                let _ = abdicate_tx.send(true);
                                return;
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
        Self {
            abdicate: abdicate_rx,
        }
    }
}
