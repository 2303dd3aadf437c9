// Path: crates/store/src/txn.rs
//! Read-then-compare transactions over the Coordination Store.
//!
//! A [`TxnSession`] records every value read through it; at commit, each
//! read becomes an equality-on-value precondition, so the writes apply only
//! if nothing read has changed since. [`run_in_txn`] wraps a session body
//! with the bounded conflict-retry policy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use meridian_types::{PdError, Result};
use tracing::warn;

use crate::kv::{Compare, CoordKv, Op};

/// How many times a conflicting transaction body is re-run with fresh
/// reads before the conflict surfaces to the caller.
pub const MAX_TXN_RETRIES: usize = 3;

const SLOW_COMMIT_THRESHOLD: Duration = Duration::from_secs(1);

/// Monitoring hook invoked for commits slower than one second. Slow
/// commits are surfaced, never failed.
pub type SlowCommitHook = Arc<dyn Fn(Duration) + Send + Sync>;

/// One optimistic transaction attempt.
pub struct TxnSession {
    kv: Arc<dyn CoordKv>,
    reads: Vec<(String, Option<Vec<u8>>)>,
    writes: Vec<Op>,
    slow_hook: Option<SlowCommitHook>,
}

impl TxnSession {
    /// Opens a session against `kv`.
    pub fn new(kv: Arc<dyn CoordKv>) -> Self {
        Self {
            kv,
            reads: Vec::new(),
            writes: Vec::new(),
            slow_hook: None,
        }
    }

    /// Installs the slow-commit monitoring hook.
    pub fn with_slow_hook(mut self, hook: SlowCommitHook) -> Self {
        self.slow_hook = Some(hook);
        self
    }

    /// Reads a key and records it as a commit precondition.
    pub async fn load(&mut self, key: &str) -> Result<Option<Vec<u8>>> {
        let value = self.kv.load(key).await?;
        self.reads.push((key.to_string(), value.clone()));
        Ok(value)
    }

    /// Queues a write.
    pub fn put(&mut self, key: &str, value: Vec<u8>) {
        self.writes.push(Op::Put {
            key: key.to_string(),
            value,
            lease: None,
        });
    }

    /// Queues a deletion.
    pub fn delete(&mut self, key: &str) {
        self.writes.push(Op::Delete {
            key: key.to_string(),
        });
    }

    /// Commits: all queued writes apply iff every recorded read still holds.
    pub async fn commit(self) -> Result<u64> {
        let conds: Vec<Compare> = self
            .reads
            .into_iter()
            .map(|(k, v)| Compare::ValueEquals(k, v))
            .collect();
        let started = Instant::now();
        let outcome = self.kv.txn(conds, self.writes, Vec::new()).await?;
        let elapsed = started.elapsed();
        if elapsed > SLOW_COMMIT_THRESHOLD {
            warn!(target: "store", elapsed_ms = elapsed.as_millis() as u64, "slow txn commit");
            if let Some(hook) = &self.slow_hook {
                hook(elapsed);
            }
        }
        if outcome.succeeded {
            Ok(outcome.revision)
        } else {
            Err(PdError::TxnConflict)
        }
    }
}

/// Runs `body` as a read-then-compare transaction, retrying conflicts with
/// fresh reads up to [`MAX_TXN_RETRIES`] times.
pub async fn run_in_txn<T, F>(kv: Arc<dyn CoordKv>, mut body: F) -> Result<T>
where
    F: for<'s> FnMut(&'s mut TxnSession) -> BoxFuture<'s, Result<T>>,
{
    let mut last_err = PdError::TxnConflict;
    for _ in 0..MAX_TXN_RETRIES {
        let mut session = TxnSession::new(Arc::clone(&kv));
        let value = body(&mut session).await?;
        match session.commit().await {
            Ok(_) => return Ok(value),
            Err(PdError::TxnConflict) => {
                last_err = PdError::TxnConflict;
                continue;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemStore;
    use futures::FutureExt;

    #[tokio::test]
    async fn commit_fails_when_a_read_changed() {
        let store: Arc<dyn CoordKv> = Arc::new(MemStore::new());
        store.save("k", b"v1".to_vec()).await.unwrap();

        let mut session = TxnSession::new(Arc::clone(&store));
        assert_eq!(session.load("k").await.unwrap(), Some(b"v1".to_vec()));
        session.put("k", b"v2".to_vec());

        // Interfering writer commits between the read and the commit.
        store.save("k", b"interloper".to_vec()).await.unwrap();

        assert_eq!(session.commit().await.unwrap_err(), PdError::TxnConflict);
        assert_eq!(store.load("k").await.unwrap(), Some(b"interloper".to_vec()));
    }

    #[tokio::test]
    async fn absence_reads_are_preconditions_too() {
        let store: Arc<dyn CoordKv> = Arc::new(MemStore::new());
        let mut session = TxnSession::new(Arc::clone(&store));
        assert_eq!(session.load("missing").await.unwrap(), None);
        session.put("missing", b"claimed".to_vec());
        store.save("missing", b"raced".to_vec()).await.unwrap();
        assert_eq!(session.commit().await.unwrap_err(), PdError::TxnConflict);
    }

    #[tokio::test]
    async fn run_in_txn_retries_with_fresh_reads() {
        let store: Arc<dyn CoordKv> = Arc::new(MemStore::new());
        store.save("counter", b"0".to_vec()).await.unwrap();

        // Two sequential increments; the second sees the first's write.
        for _ in 0..2 {
            run_in_txn(Arc::clone(&store), |session| {
                async move {
                    let cur = session
                        .load("counter")
                        .await?
                        .and_then(|v| String::from_utf8(v).ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .unwrap_or(0);
                    session.put("counter", (cur + 1).to_string().into_bytes());
                    Ok(())
                }
                .boxed()
            })
            .await
            .unwrap();
        }
        assert_eq!(store.load("counter").await.unwrap(), Some(b"2".to_vec()));
    }
}
