// Path: crates/store/src/kv.rs
//! The Coordination Store contract.

use std::time::Duration;

use async_trait::async_trait;
use meridian_types::Result;
use tokio::sync::mpsc;

/// Identifier of a granted lease.
pub type LeaseId = u64;

/// A key-value pair with the revision that last modified it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub mod_revision: u64,
}

/// An event delivered to a watcher. Events arrive strictly in revision
/// order per watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A key was created or overwritten.
    Put(KeyValue),
    /// A key was removed (explicitly or by lease expiry).
    Delete { key: String, revision: u64 },
}

impl WatchEvent {
    /// The key the event concerns.
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Put(kv) => &kv.key,
            WatchEvent::Delete { key, .. } => key,
        }
    }

    /// The revision at which the event was committed.
    pub fn revision(&self) -> u64 {
        match self {
            WatchEvent::Put(kv) => kv.mod_revision,
            WatchEvent::Delete { revision, .. } => *revision,
        }
    }
}

/// A transaction precondition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compare {
    /// The key's value equals the given one; `None` asserts absence.
    ValueEquals(String, Option<Vec<u8>>),
    /// The key's mod revision equals the given one.
    ModRevisionEquals(String, u64),
}

/// A transaction mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Write `value` under `key`, optionally bound to a lease.
    Put {
        key: String,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    },
    /// Remove `key`.
    Delete { key: String },
}

/// Result of a transaction: which branch applied and at what revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnOutcome {
    pub succeeded: bool,
    pub revision: u64,
}

/// The strongly-consistent store everything persistent sits on.
///
/// Implementations must apply each transaction atomically, assign strictly
/// increasing revisions to mutations, and deliver watch events in revision
/// order. Watchers that fall behind may be disconnected; callers
/// re-establish from the last revision they saw.
#[async_trait]
pub trait CoordKv: Send + Sync {
    /// Reads one key.
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Reads keys in `[start, end)`, at most `limit` (0 means unlimited),
    /// in key order.
    async fn load_range(&self, start: &str, end: &str, limit: usize) -> Result<Vec<KeyValue>>;

    /// Writes one key unconditionally.
    async fn save(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Removes one key unconditionally.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Atomically checks every condition and applies `then_ops` if all
    /// hold, `else_ops` otherwise.
    async fn txn(
        &self,
        conds: Vec<Compare>,
        then_ops: Vec<Op>,
        else_ops: Vec<Op>,
    ) -> Result<TxnOutcome>;

    /// Opens a watch on `prefix` starting at `from_revision` (0 means "from
    /// now"). Buffered events at or after the revision are replayed first.
    async fn watch(&self, prefix: &str, from_revision: u64) -> Result<mpsc::Receiver<WatchEvent>>;

    /// Grants a lease. Keys put with the lease vanish when it expires.
    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// Refreshes a lease's deadline to now + its TTL.
    async fn keep_alive(&self, lease: LeaseId) -> Result<()>;

    /// Revokes a lease, deleting every key bound to it.
    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// The store's current revision.
    async fn current_revision(&self) -> Result<u64>;
}
