// Path: crates/store/src/mem.rs
//! In-process implementation of the Coordination Store contract.
//!
//! Single global revision counter, bounded event history for watch replay,
//! and a lease table swept by an optional background task. Semantics match
//! what an etcd-backed adapter provides, so the rest of the system cannot
//! tell the difference.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use meridian_types::{PdError, Result};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::kv::{Compare, CoordKv, KeyValue, LeaseId, Op, TxnOutcome, WatchEvent};

const WATCH_CHANNEL_CAPACITY: usize = 1024;
const EVENT_HISTORY_CAPACITY: usize = 4096;
const LEASE_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone)]
struct Entry {
    value: Vec<u8>,
    mod_revision: u64,
    lease: Option<LeaseId>,
}

struct LeaseRecord {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
}

struct Watcher {
    prefix: String,
    sender: mpsc::Sender<WatchEvent>,
}

#[derive(Default)]
struct Inner {
    revision: u64,
    data: BTreeMap<String, Entry>,
    history: VecDeque<WatchEvent>,
    watchers: Vec<Watcher>,
    leases: HashMap<LeaseId, LeaseRecord>,
    next_lease: LeaseId,
}

impl Inner {
    fn publish(&mut self, event: WatchEvent) {
        self.history.push_back(event.clone());
        if self.history.len() > EVENT_HISTORY_CAPACITY {
            self.history.pop_front();
        }
        // A watcher that cannot keep up is disconnected; its owner
        // re-establishes from the last revision it saw.
        self.watchers.retain(|w| {
            if !event.key().starts_with(&w.prefix) {
                return !w.sender.is_closed();
            }
            w.sender.try_send(event.clone()).is_ok()
        });
    }

    fn put(&mut self, key: String, value: Vec<u8>, lease: Option<LeaseId>) {
        self.revision += 1;
        if let Some(old) = self.data.get(&key) {
            if let Some(old_lease) = old.lease {
                if let Some(rec) = self.leases.get_mut(&old_lease) {
                    rec.keys.remove(&key);
                }
            }
        }
        if let Some(l) = lease {
            if let Some(rec) = self.leases.get_mut(&l) {
                rec.keys.insert(key.clone());
            }
        }
        let entry = Entry {
            value: value.clone(),
            mod_revision: self.revision,
            lease,
        };
        self.data.insert(key.clone(), entry);
        self.publish(WatchEvent::Put(KeyValue {
            key,
            value,
            mod_revision: self.revision,
        }));
    }

    fn delete(&mut self, key: &str) -> bool {
        match self.data.remove(key) {
            Some(entry) => {
                if let Some(l) = entry.lease {
                    if let Some(rec) = self.leases.get_mut(&l) {
                        rec.keys.remove(key);
                    }
                }
                self.revision += 1;
                self.publish(WatchEvent::Delete {
                    key: key.to_string(),
                    revision: self.revision,
                });
                true
            }
            None => false,
        }
    }

    fn check(&self, cond: &Compare) -> bool {
        match cond {
            Compare::ValueEquals(key, expected) => {
                let actual = self.data.get(key).map(|e| &e.value);
                match (actual, expected) {
                    (None, None) => true,
                    (Some(a), Some(e)) => a == e,
                    _ => false,
                }
            }
            Compare::ModRevisionEquals(key, rev) => {
                self.data.get(key).map(|e| e.mod_revision) == Some(*rev)
            }
        }
    }

    fn apply(&mut self, ops: Vec<Op>) {
        for op in ops {
            match op {
                Op::Put { key, value, lease } => self.put(key, value, lease),
                Op::Delete { key } => {
                    self.delete(&key);
                }
            }
        }
    }

    fn expire_leases(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, rec)| rec.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            self.drop_lease(id);
        }
    }

    fn drop_lease(&mut self, id: LeaseId) {
        if let Some(rec) = self.leases.remove(&id) {
            for key in rec.keys {
                self.delete(&key);
            }
        }
    }
}

/// The in-process Coordination Store.
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    /// An empty store at revision 0.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Spawns the lease sweeper. Without it leases only lapse via
    /// [`CoordKv::revoke_lease`], which tests use for determinism.
    pub fn start_lease_sweeper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(LEASE_SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        store.inner.lock().expire_leases(Instant::now());
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Test hook: advances lease expiry as if `now` had been reached.
    pub fn expire_leases_at(&self, now: Instant) {
        self.inner.lock().expire_leases(now);
    }
}

#[async_trait]
impl CoordKv for MemStore {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().data.get(key).map(|e| e.value.clone()))
    }

    async fn load_range(&self, start: &str, end: &str, limit: usize) -> Result<Vec<KeyValue>> {
        let inner = self.inner.lock();
        let iter = inner
            .data
            .range(start.to_string()..)
            .take_while(|(k, _)| end.is_empty() || k.as_str() < end)
            .map(|(k, e)| KeyValue {
                key: k.clone(),
                value: e.value.clone(),
                mod_revision: e.mod_revision,
            });
        Ok(if limit == 0 {
            iter.collect()
        } else {
            iter.take(limit).collect()
        })
    }

    async fn save(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.inner.lock().put(key.to_string(), value, None);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.inner.lock().delete(key);
        Ok(())
    }

    async fn txn(
        &self,
        conds: Vec<Compare>,
        then_ops: Vec<Op>,
        else_ops: Vec<Op>,
    ) -> Result<TxnOutcome> {
        let mut inner = self.inner.lock();
        let succeeded = conds.iter().all(|c| inner.check(c));
        inner.apply(if succeeded { then_ops } else { else_ops });
        Ok(TxnOutcome {
            succeeded,
            revision: inner.revision,
        })
    }

    async fn watch(&self, prefix: &str, from_revision: u64) -> Result<mpsc::Receiver<WatchEvent>> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let mut inner = self.inner.lock();
        if from_revision > 0 {
            for event in inner.history.iter() {
                if event.revision() >= from_revision && event.key().starts_with(prefix) {
                    tx.try_send(event.clone())
                        .map_err(|_| PdError::Unavailable("watch replay overflow".into()))?;
                }
            }
        }
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            sender: tx,
        });
        Ok(rx)
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        let mut inner = self.inner.lock();
        inner.next_lease += 1;
        let id = inner.next_lease;
        inner.leases.insert(
            id,
            LeaseRecord {
                ttl,
                deadline: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.leases.get_mut(&lease) {
            Some(rec) => {
                rec.deadline = Instant::now() + rec.ttl;
                Ok(())
            }
            None => Err(PdError::Unavailable(format!("lease {lease} not found"))),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.inner.lock().drop_lease(lease);
        Ok(())
    }

    async fn current_revision(&self) -> Result<u64> {
        Ok(self.inner.lock().revision)
    }
}
