// Path: crates/schedule/src/idsource.rs
//! Peer-ID supply for checkers and schedulers.
//!
//! Repair logic runs synchronously inside the patrol loop, but IDs come
//! from the async durable allocator. The bridge is a pre-charged pool the
//! coordinator tops up from the allocator between ticks; a dry pool just
//! defers the repair to the next tick.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

/// Hands out cluster-unique peer IDs, or `None` when the pool is dry.
pub trait IdSource: Send + Sync {
    fn alloc_peer_id(&self) -> Option<u64>;
}

/// Pool refilled in batches from the durable ID allocator.
pub struct ReplenishedIdPool {
    low_water: usize,
    pool: Mutex<VecDeque<u64>>,
}

impl ReplenishedIdPool {
    pub fn new(low_water: usize) -> Self {
        Self {
            low_water,
            pool: Mutex::new(VecDeque::new()),
        }
    }

    /// Whether the owner should fetch another batch.
    pub fn needs_refill(&self) -> bool {
        self.pool.lock().len() < self.low_water
    }

    /// Adds `count` consecutive IDs starting at `base`.
    pub fn refill_with(&self, base: u64, count: u64) {
        let mut pool = self.pool.lock();
        for id in base..base + count {
            pool.push_back(id);
        }
    }

    pub fn len(&self) -> usize {
        self.pool.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.lock().is_empty()
    }
}

impl IdSource for ReplenishedIdPool {
    fn alloc_peer_id(&self) -> Option<u64> {
        self.pool.lock().pop_front()
    }
}

/// Monotonic in-process IDs for tests.
pub struct SequentialIds(AtomicU64);

impl SequentialIds {
    pub fn starting_at(first: u64) -> Self {
        Self(AtomicU64::new(first))
    }
}

impl IdSource for SequentialIds {
    fn alloc_peer_id(&self) -> Option<u64> {
        Some(self.0.fetch_add(1, Ordering::SeqCst))
    }
}
