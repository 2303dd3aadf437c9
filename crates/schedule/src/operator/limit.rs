// Path: crates/schedule/src/operator/limit.rs
//! Per-store admission rate limits.
//!
//! One token bucket per `(store, direction)`. Buckets refill continuously
//! at the configured per-minute rate and hold at most one minute of
//! tokens. Unlimited mode (used when draining an offline store) bypasses
//! the bucket entirely.

use std::time::Instant;

use ahash::AHashMap;
use meridian_types::StoreId;
use parking_lot::Mutex;

/// Which direction of peer movement a bucket governs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitType {
    AddPeer,
    RemovePeer,
}

#[derive(Debug)]
struct Bucket {
    rate_per_min: f64,
    available: f64,
    last_refill: Instant,
    unlimited: bool,
}

impl Bucket {
    fn new(rate_per_min: f64) -> Self {
        Self {
            rate_per_min,
            available: rate_per_min,
            last_refill: Instant::now(),
            unlimited: false,
        }
    }

    fn refill(&mut self) {
        let elapsed = self.last_refill.elapsed().as_secs_f64();
        self.last_refill = Instant::now();
        self.available =
            (self.available + elapsed * self.rate_per_min / 60.0).min(self.rate_per_min);
    }

    fn take(&mut self, cost: f64) -> bool {
        if self.unlimited {
            return true;
        }
        self.refill();
        if self.available >= cost {
            self.available -= cost;
            true
        } else {
            false
        }
    }
}

/// The table of per-store buckets.
pub struct StoreLimiters {
    default_add_per_min: f64,
    default_remove_per_min: f64,
    buckets: Mutex<AHashMap<(StoreId, LimitType), Bucket>>,
}

impl StoreLimiters {
    pub fn new(default_add_per_min: f64, default_remove_per_min: f64) -> Self {
        Self {
            default_add_per_min,
            default_remove_per_min,
            buckets: Mutex::new(AHashMap::new()),
        }
    }

    fn default_rate(&self, kind: LimitType) -> f64 {
        match kind {
            LimitType::AddPeer => self.default_add_per_min,
            LimitType::RemovePeer => self.default_remove_per_min,
        }
    }

    /// Attempts to take `cost` tokens for every `(store, kind, cost)` in
    /// one shot; nothing is consumed unless everything fits.
    pub fn take_all(&self, costs: &[(StoreId, LimitType, f64)]) -> bool {
        let mut buckets = self.buckets.lock();
        // Dry run first so a partial grant never leaks tokens.
        for (store, kind, cost) in costs {
            let bucket = buckets
                .entry((*store, *kind))
                .or_insert_with(|| Bucket::new(self.default_rate(*kind)));
            bucket.refill();
            if !bucket.unlimited && bucket.available < *cost {
                return false;
            }
        }
        for (store, kind, cost) in costs {
            if let Some(bucket) = buckets.get_mut(&(*store, *kind)) {
                if !bucket.unlimited {
                    bucket.available -= cost;
                }
            }
        }
        true
    }

    /// Overrides one bucket's rate.
    pub fn set_rate(&self, store: StoreId, kind: LimitType, rate_per_min: f64) {
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry((store, kind))
            .or_insert_with(|| Bucket::new(rate_per_min));
        bucket.rate_per_min = rate_per_min;
        bucket.available = bucket.available.min(rate_per_min);
    }

    /// Switches a store's buckets in or out of unlimited mode.
    pub fn set_unlimited(&self, store: StoreId, unlimited: bool) {
        let mut buckets = self.buckets.lock();
        for kind in [LimitType::AddPeer, LimitType::RemovePeer] {
            buckets
                .entry((store, kind))
                .or_insert_with(|| Bucket::new(self.default_rate(kind)))
                .unlimited = unlimited;
        }
    }
}
