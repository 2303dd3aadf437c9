// Path: crates/alloc/src/lib.rs
#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::unimplemented,
        clippy::todo,
        clippy::indexing_slicing
    )
)]

//! Cluster-unique 64-bit ID allocation.
//!
//! IDs are reserved in durable batches: the allocator CASes the persisted
//! batch end forward by `step` and hands IDs out of memory until the batch
//! runs dry. A new primary starts from the persisted end, so a failover
//! wastes at most one batch but can never reuse an ID.

use std::sync::Arc;

use meridian_store::{Compare, CoordKv, Op};
use meridian_types::{codec, keys, PdError, Result};
use tokio::sync::Mutex;
use tracing::info;

/// Default batch size.
pub const DEFAULT_ALLOC_STEP: u64 = 1000;

#[derive(Debug, Default, Clone, Copy)]
struct Batch {
    /// Next ID to hand out.
    base: u64,
    /// Exclusive end of the reserved range; `base == end` means empty.
    end: u64,
}

/// The batched ID allocator. One instance lives on the primary; followers
/// do not allocate.
pub struct IdAllocator {
    kv: Arc<dyn CoordKv>,
    step: u64,
    batch: Mutex<Batch>,
}

impl IdAllocator {
    /// Builds an allocator with the default step.
    pub fn new(kv: Arc<dyn CoordKv>) -> Self {
        Self::with_step(kv, DEFAULT_ALLOC_STEP)
    }

    /// Builds an allocator with a custom batch size.
    pub fn with_step(kv: Arc<dyn CoordKv>, step: u64) -> Self {
        Self {
            kv,
            step,
            batch: Mutex::new(Batch::default()),
        }
    }

    /// Allocates up to `n` consecutive IDs, returning `(first, count)`.
    /// `count` can be less than `n` when the batch boundary intervenes;
    /// callers loop if they need the rest.
    pub async fn alloc(&self, n: u64) -> Result<(u64, u64)> {
        if n == 0 {
            return Err(PdError::InvalidInput("alloc count must be >= 1".into()));
        }
        let mut batch = self.batch.lock().await;
        if batch.base == batch.end {
            *batch = self.reserve().await?;
        }
        let first = batch.base;
        let count = n.min(batch.end - batch.base);
        batch.base += count;
        Ok((first, count))
    }

    /// Convenience for the single-ID case.
    pub async fn alloc_one(&self) -> Result<u64> {
        let (id, _) = self.alloc(1).await?;
        Ok(id)
    }

    /// Drops the in-memory batch. Called on step-down; the persisted end
    /// stays put, so the next reservation starts past everything ever
    /// handed out.
    pub async fn reset(&self) {
        *self.batch.lock().await = Batch::default();
    }

    /// Reserves the next batch: CAS the persisted end from its current
    /// value to current + step.
    async fn reserve(&self) -> Result<Batch> {
        loop {
            let current = self.kv.load(keys::ALLOC_ID).await?;
            // ID 0 is reserved as "unset" throughout the data model.
            let base = match &current {
                Some(bytes) => codec::u64_from_be_bytes(bytes)?,
                None => 1,
            };
            let end = base
                .checked_add(self.step)
                .ok_or_else(|| PdError::Internal("id space exhausted".into()))?;
            let outcome = self
                .kv
                .txn(
                    vec![Compare::ValueEquals(keys::ALLOC_ID.to_string(), current)],
                    vec![Op::Put {
                        key: keys::ALLOC_ID.to_string(),
                        value: codec::u64_to_be_bytes(end),
                        lease: None,
                    }],
                    vec![],
                )
                .await?;
            if outcome.succeeded {
                info!(target: "alloc", base, end, "reserved id batch");
                return Ok(Batch { base, end });
            }
            // Someone else moved the end; re-read and try again.
        }
    }
}
