// Path: crates/resource/src/lib.rs
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

//! The resource registries: per-keyspace GC safe points with TTL-bounded
//! service safe points, and the resource-group manager with its token
//! buckets and per-keyspace service limiters.

pub mod gc;
pub mod group;

pub use gc::{SafePointManager, ServiceSafePoint, GC_WORKER_SERVICE};
pub use group::{
    Consumption, GroupMode, GroupTokenBucket, ResourceGroup, ResourceGroupManager, ServiceLimiter,
};
