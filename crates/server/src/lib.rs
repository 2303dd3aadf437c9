// Path: crates/server/src/lib.rs
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

//! The Meridian server: every subsystem composed behind the election.
//!
//! A replica runs the election loop forever; whichever replica holds the
//! leader key runs the scheduling engine, the TSO, the ID allocator, and
//! the write paths, while the rest serve redirects and mirror region
//! state through the synchronizer. The RPC surface is a typed service
//! layer — the wire protocol that would wrap it is out of scope.

pub mod rpc;
pub mod server;
pub mod streams;

pub use rpc::PdService;
pub use server::{PdServer, ServerHooks};
pub use streams::HeartbeatStreams;
