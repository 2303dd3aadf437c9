// Path: crates/schedule/src/lib.rs
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

//! The scheduling engine: everything that decides how replicas should move.
//!
//! Checkers repair individual regions against the placement policy;
//! schedulers rebalance load across stores; both emit [`Operator`]s —
//! stepwise reconfiguration plans — which the operator controller admits
//! under per-store rate limits and drives to completion against the
//! heartbeat stream. The coordinator owns the loops that tie it together.
//!
//! Checkers and schedulers are closed trait-object sets registered at
//! startup; adding one means adding a type and a registration line.

pub mod checker;
pub mod coordinator;
pub mod idsource;
pub mod informer;
pub mod labeler;
pub mod operator;
pub mod placement;
pub mod scatter;
pub mod schedulers;
pub mod statistics;

pub use coordinator::Coordinator;
pub use idsource::{IdSource, ReplenishedIdPool, SequentialIds};
pub use informer::{ClusterInformer, SharedCluster};
pub use labeler::{LabelRule, RegionLabel, RegionLabeler};
pub use operator::{OpKind, OpPriority, OpStatus, OpStep, Operator, OperatorController, StepResponder};
pub use placement::{LabelConstraint, LabelConstraintOp, Rule, RuleManager, RuleRole};
pub use scatter::RegionScatterer;
pub use schedulers::{Scheduler, SchedulerController};
