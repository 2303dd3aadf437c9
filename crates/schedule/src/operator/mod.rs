// Path: crates/schedule/src/operator/mod.rs
//! Operators: stepwise region reconfiguration plans and their lifecycle.

pub mod controller;
pub mod limit;
pub mod op;
pub mod step;

pub use controller::{OperatorController, StepResponder};
pub use limit::{LimitType, StoreLimiters};
pub use op::{OpCheck, OpKind, OpPriority, OpStatus, Operator};
pub use step::OpStep;
