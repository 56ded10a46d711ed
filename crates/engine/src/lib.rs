//! The cloudsync reconciliation engine.
//!
//! Each cycle lists both replicas into a [`Snapshot`], [`diff`]s it against
//! the previous one, [`decide`]s at most one [`Action`] per changed path and
//! hands the batch to the [`Executor`]. The [`Syncer`] repeats that forever.

mod diff;
mod engine;
pub mod error;
mod execute;
pub mod identity;
mod reconcile;
mod snapshot;

pub use crate::diff::{Change, DiffEntry, Side, diff};
pub use crate::engine::{LoopState, Syncer};
pub use crate::execute::{ExecutionReport, Executor, FailurePolicy, Outcome, SkipReason, Trash};
pub use crate::reconcile::{Action, decide, plan};
pub use crate::snapshot::Snapshot;
