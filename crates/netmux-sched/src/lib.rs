//! Cooperative, priority-weighted task scheduling.
//!
//! A fixed pool of [`Worker`] threads is bound to named [`WorkerGroup`]s;
//! each worker repeatedly picks the most significant group, takes its most
//! significant ready task and runs it to completion. Significance is
//! `pending_tasks ^ priority_weight`, so high-priority, low-volume groups
//! (handshakes) neither starve nor are starved by bulk I/O groups, and no
//! connection or channel ever needs its own OS thread.
//!
//! Tasks come in four shapes (simple, timed, repeatable, timed-repeatable)
//! expressed as one [`TaskSpec`] with optional interval and repetition
//! count; groups and workers never branch on the shape.

pub mod boss;
pub mod error;
pub mod group;
pub mod task;
pub mod worker;

pub use boss::WorkerBoss;
pub use error::{Result, SchedError};
pub use group::WorkerGroup;
pub use task::{Priority, TaskContext, TaskId, TaskSpec};
pub use worker::{Worker, WorkerStatus};
