//! berth-dispatch: admission and scheduling of instance operations.
//!
//! ```text
//!  create / delete / monitor ──► DispatchQueue ──► WorkerPool (N workers) ──► TaskHandler
//!                                   ▲                                             │
//!                                   └──────────── TaskOutcome::Requeue ◄──────────┘
//! ```
//!
//! Guarantees:
//!
//! - at most one task per instance runs at a time
//! - at most N tasks run at all
//! - tasks are served first-admitted, first-served; a task that cannot run
//!   yet stays queued and is looked at again on the next pass
//! - a deprovision cancels queued provisioning work for its instance, and
//!   provisioning work arriving after it is superseded

pub mod error;
pub mod queue;
pub mod task;
pub mod worker;

pub use error::{DispatchError, DispatchResult};
pub use queue::{DispatchQueue, QueueStats};
pub use task::{Admission, Operation, Task, TaskOutcome};
pub use worker::{CrashBackoff, HandlerFuture, TaskHandler, WorkerPool};
