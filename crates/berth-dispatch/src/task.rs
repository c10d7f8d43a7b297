//! Units of work admitted to the dispatch queue.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use berth_core::InstanceId;
use tokio::time::Instant;

/// What to do to an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Provision,
    Deprovision,
    /// Health probe or stuck check for one instance.
    CheckStatus,
    Reconfigure(BTreeMap<String, String>),
    /// Clean up a failed instance and provision it again.
    Respawn,
    /// Operator-requested respawn, outside the automatic respawn budget.
    Retry,
    /// Move an instance that stopped making progress to failed.
    ForceFail(String),
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Provision => "provision",
            Operation::Deprovision => "deprovision",
            Operation::CheckStatus => "check_status",
            Operation::Reconfigure(_) => "reconfigure",
            Operation::Respawn => "respawn",
            Operation::Retry => "retry",
            Operation::ForceFail(_) => "force_fail",
        }
    }

    pub fn is_deprovision(&self) -> bool {
        matches!(self, Operation::Deprovision)
    }

    /// Operations that bring backend resources into existence.
    pub fn is_provisioning(&self) -> bool {
        matches!(
            self,
            Operation::Provision | Operation::Respawn | Operation::Retry
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An admitted task.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    /// Admission sequence number; lower runs first.
    pub seq: u64,
    pub instance_id: InstanceId,
    pub op: Operation,
    /// Earliest time the task may start.
    pub not_before: Instant,
    /// How many times this task was handed back for another run.
    pub requeues: u32,
}

/// What a handler wants done with a finished task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Done,
    /// Run `op` again for the same instance after `delay`.
    Requeue { op: Operation, delay: Duration },
}

impl TaskOutcome {
    pub fn requeue(op: Operation, delay: Duration) -> Self {
        TaskOutcome::Requeue { op, delay }
    }
}

/// Result of submitting a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Queued(u64),
    /// An equivalent task is already waiting; it was kept.
    Duplicate(u64),
    /// A deprovision for the instance is already waiting, so provisioning
    /// work is pointless.
    Superseded,
}
