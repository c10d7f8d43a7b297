//! berth-process: logged process runner.
//!
//! Drivers shell out to backend CLIs (`docker`, `openstack`, `kubectl`)
//! and host preparation scripts through [`CommandRunner`]. The production
//! runner, [`ProcessRunner`], guarantees the child is terminated on every
//! exit path:
//!
//! ```text
//!  spawn ──► read stdout+stderr into bounded buffer ──► wait
//!    │                                                   │
//!    │            timeout fires ──► kill ──► ProcessError::Timeout
//!    │
//!    └── future dropped (cancellation) ──► kill_on_drop
//! ```
//!
//! A non-zero exit is not an error: it is reported through
//! [`ProcessOutput::success`]. Only spawn failures and timeouts are errors.
//! Every finished command can be reported to a [`CommandSink`] for audit.

pub mod command;
pub mod runner;

pub use command::{CommandRecord, CommandSink, CommandSpec, ProcessOutput};
pub use runner::{CommandRunner, ProcessError, ProcessRunner, RunFuture, DEFAULT_MAX_OUTPUT};
