//! berth-lifecycle: instance state machine, provisioning engine and the
//! request-layer API.
//!
//! # Architecture
//!
//! ```text
//!  create / delete / status / retry / reconfigure
//!                 │
//!           ┌─────▼────────┐  submit   ┌───────────────┐
//!           │ Orchestrator ├──────────►│ DispatchQueue │◄──── Monitor (probe, stuck,
//!           └──────────────┘           └──────┬────────┘       max lifetime, recovery)
//!                                             │ WorkerPool
//!                                      ┌──────▼──────┐
//!                                      │   Engine    │──► Driver (registry)
//!                                      └──┬───────┬──┘
//!                      CAS on instance    │       │  reserve / release slots
//!                      records            ▼       ▼
//!                                  StateStore   HostPool
//! ```
//!
//! The engine is the only writer of instance state. The dispatch queue
//! guarantees one task per instance at a time, so per-instance ordering
//! needs no extra lock; the store's compare-and-swap catches writers in
//! other processes.

pub mod clock;
pub mod engine;
pub mod error;
pub mod logs;
pub mod machine;
pub mod monitor;
pub mod orchestrator;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::Engine;
pub use error::{LifecycleError, LifecycleResult};
pub use logs::StoreLogSink;
pub use machine::{can_transition, transition};
pub use monitor::{Monitor, SweepReport};
pub use orchestrator::{InstanceStatus, Orchestrator, OrchestratorBuilder};
