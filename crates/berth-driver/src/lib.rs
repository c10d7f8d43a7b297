//! berth-driver: the driver capability interface and its backends.
//!
//! # Architecture
//!
//! ```text
//!                       ┌──────────────────┐
//!  lifecycle engine ──► │  DriverRegistry  │  name → Arc<dyn Driver>
//!                       └────────┬─────────┘
//!          ┌──────────────┬──────┴───────┬───────────────┐
//!          ▼              ▼              ▼               ▼
//!       dummy          docker        openstack       kubernetes
//!     (in-memory)   (pool hosts)       (VMs)           (pods)
//!                        │               │               │
//!                        └───── CommandRunner (berth-process) ─────┘
//!
//!  pool manager ──► HostProvider (OpenStackHostProvider / MockHostProvider)
//! ```
//!
//! Drivers receive a [`DriverContext`] per call carrying the instance
//! record, its blueprint, the placed host (pool-based drivers only), the
//! [`CredentialStore`] and a per-instance [`InstanceLogSink`]. Failures are
//! classified into [`DriverError`] variants; backend-specific output
//! parsing stays inside each driver module.

pub mod credentials;
pub mod driver;
pub mod drivers;
pub mod error;
pub mod host;
pub mod registry;
pub mod testing;

pub use credentials::{
    CredentialError, CredentialStore, FileCredentialStore, Secret, StaticCredentialStore,
};
pub use driver::{
    BackendStatus, CommandLog, Driver, DriverContext, DriverFuture, InstanceLogSink,
    MemoryLogSink, NullLogSink, ProvisionOutcome, ReconfigureParams,
};
pub use error::{DriverError, DriverResult};
pub use host::{HostProvider, HostSpec, MockHostProvider, ProvisionedHost};
pub use registry::{DriverRegistry, RegistryError, KNOWN_DRIVERS};
