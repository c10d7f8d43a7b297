//! Host provider capability used by the pool manager.
//!
//! Pool-based drivers (docker) place instances on hosts the pool creates
//! through a [`HostProvider`]. The provider is the only place that talks
//! to the backend about hosts.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;

use berth_state::Host;

use crate::driver::DriverFuture;
use crate::error::DriverError;

/// What to create.
#[derive(Debug, Clone, PartialEq)]
pub struct HostSpec {
    /// Backend resource name.
    pub name: String,
    pub flavor: String,
    pub image: String,
}

/// A host the backend just created.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProvisionedHost {
    pub address: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

pub trait HostProvider: Send + Sync {
    fn create_host<'a>(&'a self, spec: &'a HostSpec) -> DriverFuture<'a, ProvisionedHost>;

    /// Make a freshly created host ready for placements.
    fn prepare_host<'a>(&'a self, host: &'a Host) -> DriverFuture<'a, ()>;

    /// Power on a host stopped for reuse.
    fn start_host<'a>(&'a self, host: &'a Host) -> DriverFuture<'a, ()>;

    /// Power off without releasing the backend resource.
    fn stop_host<'a>(&'a self, host: &'a Host) -> DriverFuture<'a, ()>;

    /// Release the backend resource. Succeeds if it is already gone.
    fn destroy_host<'a>(&'a self, host: &'a Host) -> DriverFuture<'a, ()>;
}

// ── Mock ──────────────────────────────────────────────────────────

#[derive(Default)]
struct MockHostState {
    next_address: u32,
    live: BTreeSet<String>,
    stopped: BTreeSet<String>,
    created: Vec<String>,
    destroyed: Vec<String>,
    prepared: Vec<String>,
    create_failures: VecDeque<DriverError>,
    prepare_failures: VecDeque<DriverError>,
}

/// In-memory host provider with scriptable failures.
#[derive(Default)]
pub struct MockHostProvider {
    state: Mutex<MockHostState>,
}

impl MockHostProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` create calls with a transient error.
    pub fn fail_creates(&self, n: usize) {
        self.with_state(|s| {
            for _ in 0..n {
                s.create_failures
                    .push_back(DriverError::Transient("backend API unavailable".into()));
            }
        });
    }

    /// Fail the next `n` prepare calls with a transient error.
    pub fn fail_prepares(&self, n: usize) {
        self.with_state(|s| {
            for _ in 0..n {
                s.prepare_failures
                    .push_back(DriverError::Transient("provisioning script failed".into()));
            }
        });
    }

    /// Names of hosts that exist at the backend, stopped ones included.
    pub fn live_hosts(&self) -> Vec<String> {
        self.with_state(|s| s.live.iter().cloned().collect())
    }

    pub fn stopped_hosts(&self) -> Vec<String> {
        self.with_state(|s| s.stopped.iter().cloned().collect())
    }

    pub fn created(&self) -> Vec<String> {
        self.with_state(|s| s.created.clone())
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.with_state(|s| s.destroyed.clone())
    }

    pub fn prepared(&self) -> Vec<String> {
        self.with_state(|s| s.prepared.clone())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockHostState) -> T) -> T {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }
}

impl HostProvider for MockHostProvider {
    fn create_host<'a>(&'a self, spec: &'a HostSpec) -> DriverFuture<'a, ProvisionedHost> {
        Box::pin(async move {
            self.with_state(|s| {
                if let Some(err) = s.create_failures.pop_front() {
                    return Err(err);
                }
                s.next_address += 1;
                s.live.insert(spec.name.clone());
                s.created.push(spec.name.clone());
                Ok(ProvisionedHost {
                    address: Some(format!("10.0.0.{}", s.next_address)),
                    metadata: BTreeMap::from([("flavor".to_string(), spec.flavor.clone())]),
                })
            })
        })
    }

    fn prepare_host<'a>(&'a self, host: &'a Host) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.with_state(|s| {
                if let Some(err) = s.prepare_failures.pop_front() {
                    return Err(err);
                }
                s.prepared.push(host.name.clone());
                Ok(())
            })
        })
    }

    fn start_host<'a>(&'a self, host: &'a Host) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.with_state(|s| {
                if !s.live.contains(&host.name) {
                    return Err(DriverError::InconsistentState(format!(
                        "host {} does not exist",
                        host.name
                    )));
                }
                s.stopped.remove(&host.name);
                Ok(())
            })
        })
    }

    fn stop_host<'a>(&'a self, host: &'a Host) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.with_state(|s| {
                s.stopped.insert(host.name.clone());
                Ok(())
            })
        })
    }

    fn destroy_host<'a>(&'a self, host: &'a Host) -> DriverFuture<'a, ()> {
        Box::pin(async move {
            self.with_state(|s| {
                if s.live.remove(&host.name) {
                    s.destroyed.push(host.name.clone());
                }
                s.stopped.remove(&host.name);
                Ok(())
            })
        })
    }
}
