//! No-op driver for tests and local development.
//!
//! Keeps a table of "backend resources" in memory. Failures, status
//! answers and latency can be injected, and the driver tracks how many
//! operations overlap so tests can check the per-instance serialization
//! guarantee of the dispatch queue.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use crate::driver::{
    BackendStatus, Driver, DriverContext, DriverFuture, ProvisionOutcome, ReconfigureParams,
};
use crate::error::{DriverError, DriverResult};

/// Call counters and overlap statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DummyStats {
    pub provision_calls: u32,
    pub deprovision_calls: u32,
    pub status_calls: u32,
    pub reconfigure_calls: u32,
    /// Highest number of operations running at once across all instances.
    pub peak_concurrency: u32,
    /// Times an operation started while another one for the same instance
    /// was still running.
    pub overlapping_calls: u32,
}

#[derive(Default)]
struct DummyState {
    resources: HashMap<String, BackendStatus>,
    status_overrides: HashMap<String, BackendStatus>,
    pending_probes: HashMap<String, u32>,
    provision_failures: VecDeque<DriverError>,
    deprovision_failures: VecDeque<DriverError>,
    active: HashMap<String, u32>,
    active_total: u32,
    stats: DummyStats,
}

pub struct DummyDriver {
    pooled: bool,
    delay: Option<Duration>,
    pending_after_provision: u32,
    state: Mutex<DummyState>,
}

impl Default for DummyDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyDriver {
    pub fn new() -> Self {
        Self {
            pooled: false,
            delay: None,
            pending_after_provision: 0,
            state: Mutex::new(DummyState::default()),
        }
    }

    /// A dummy driver that asks for a pool slot, like a container driver.
    pub fn pooled() -> Self {
        Self {
            pooled: true,
            ..Self::new()
        }
    }

    /// Sleep this long inside every provision and deprovision.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Answer `Pending` to the first `n` probes after each provision.
    pub fn with_pending_probes(mut self, n: u32) -> Self {
        self.pending_after_provision = n;
        self
    }

    pub fn fail_next_provision(&self, err: DriverError) {
        self.with_state(|s| s.provision_failures.push_back(err));
    }

    pub fn fail_next_deprovision(&self, err: DriverError) {
        self.with_state(|s| s.deprovision_failures.push_back(err));
    }

    /// Force `query_status` answers for an instance id.
    pub fn set_status(&self, instance_id: &str, status: BackendStatus) {
        self.with_state(|s| {
            s.status_overrides.insert(instance_id.to_string(), status);
        });
    }

    pub fn clear_status(&self, instance_id: &str) {
        self.with_state(|s| {
            s.status_overrides.remove(instance_id);
        });
    }

    pub fn has_resource(&self, instance_id: &str) -> bool {
        self.with_state(|s| s.resources.contains_key(instance_id))
    }

    pub fn resource_count(&self) -> usize {
        self.with_state(|s| s.resources.len())
    }

    pub fn stats(&self) -> DummyStats {
        self.with_state(|s| s.stats.clone())
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut DummyState) -> T) -> T {
        let mut guard = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(&mut guard)
    }

    fn enter(&self, instance_id: &str) -> ActiveGuard<'_> {
        self.with_state(|s| {
            let count = s.active.entry(instance_id.to_string()).or_insert(0);
            if *count > 0 {
                s.stats.overlapping_calls += 1;
            }
            *count += 1;
            s.active_total += 1;
            s.stats.peak_concurrency = s.stats.peak_concurrency.max(s.active_total);
        });
        ActiveGuard {
            driver: self,
            instance_id: instance_id.to_string(),
        }
    }

    async fn pause(&self) {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
    }

    async fn do_provision(&self, ctx: &DriverContext) -> DriverResult<ProvisionOutcome> {
        let id = ctx.instance.id.as_str();
        let _active = self.enter(id);
        ctx.log.info(&format!("dummy provisioning {}", ctx.instance.name));
        self.pause().await;

        self.with_state(|s| {
            s.stats.provision_calls += 1;
            if let Some(err) = s.provision_failures.pop_front() {
                return Err(err);
            }
            s.resources.insert(id.to_string(), BackendStatus::Running);
            s.pending_probes
                .insert(id.to_string(), self.pending_after_provision);
            Ok(())
        })?;

        debug!(instance_id = %id, "dummy resource allocated");
        ctx.log.info(&format!("dummy instance {} is up", ctx.instance.name));
        let address = ctx
            .host
            .as_ref()
            .and_then(|h| h.address.clone())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        Ok(ProvisionOutcome::default().with("address", address))
    }

    async fn do_deprovision(&self, ctx: &DriverContext) -> DriverResult<()> {
        let id = ctx.instance.id.as_str();
        let _active = self.enter(id);
        ctx.log.info(&format!("dummy deprovisioning {}", ctx.instance.name));
        self.pause().await;

        self.with_state(|s| {
            s.stats.deprovision_calls += 1;
            if let Some(err) = s.deprovision_failures.pop_front() {
                return Err(err);
            }
            s.resources.remove(id);
            s.pending_probes.remove(id);
            Ok(())
        })
    }

    fn do_query_status(&self, ctx: &DriverContext) -> BackendStatus {
        let id = ctx.instance.id.as_str();
        self.with_state(|s| {
            s.stats.status_calls += 1;
            if let Some(status) = s.status_overrides.get(id) {
                return *status;
            }
            match s.resources.get(id) {
                None => BackendStatus::NotFound,
                Some(status) => match s.pending_probes.get_mut(id) {
                    Some(n) if *n > 0 => {
                        *n -= 1;
                        BackendStatus::Pending
                    }
                    _ => *status,
                },
            }
        })
    }
}

struct ActiveGuard<'a> {
    driver: &'a DummyDriver,
    instance_id: String,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.driver.with_state(|s| {
            if let Some(count) = s.active.get_mut(&self.instance_id) {
                *count = count.saturating_sub(1);
            }
            s.active_total = s.active_total.saturating_sub(1);
        });
    }
}

impl Driver for DummyDriver {
    fn name(&self) -> &'static str {
        "dummy"
    }

    fn uses_host_pool(&self) -> bool {
        self.pooled
    }

    fn provision<'a>(&'a self, ctx: &'a DriverContext) -> DriverFuture<'a, ProvisionOutcome> {
        Box::pin(self.do_provision(ctx))
    }

    fn deprovision<'a>(&'a self, ctx: &'a DriverContext) -> DriverFuture<'a, ()> {
        Box::pin(self.do_deprovision(ctx))
    }

    fn query_status<'a>(&'a self, ctx: &'a DriverContext) -> DriverFuture<'a, BackendStatus> {
        Box::pin(async move { Ok(self.do_query_status(ctx)) })
    }

    fn reconfigure<'a>(
        &'a self,
        ctx: &'a DriverContext,
        params: &'a ReconfigureParams,
    ) -> DriverFuture<'a, ProvisionOutcome> {
        Box::pin(async move {
            let _active = self.enter(&ctx.instance.id);
            self.with_state(|s| s.stats.reconfigure_calls += 1);
            ctx.log
                .info(&format!("dummy reconfiguring {} with {params:?}", ctx.instance.name));
            let mut outcome = ProvisionOutcome::default();
            for (key, value) in params {
                outcome.metadata.insert(format!("config.{key}"), value.clone());
            }
            Ok(outcome)
        })
    }
}
