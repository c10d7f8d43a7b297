//! The lifecycle engine: executes dispatch tasks against drivers and moves
//! instance records through the state machine.
//!
//! Every record write goes through [`Engine::update`], a compare-and-swap
//! loop on the instance version. The dispatch queue runs at most one task
//! per instance, so conflicts only come from other processes sharing the
//! store or from request-layer flag updates such as `deletion_requested`.

use std::sync::Arc;
use std::time::Duration;

use berth_core::BerthConfig;
use berth_dispatch::{
    Admission, DispatchQueue, HandlerFuture, Operation, Task, TaskHandler, TaskOutcome,
};
use berth_driver::{
    BackendStatus, CredentialStore, Driver, DriverContext, DriverError, DriverRegistry,
    InstanceLogSink, ProvisionOutcome, ReconfigureParams,
};
use berth_pool::{HostPool, Reservation};
use berth_state::{Blueprint, Host, Instance, InstanceState, LogLevel, LogType, StateStore};
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{LifecycleError, LifecycleResult};
use crate::logs::StoreLogSink;
use crate::machine::{awaits_provisioning, backoff, transition};

use InstanceState::*;

pub struct Engine {
    store: StateStore,
    registry: DriverRegistry,
    pool: Option<Arc<HostPool>>,
    queue: Arc<DispatchQueue>,
    credentials: Arc<dyn CredentialStore>,
    config: BerthConfig,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(
        store: StateStore,
        registry: DriverRegistry,
        queue: Arc<DispatchQueue>,
        credentials: Arc<dyn CredentialStore>,
        config: BerthConfig,
    ) -> Self {
        Self {
            store,
            registry,
            pool: None,
            queue,
            credentials,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Place pool-based driver instances on hosts from `pool`.
    pub fn with_pool(mut self, pool: Arc<HostPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    pub fn pool(&self) -> Option<&Arc<HostPool>> {
        self.pool.as_ref()
    }

    pub fn queue(&self) -> &Arc<DispatchQueue> {
        &self.queue
    }

    pub fn config(&self) -> &BerthConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn load(&self, id: &str) -> LifecycleResult<Instance> {
        self.store
            .get_instance(id)?
            .ok_or_else(|| LifecycleError::InstanceNotFound(id.to_string()))
    }

    /// Re-read `id`, apply `mutate` and write it back.
    ///
    /// `mutate` returns false to leave the record untouched, in which case
    /// `None` is returned. On a version conflict the record is re-read and
    /// `mutate` runs again on the fresh copy.
    pub fn update<F>(&self, id: &str, mut mutate: F) -> LifecycleResult<Option<Instance>>
    where
        F: FnMut(&mut Instance) -> bool,
    {
        loop {
            let current = self.load(id)?;
            let mut next = current.clone();
            if !mutate(&mut next) {
                return Ok(None);
            }
            match self.store.cas_instance(&next) {
                Ok(written) => {
                    if written.state != current.state {
                        info!(
                            instance_id = %id,
                            from = %current.state,
                            to = %written.state,
                            "instance state changed"
                        );
                    }
                    return Ok(Some(written));
                }
                Err(e) if e.is_conflict() => {
                    debug!(instance_id = %id, "instance record changed underneath, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Flag `id` for deletion and queue its deprovision.
    ///
    /// Repeated requests are harmless.
    pub fn request_deletion(&self, id: &str) -> LifecycleResult<Instance> {
        let updated = self.update(id, |inst| {
            if inst.deletion_requested || inst.state == Deleted {
                return false;
            }
            inst.deletion_requested = true;
            true
        })?;
        let instance = match updated {
            Some(instance) => instance,
            None => self.load(id)?,
        };
        if instance.state != Deleted {
            self.queue.submit(id, Operation::Deprovision)?;
        }
        Ok(instance)
    }

    pub fn submit(&self, id: &str, op: Operation) -> LifecycleResult<Admission> {
        Ok(self.queue.submit(id, op)?)
    }

    fn log_sink(&self, instance_id: &str, log_type: LogType) -> StoreLogSink {
        StoreLogSink::new(
            self.store.clone(),
            instance_id,
            log_type,
            Arc::clone(&self.clock),
            self.config.engine.write_provisioning_logs,
        )
    }

    fn audit(&self, instance_id: &str, log_type: LogType, level: LogLevel, message: &str) {
        self.log_sink(instance_id, log_type).write(level, message);
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let engine = &self.config.engine;
        backoff(engine.retry_backoff_base(), engine.retry_backoff_max(), attempt)
    }

    // ── Driver context ─────────────────────────────────────────────

    fn context(
        &self,
        instance: &Instance,
        blueprint: Blueprint,
        host: Option<Host>,
        log_type: LogType,
    ) -> DriverContext {
        DriverContext {
            instance: instance.clone(),
            blueprint,
            host,
            credentials: Arc::clone(&self.credentials),
            log: Arc::new(self.log_sink(&instance.id, log_type)),
        }
    }

    /// Driver and context for work on an existing backend resource.
    ///
    /// A blueprint deleted since the instance was created is replaced by
    /// a stand-in built from the instance record, so cleanup still works.
    fn driver_context(
        &self,
        instance: &Instance,
        log_type: LogType,
    ) -> LifecycleResult<Option<(Arc<dyn Driver>, DriverContext)>> {
        let Some(driver) = self.registry.get(&instance.driver) else {
            return Ok(None);
        };
        let blueprint = self
            .store
            .get_blueprint(&instance.blueprint_id)?
            .unwrap_or_else(|| detached_blueprint(instance));
        let host = match &instance.host_id {
            Some(host_id) => self.store.get_host(host_id)?,
            None => None,
        };
        let ctx = self.context(instance, blueprint, host, log_type);
        Ok(Some((driver, ctx)))
    }

    // ── Pool slots ─────────────────────────────────────────────────

    async fn release_slot(&self, instance: &Instance) -> LifecycleResult<()> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };
        pool.cancel_hold(&instance.id);
        let host_id = match &instance.host_id {
            Some(host_id) => Some(host_id.clone()),
            None => pool.placement_of(&instance.id)?.map(|h| h.id),
        };
        if let Some(host_id) = host_id {
            pool.release(&host_id, &instance.id, self.now()).await?;
        }
        Ok(())
    }

    /// Deprovision whatever the backend still holds for `instance` and give
    /// its slot back. Returns the driver error if the backend refused.
    async fn cleanup(&self, instance: &Instance) -> LifecycleResult<Option<DriverError>> {
        let Some((driver, ctx)) = self.driver_context(instance, LogType::Deprovisioning)? else {
            return Ok(Some(DriverError::Permanent(format!(
                "driver {} is not enabled",
                instance.driver
            ))));
        };
        if let Err(e) = driver.deprovision(&ctx).await {
            return Ok(Some(e));
        }
        self.release_slot(instance).await?;
        self.update(&instance.id, |inst| {
            if inst.host_id.is_none() {
                return false;
            }
            inst.host_id = None;
            true
        })?;
        Ok(None)
    }

    // ── Failure ────────────────────────────────────────────────────

    /// Move `instance` to failed with `reason`.
    ///
    /// With `respawn`, an instance that still has automatic respawns left
    /// gets a respawn task, which cleans up before provisioning again.
    /// Otherwise backend resources are released right away.
    async fn fail(
        &self,
        instance: &Instance,
        reason: String,
        respawn: bool,
    ) -> LifecycleResult<TaskOutcome> {
        let now = self.now();
        let Some(failed) = self.update(&instance.id, |inst| {
            if inst.state == Requested {
                transition(inst, Provisioning, now);
            }
            if !transition(inst, Failed, now) {
                return false;
            }
            inst.last_error = Some(reason.clone());
            inst.health_failing_since = None;
            true
        })?
        else {
            return Ok(TaskOutcome::Done);
        };

        error!(instance_id = %failed.id, reason = %reason, "instance failed");
        self.audit(&failed.id, LogType::Provisioning, LogLevel::Error, &reason);

        if failed.deletion_requested {
            self.queue.submit(&failed.id, Operation::Deprovision)?;
            return Ok(TaskOutcome::Done);
        }

        let limit = self.config.engine.respawn_limit;
        if respawn {
            if failed.respawn_count < limit {
                info!(
                    instance_id = %failed.id,
                    respawn = failed.respawn_count + 1,
                    limit,
                    "scheduling automatic respawn"
                );
                self.queue.submit(&failed.id, Operation::Respawn)?;
                return Ok(TaskOutcome::Done);
            }
            warn!(
                instance_id = %failed.id,
                limit,
                "respawn budget exhausted, operator action required"
            );
        }

        if let Some(e) = self.cleanup(&failed).await? {
            warn!(instance_id = %failed.id, error = %e, "cleanup after failure did not complete");
        }
        Ok(TaskOutcome::Done)
    }

    // ── Provision ──────────────────────────────────────────────────

    async fn provision(&self, id: &str) -> LifecycleResult<TaskOutcome> {
        let instance = self.load(id)?;
        if instance.deletion_requested {
            self.queue.submit(id, Operation::Deprovision)?;
            return Ok(TaskOutcome::Done);
        }
        if !awaits_provisioning(instance.state) {
            debug!(instance_id = %id, state = %instance.state, "nothing to provision");
            return Ok(TaskOutcome::Done);
        }

        let Some(blueprint) = self.store.get_blueprint(&instance.blueprint_id)? else {
            let reason = format!("blueprint {} no longer exists", instance.blueprint_id);
            return self.fail(&instance, reason, false).await;
        };
        let Some(driver) = self.registry.get(&instance.driver) else {
            let reason = format!("driver {} is not enabled", instance.driver);
            return self.fail(&instance, reason, false).await;
        };

        let mut host = None;
        if driver.uses_host_pool() {
            let Some(pool) = &self.pool else {
                let reason = format!("driver {} needs a host pool", instance.driver);
                return self.fail(&instance, reason, false).await;
            };
            match pool.reserve(id, instance.size_class, self.now()).await? {
                Reservation::Placed(placed) => host = Some(placed),
                Reservation::Held => {
                    debug!(instance_id = %id, "waiting for pool capacity");
                    return Ok(TaskOutcome::requeue(
                        Operation::Provision,
                        self.config.dispatch.poll_interval(),
                    ));
                }
            }
        }

        let now = self.now();
        let host_id = host.as_ref().map(|h| h.id.clone());
        let Some(instance) = self.update(id, |inst| {
            if inst.deletion_requested || !awaits_provisioning(inst.state) {
                return false;
            }
            if !transition(inst, Provisioning, now) {
                return false;
            }
            inst.attempts += 1;
            inst.host_id = host_id.clone();
            true
        })?
        else {
            // Deleted in the meantime; the deprovision releases the slot.
            return Ok(TaskOutcome::Done);
        };

        info!(
            instance_id = %id,
            driver = driver.name(),
            attempt = instance.attempts,
            host = host_id.as_deref().unwrap_or("-"),
            "provisioning"
        );
        let ctx = self.context(&instance, blueprint, host, LogType::Provisioning);
        ctx.log.info(&format!(
            "provisioning attempt {} with driver {}",
            instance.attempts,
            driver.name()
        ));

        match driver.provision(&ctx).await {
            Ok(outcome) => {
                self.record_metadata(id, outcome)?;
                self.check_status(id, 0).await
            }
            Err(e) => self.provision_failed(&instance, e).await,
        }
    }

    fn record_metadata(&self, id: &str, outcome: ProvisionOutcome) -> LifecycleResult<()> {
        if outcome.metadata.is_empty() {
            return Ok(());
        }
        self.update(id, |inst| {
            inst.metadata
                .extend(outcome.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
            true
        })?;
        Ok(())
    }

    async fn provision_failed(
        &self,
        instance: &Instance,
        err: DriverError,
    ) -> LifecycleResult<TaskOutcome> {
        let id = instance.id.as_str();
        let budget = self.config.engine.provision_retry_budget;

        if let DriverError::InconsistentState(cause) = &err {
            warn!(instance_id = %id, cause = %cause, "backend disagrees with record, re-syncing");
            self.audit(id, LogType::Provisioning, LogLevel::Warning, &err.to_string());
            return Ok(TaskOutcome::requeue(Operation::CheckStatus, Duration::ZERO));
        }

        if err.is_retryable() && instance.attempts < budget {
            let delay = self.retry_delay(instance.attempts);
            let now = self.now();
            let message = err.to_string();
            self.update(id, |inst| {
                if !transition(inst, Retrying, now) {
                    return false;
                }
                inst.last_error = Some(message.clone());
                true
            })?;
            warn!(
                instance_id = %id,
                attempt = instance.attempts,
                budget,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "provisioning failed, will retry"
            );
            self.audit(id, LogType::Provisioning, LogLevel::Warning, &message);
            return Ok(TaskOutcome::requeue(Operation::Provision, delay));
        }

        let reason = if err.is_retryable() {
            format!("gave up after {} attempts: {err}", instance.attempts)
        } else {
            err.to_string()
        };
        self.fail(instance, reason, false).await
    }

    // ── Status ─────────────────────────────────────────────────────

    async fn check_status(&self, id: &str, requeues: u32) -> LifecycleResult<TaskOutcome> {
        let instance = self.load(id)?;
        if instance.deletion_requested {
            if instance.state != Deleted {
                self.queue.submit(id, Operation::Deprovision)?;
            }
            return Ok(TaskOutcome::Done);
        }
        match instance.state {
            Provisioning | Reconfiguring => self.settle(&instance, requeues).await,
            Running => self.probe(&instance).await,
            _ => Ok(TaskOutcome::Done),
        }
    }

    /// Wait for a freshly provisioned or reconfigured instance to come up.
    async fn settle(&self, instance: &Instance, requeues: u32) -> LifecycleResult<TaskOutcome> {
        let Some((driver, ctx)) = self.driver_context(instance, LogType::Provisioning)? else {
            let reason = format!("driver {} is not enabled", instance.driver);
            return self.fail(instance, reason, false).await;
        };
        let status = driver.query_status(&ctx).await;
        debug!(instance_id = %instance.id, ?status, "settle probe");

        match status {
            Ok(BackendStatus::Running) => {
                self.mark_running(&instance.id)?;
                Ok(TaskOutcome::Done)
            }
            Ok(BackendStatus::Pending | BackendStatus::Unreachable) => Ok(TaskOutcome::requeue(
                Operation::CheckStatus,
                self.retry_delay(requeues + 1),
            )),
            Ok(BackendStatus::NotFound) if instance.state == Provisioning => {
                let err = DriverError::Transient("backend has no resource for the instance".into());
                self.provision_failed(instance, err).await
            }
            Ok(BackendStatus::NotFound) => {
                self.fail(instance, "backend resource lost during reconfigure".into(), true)
                    .await
            }
            Err(e) if e.is_retryable() || matches!(e, DriverError::InconsistentState(_)) => {
                Ok(TaskOutcome::requeue(
                    Operation::CheckStatus,
                    self.retry_delay(requeues + 1),
                ))
            }
            Err(e) if instance.state == Provisioning => self.provision_failed(instance, e).await,
            Err(e) => {
                warn!(instance_id = %instance.id, error = %e, "status probe failed after reconfigure");
                self.mark_running(&instance.id)?;
                Ok(TaskOutcome::Done)
            }
        }
    }

    fn mark_running(&self, id: &str) -> LifecycleResult<()> {
        let now = self.now();
        let written = self.update(id, |inst| {
            let provisioning = inst.state == Provisioning;
            if !transition(inst, Running, now) {
                return false;
            }
            if provisioning {
                inst.provisioned_at = Some(now);
                inst.last_error = None;
            }
            inst.health_failing_since = None;
            true
        })?;
        if let Some(inst) = written {
            self.audit(
                id,
                LogType::Provisioning,
                LogLevel::Info,
                &format!("instance {} is running", inst.name),
            );
        }
        Ok(())
    }

    /// Health probe of a running instance.
    async fn probe(&self, instance: &Instance) -> LifecycleResult<TaskOutcome> {
        let Some((driver, ctx)) = self.driver_context(instance, LogType::Housekeeping)? else {
            warn!(instance_id = %instance.id, driver = %instance.driver, "cannot probe, driver not enabled");
            return Ok(TaskOutcome::Done);
        };
        let status = driver.query_status(&ctx).await;
        if matches!(status, Ok(BackendStatus::Running)) {
            if instance.health_failing_since.is_some() {
                info!(instance_id = %instance.id, "instance reachable again");
                self.update(&instance.id, |inst| {
                    inst.health_failing_since = None;
                    true
                })?;
            }
            return Ok(TaskOutcome::Done);
        }

        let now = self.now();
        let since = instance.health_failing_since.unwrap_or(now);
        let failing = now.saturating_sub(since);
        let grace = self.config.health.unreachable_grace().as_secs();
        let observed = match &status {
            Ok(s) => format!("{s:?}").to_lowercase(),
            Err(e) => e.to_string(),
        };
        warn!(instance_id = %instance.id, status = %observed, failing_secs = failing, "health probe failed");

        if failing >= grace && instance.health_failing_since.is_some() {
            let reason = format!("unreachable for {failing}s (last probe: {observed})");
            return self.fail(instance, reason, true).await;
        }
        if instance.health_failing_since.is_none() {
            self.update(&instance.id, |inst| {
                if inst.state != Running || inst.health_failing_since.is_some() {
                    return false;
                }
                inst.health_failing_since = Some(now);
                true
            })?;
        }
        Ok(TaskOutcome::Done)
    }

    // ── Deprovision ────────────────────────────────────────────────

    async fn deprovision(&self, id: &str, requeues: u32) -> LifecycleResult<TaskOutcome> {
        let instance = self.load(id)?;
        let now = self.now();
        match instance.state {
            Deleted => return Ok(TaskOutcome::Done),
            Requested => {
                self.release_slot(&instance).await?;
                self.update(id, |inst| {
                    if !transition(inst, Deleted, now) {
                        return false;
                    }
                    inst.deletion_requested = true;
                    inst.deprovisioned_at = Some(now);
                    inst.host_id = None;
                    true
                })?;
                info!(instance_id = %id, "deleted before provisioning started");
                return Ok(TaskOutcome::Done);
            }
            _ => {}
        }

        let Some(instance) = self.update(id, |inst| {
            inst.deletion_requested = true;
            transition(inst, Deprovisioning, now)
        })?
        else {
            return Ok(TaskOutcome::Done);
        };

        let result = match self.driver_context(&instance, LogType::Deprovisioning)? {
            Some((driver, ctx)) => {
                info!(instance_id = %id, driver = driver.name(), attempt = requeues + 1, "deprovisioning");
                driver.deprovision(&ctx).await
            }
            None => Err(DriverError::Permanent(format!(
                "driver {} is not enabled",
                instance.driver
            ))),
        };

        match result {
            Ok(()) => {
                self.release_slot(&instance).await?;
                let now = self.now();
                self.update(id, |inst| {
                    if !transition(inst, Deleted, now) {
                        return false;
                    }
                    inst.deprovisioned_at = Some(now);
                    inst.host_id = None;
                    inst.health_failing_since = None;
                    true
                })?;
                self.audit(id, LogType::Deprovisioning, LogLevel::Info, "instance deleted");
                Ok(TaskOutcome::Done)
            }
            Err(e) if e.is_retryable() || matches!(e, DriverError::InconsistentState(_)) => {
                let delay = self.retry_delay(requeues + 1);
                warn!(instance_id = %id, error = %e, delay_ms = delay.as_millis() as u64, "deprovision failed, will retry");
                self.audit(id, LogType::Deprovisioning, LogLevel::Warning, &e.to_string());
                Ok(TaskOutcome::requeue(Operation::Deprovision, delay))
            }
            Err(e) => {
                let reason = format!("deprovision failed: {e}");
                let now = self.now();
                self.update(id, |inst| {
                    if !transition(inst, Failed, now) {
                        return false;
                    }
                    inst.last_error = Some(reason.clone());
                    true
                })?;
                error!(instance_id = %id, error = %e, "deprovision failed, retrying at the backoff ceiling");
                self.audit(id, LogType::Deprovisioning, LogLevel::Error, &reason);
                Ok(TaskOutcome::requeue(
                    Operation::Deprovision,
                    self.config.engine.retry_backoff_max(),
                ))
            }
        }
    }

    // ── Respawn and stuck instances ────────────────────────────────

    /// Clean up a failed instance and send it back to provisioning.
    ///
    /// `operator` marks a manual retry, which does not use up the automatic
    /// respawn budget. The instance stays failed until cleanup succeeds, so
    /// nothing provisions over resources that are still allocated.
    async fn respawn(
        &self,
        id: &str,
        requeues: u32,
        operator: bool,
    ) -> LifecycleResult<TaskOutcome> {
        let op = if operator {
            Operation::Retry
        } else {
            Operation::Respawn
        };
        let instance = self.load(id)?;
        if instance.deletion_requested {
            self.queue.submit(id, Operation::Deprovision)?;
            return Ok(TaskOutcome::Done);
        }
        if instance.state != Failed {
            debug!(instance_id = %id, state = %instance.state, %op, "nothing to respawn");
            return Ok(TaskOutcome::Done);
        }

        if let Some(e) = self.cleanup(&instance).await? {
            let message = format!("cleanup before respawn failed: {e}");
            self.audit(id, LogType::Deprovisioning, LogLevel::Warning, &message);
            if !e.is_retryable() {
                error!(instance_id = %id, error = %e, "cannot respawn, operator action required");
                self.update(id, |inst| {
                    if inst.state != Failed {
                        return false;
                    }
                    inst.last_error = Some(message.clone());
                    true
                })?;
                return Ok(TaskOutcome::Done);
            }
            warn!(instance_id = %id, error = %e, "cleanup before respawn failed, will retry");
            return Ok(TaskOutcome::requeue(op, self.retry_delay(requeues + 1)));
        }

        let now = self.now();
        let Some(respawned) = self.update(id, |inst| {
            if inst.deletion_requested || inst.state != Failed {
                return false;
            }
            transition(inst, Retrying, now);
            if !operator {
                inst.respawn_count += 1;
            }
            inst.attempts = 0;
            inst.host_id = None;
            inst.metadata.clear();
            inst.provisioned_at = None;
            inst.health_failing_since = None;
            true
        })?
        else {
            return Ok(TaskOutcome::Done);
        };

        let message = if operator {
            "operator retry started".to_string()
        } else {
            format!("respawn #{} started", respawned.respawn_count)
        };
        info!(instance_id = %id, respawn_count = respawned.respawn_count, operator, "respawning");
        self.audit(id, LogType::Provisioning, LogLevel::Info, &message);
        Ok(TaskOutcome::requeue(Operation::Provision, Duration::ZERO))
    }

    async fn force_fail(&self, id: &str, reason: &str) -> LifecycleResult<TaskOutcome> {
        let instance = self.load(id)?;
        let stuck_for = self.now().saturating_sub(instance.state_entered_at);
        if instance.deletion_requested
            || instance.state != Provisioning
            || stuck_for < self.config.engine.stuck_timeout().as_secs()
        {
            debug!(instance_id = %id, state = %instance.state, "instance made progress, not failing it");
            return Ok(TaskOutcome::Done);
        }
        self.fail(&instance, reason.to_string(), true).await
    }

    // ── Reconfigure ────────────────────────────────────────────────

    async fn reconfigure(
        &self,
        id: &str,
        params: &ReconfigureParams,
        requeues: u32,
    ) -> LifecycleResult<TaskOutcome> {
        let instance = self.load(id)?;
        if instance.deletion_requested || !matches!(instance.state, Running | Reconfiguring) {
            debug!(instance_id = %id, state = %instance.state, "not reconfiguring");
            return Ok(TaskOutcome::Done);
        }
        let now = self.now();
        let Some(instance) = self.update(id, |inst| transition(inst, Reconfiguring, now))? else {
            return Ok(TaskOutcome::Done);
        };
        let Some((driver, ctx)) = self.driver_context(&instance, LogType::Provisioning)? else {
            self.back_to_running(id, Some(format!("driver {} is not enabled", instance.driver)))?;
            return Ok(TaskOutcome::Done);
        };

        info!(instance_id = %id, driver = driver.name(), "reconfiguring");
        match driver.reconfigure(&ctx, params).await {
            Ok(outcome) => {
                self.record_metadata(id, outcome)?;
                self.back_to_running(id, None)?;
                Ok(TaskOutcome::Done)
            }
            Err(DriverError::Unsupported(cause)) => {
                info!(instance_id = %id, cause = %cause, "driver cannot reconfigure");
                self.back_to_running(id, Some(format!("reconfigure unsupported: {cause}")))?;
                Ok(TaskOutcome::Done)
            }
            Err(DriverError::InconsistentState(cause)) => {
                warn!(instance_id = %id, cause = %cause, "backend disagrees after reconfigure, re-syncing");
                Ok(TaskOutcome::requeue(Operation::CheckStatus, Duration::ZERO))
            }
            Err(e) if e.is_retryable() && requeues < self.config.engine.provision_retry_budget => {
                warn!(instance_id = %id, error = %e, "reconfigure failed, will retry");
                self.back_to_running(id, Some(e.to_string()))?;
                Ok(TaskOutcome::requeue(
                    Operation::Reconfigure(params.clone()),
                    self.retry_delay(requeues + 1),
                ))
            }
            Err(e) => {
                error!(instance_id = %id, error = %e, "reconfigure failed");
                self.back_to_running(id, Some(format!("reconfigure failed: {e}")))?;
                Ok(TaskOutcome::Done)
            }
        }
    }

    fn back_to_running(&self, id: &str, note: Option<String>) -> LifecycleResult<()> {
        let now = self.now();
        self.update(id, |inst| {
            if !transition(inst, Running, now) {
                return false;
            }
            inst.last_error = note.clone();
            true
        })?;
        Ok(())
    }

    async fn execute(&self, task: &Task) -> LifecycleResult<TaskOutcome> {
        let id = task.instance_id.as_str();
        match &task.op {
            Operation::Provision => self.provision(id).await,
            Operation::Deprovision => self.deprovision(id, task.requeues).await,
            Operation::CheckStatus => self.check_status(id, task.requeues).await,
            Operation::Reconfigure(params) => self.reconfigure(id, params, task.requeues).await,
            Operation::Respawn => self.respawn(id, task.requeues, false).await,
            Operation::Retry => self.respawn(id, task.requeues, true).await,
            Operation::ForceFail(reason) => self.force_fail(id, reason).await,
        }
    }
}

impl TaskHandler for Engine {
    fn handle<'a>(&'a self, task: &'a Task) -> HandlerFuture<'a> {
        Box::pin(async move {
            match self.execute(task).await {
                Ok(outcome) => outcome,
                Err(LifecycleError::InstanceNotFound(id)) => {
                    warn!(instance_id = %id, op = %task.op, "instance record is gone, dropping task");
                    TaskOutcome::Done
                }
                Err(e) => {
                    let delay = self.retry_delay(task.requeues + 1);
                    error!(
                        instance_id = %task.instance_id,
                        op = %task.op,
                        error = %e,
                        delay_ms = delay.as_millis() as u64,
                        "task failed, requeueing"
                    );
                    TaskOutcome::requeue(task.op.clone(), delay)
                }
            }
        })
    }
}

/// Stand-in for a blueprint that was removed while instances still use it.
fn detached_blueprint(instance: &Instance) -> Blueprint {
    Blueprint {
        id: instance.blueprint_id.clone(),
        name: instance.blueprint_id.clone(),
        driver: instance.driver.clone(),
        size_class: instance.size_class,
        image: String::new(),
        enabled: false,
        max_lifetime: None,
        config: Default::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use berth_core::SizeClass;
    use berth_driver::StaticCredentialStore;
    use berth_driver::drivers::DummyDriver;
    use std::collections::BTreeMap;

    struct Fixture {
        engine: Engine,
        driver: Arc<DummyDriver>,
        clock: Arc<ManualClock>,
    }

    fn fixture(driver: DummyDriver) -> Fixture {
        let store = StateStore::open_in_memory().unwrap();
        let driver = Arc::new(driver);
        let registry = DriverRegistry::new().with("dummy", driver.clone());
        let clock = Arc::new(ManualClock::new(1_000));
        let engine = Engine::new(
            store,
            registry,
            Arc::new(DispatchQueue::new()),
            Arc::new(StaticCredentialStore::new()),
            BerthConfig::default(),
        )
        .with_clock(clock.clone());
        Fixture {
            engine,
            driver,
            clock,
        }
    }

    fn seed(engine: &Engine, id: &str) -> Instance {
        let blueprint = Blueprint {
            id: "bp".into(),
            name: "bp".into(),
            driver: "dummy".into(),
            size_class: SizeClass::Small,
            image: "img".into(),
            enabled: true,
            max_lifetime: None,
            config: BTreeMap::new(),
        };
        engine.store().put_blueprint(&blueprint).unwrap();
        let instance = Instance::new(id.into(), format!("pb-{id}"), &blueprint, "alice", engine.now());
        engine.store().insert_instance(&instance).unwrap();
        instance
    }

    fn task(id: &str, op: Operation, requeues: u32) -> Task {
        Task {
            seq: 1,
            instance_id: id.into(),
            op,
            not_before: tokio::time::Instant::now(),
            requeues,
        }
    }

    #[tokio::test]
    async fn provision_reaches_running_in_one_task() {
        let f = fixture(DummyDriver::new());
        seed(&f.engine, "inst-1");

        let outcome = f.engine.handle(&task("inst-1", Operation::Provision, 0)).await;
        assert_eq!(outcome, TaskOutcome::Done);

        let inst = f.engine.load("inst-1").unwrap();
        assert_eq!(inst.state, Running);
        assert_eq!(inst.attempts, 1);
        assert_eq!(inst.provisioned_at, Some(1_000));
        assert_eq!(inst.metadata.get("address").map(String::as_str), Some("127.0.0.1"));
    }

    #[tokio::test]
    async fn transient_failure_backs_off_and_keeps_budget() {
        let f = fixture(DummyDriver::new());
        seed(&f.engine, "inst-1");
        f.driver
            .fail_next_provision(DriverError::Transient("rate limited".into()));

        let outcome = f.engine.handle(&task("inst-1", Operation::Provision, 0)).await;
        assert_eq!(
            outcome,
            TaskOutcome::requeue(Operation::Provision, Duration::from_secs(5))
        );
        let inst = f.engine.load("inst-1").unwrap();
        assert_eq!(inst.state, Retrying);
        assert_eq!(inst.last_error.as_deref(), Some("transient: rate limited"));
    }

    #[tokio::test]
    async fn timeouts_escalate_once_the_budget_is_spent() {
        let f = fixture(DummyDriver::new());
        seed(&f.engine, "inst-1");
        for _ in 0..3 {
            f.driver
                .fail_next_provision(DriverError::Timeout("docker run".into()));
        }

        for _ in 0..2 {
            let outcome = f.engine.handle(&task("inst-1", Operation::Provision, 0)).await;
            assert!(matches!(outcome, TaskOutcome::Requeue { .. }));
        }
        let outcome = f.engine.handle(&task("inst-1", Operation::Provision, 0)).await;
        assert_eq!(outcome, TaskOutcome::Done);

        let inst = f.engine.load("inst-1").unwrap();
        assert_eq!(inst.state, Failed);
        assert!(inst.last_error.unwrap().starts_with("gave up after 3 attempts"));
        assert_eq!(inst.respawn_count, 0);
    }

    #[tokio::test]
    async fn inconsistent_state_forces_a_resync() {
        let f = fixture(DummyDriver::new());
        seed(&f.engine, "inst-1");
        f.driver
            .fail_next_provision(DriverError::InconsistentState("container exists".into()));

        let outcome = f.engine.handle(&task("inst-1", Operation::Provision, 0)).await;
        assert_eq!(
            outcome,
            TaskOutcome::requeue(Operation::CheckStatus, Duration::ZERO)
        );
        assert_eq!(f.engine.load("inst-1").unwrap().state, Provisioning);
    }

    #[tokio::test]
    async fn unreachable_instance_fails_after_grace() {
        let f = fixture(DummyDriver::new());
        seed(&f.engine, "inst-1");
        f.engine.handle(&task("inst-1", Operation::Provision, 0)).await;
        f.driver.set_status("inst-1", BackendStatus::Unreachable);

        f.engine.handle(&task("inst-1", Operation::CheckStatus, 0)).await;
        let inst = f.engine.load("inst-1").unwrap();
        assert_eq!(inst.state, Running);
        assert_eq!(inst.health_failing_since, Some(1_000));

        f.clock.advance(60);
        f.engine.handle(&task("inst-1", Operation::CheckStatus, 0)).await;
        assert_eq!(f.engine.load("inst-1").unwrap().state, Running);

        f.clock.advance(180);
        f.engine.handle(&task("inst-1", Operation::CheckStatus, 0)).await;
        let inst = f.engine.load("inst-1").unwrap();
        assert_eq!(inst.state, Failed);
        assert!(inst.last_error.unwrap().starts_with("unreachable for 240s"));
        assert_eq!(f.engine.queue().pending_ops("inst-1"), vec![Operation::Respawn]);
    }

    #[tokio::test]
    async fn a_blip_resets_the_health_streak() {
        let f = fixture(DummyDriver::new());
        seed(&f.engine, "inst-1");
        f.engine.handle(&task("inst-1", Operation::Provision, 0)).await;

        f.driver.set_status("inst-1", BackendStatus::Unreachable);
        f.engine.handle(&task("inst-1", Operation::CheckStatus, 0)).await;
        f.driver.clear_status("inst-1");
        f.clock.advance(500);
        f.engine.handle(&task("inst-1", Operation::CheckStatus, 0)).await;

        let inst = f.engine.load("inst-1").unwrap();
        assert_eq!(inst.state, Running);
        assert_eq!(inst.health_failing_since, None);
    }

    #[tokio::test]
    async fn force_fail_ignores_instances_that_moved_on() {
        let f = fixture(DummyDriver::new());
        seed(&f.engine, "inst-1");
        f.engine.handle(&task("inst-1", Operation::Provision, 0)).await;

        let op = Operation::ForceFail("stuck".into());
        f.engine.handle(&task("inst-1", op, 0)).await;
        assert_eq!(f.engine.load("inst-1").unwrap().state, Running);
    }

    #[tokio::test]
    async fn missing_instance_drops_the_task() {
        let f = fixture(DummyDriver::new());
        let outcome = f.engine.handle(&task("ghost", Operation::Provision, 0)).await;
        assert_eq!(outcome, TaskOutcome::Done);
    }

    #[tokio::test]
    async fn request_deletion_is_idempotent() {
        let f = fixture(DummyDriver::new());
        seed(&f.engine, "inst-1");
        assert!(f.engine.request_deletion("inst-1").unwrap().deletion_requested);
        f.engine.request_deletion("inst-1").unwrap();
        assert_eq!(
            f.engine.queue().pending_ops("inst-1"),
            vec![Operation::Deprovision]
        );
    }
}
