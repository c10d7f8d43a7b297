//! Request-layer entry points and the assembled runtime.
//!
//! Every request validates, writes the record and enqueues work, then
//! returns. Nothing here waits on a backend.

use std::collections::BTreeMap;
use std::sync::Arc;

use berth_core::ids::instance_name;
use berth_core::{BerthConfig, InstanceId, generate_id};
use berth_dispatch::{CrashBackoff, DispatchQueue, Operation, TaskHandler, WorkerPool};
use berth_driver::{CredentialStore, DriverRegistry, HostProvider, ReconfigureParams};
use berth_pool::{HostPool, PoolSnapshot};
use berth_state::{Instance, InstanceFilter, InstanceLog, InstanceState, StateStore};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info};

use crate::clock::{Clock, SystemClock};
use crate::engine::Engine;
use crate::error::{LifecycleError, LifecycleResult};
use crate::monitor::{Monitor, SweepReport};

/// What `get_instance_status` reports.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InstanceStatus {
    pub id: InstanceId,
    pub name: String,
    pub state: InstanceState,
    pub metadata: BTreeMap<String, String>,
    pub last_error: Option<String>,
    pub attempts: u32,
    pub respawn_count: u32,
    pub host_id: Option<String>,
    pub deletion_requested: bool,
    /// Operations queued for the instance, oldest first.
    pub pending: Vec<String>,
    pub in_flight: bool,
}

pub struct OrchestratorBuilder {
    config: BerthConfig,
    store: StateStore,
    registry: DriverRegistry,
    credentials: Arc<dyn CredentialStore>,
    host_provider: Option<Arc<dyn HostProvider>>,
    clock: Arc<dyn Clock>,
}

impl OrchestratorBuilder {
    /// Backend that creates pool hosts. Required when any enabled driver
    /// is pool-based.
    pub fn host_provider(mut self, provider: Arc<dyn HostProvider>) -> Self {
        self.host_provider = Some(provider);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> LifecycleResult<Orchestrator> {
        let queue = Arc::new(DispatchQueue::new());
        let pool = match (self.registry.needs_host_pool(), self.host_provider) {
            (true, None) => return Err(LifecycleError::NoHostProvider),
            (_, Some(provider)) => Some(Arc::new(HostPool::new(
                self.store.clone(),
                provider,
                self.config.pool.clone(),
            ))),
            (false, None) => None,
        };

        let concurrency = self.config.dispatch.concurrency;
        let crash_backoff = CrashBackoff {
            base: self.config.engine.retry_backoff_base(),
            max: self.config.engine.retry_backoff_max(),
        };
        let mut engine = Engine::new(
            self.store,
            self.registry,
            Arc::clone(&queue),
            self.credentials,
            self.config,
        )
        .with_clock(self.clock);
        if let Some(pool) = pool {
            engine = engine.with_pool(pool);
        }
        let engine = Arc::new(engine);
        let handler: Arc<dyn TaskHandler> = engine.clone();
        let workers =
            WorkerPool::new(queue, handler, concurrency)?.with_crash_backoff(crash_backoff);

        Ok(Orchestrator {
            monitor: Monitor::new(Arc::clone(&engine)),
            engine,
            workers,
        })
    }
}

pub struct Orchestrator {
    engine: Arc<Engine>,
    monitor: Monitor,
    workers: WorkerPool,
}

impl Orchestrator {
    pub fn builder(
        config: BerthConfig,
        store: StateStore,
        registry: DriverRegistry,
        credentials: Arc<dyn CredentialStore>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            store,
            registry,
            credentials,
            host_provider: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn pool(&self) -> Option<&Arc<HostPool>> {
        self.engine.pool()
    }

    // ── Requests ───────────────────────────────────────────────────

    /// Record a new instance of `blueprint_id` and queue its provisioning.
    pub fn create_instance(&self, blueprint_id: &str, owner: &str) -> LifecycleResult<InstanceId> {
        let store = self.engine.store();
        let blueprint = store
            .get_blueprint(blueprint_id)?
            .ok_or_else(|| LifecycleError::BlueprintNotFound(blueprint_id.to_string()))?;
        if !blueprint.enabled {
            return Err(LifecycleError::BlueprintDisabled(blueprint.id));
        }
        if !self.engine.registry().contains(&blueprint.driver) {
            return Err(LifecycleError::DriverNotEnabled {
                blueprint: blueprint.id,
                driver: blueprint.driver,
            });
        }

        let now = self.engine.now();
        let id = generate_id("inst", &format!("{blueprint_id}:{owner}"));
        let name = instance_name(&self.engine.config().engine.instance_name_prefix, &id);
        let instance = Instance::new(id.clone(), name, &blueprint, owner, now);
        store.insert_instance(&instance)?;
        self.engine.submit(&id, Operation::Provision)?;

        info!(
            instance_id = %id,
            name = %instance.name,
            blueprint = %blueprint.id,
            driver = %blueprint.driver,
            owner,
            "instance requested"
        );
        Ok(id)
    }

    /// Ask for `id` to be deleted. Queued provisioning work is cancelled;
    /// a running task finishes first and the deletion runs right after.
    pub fn delete_instance(&self, id: &str) -> LifecycleResult<InstanceStatus> {
        let instance = self.engine.request_deletion(id)?;
        info!(instance_id = %id, state = %instance.state, "deletion requested");
        self.status_of(instance)
    }

    pub fn get_instance_status(&self, id: &str) -> LifecycleResult<InstanceStatus> {
        let instance = self.engine.load(id)?;
        self.status_of(instance)
    }

    /// Operator retry of a failed instance, outside the automatic respawn
    /// budget. The engine cleans up and moves the instance on.
    pub fn retry_instance(&self, id: &str) -> LifecycleResult<InstanceStatus> {
        let instance = self.engine.load(id)?;
        if instance.state != InstanceState::Failed || instance.deletion_requested {
            return Err(LifecycleError::InvalidState {
                id: id.to_string(),
                state: instance.state,
                action: "retry",
            });
        }
        self.engine.submit(id, Operation::Retry)?;
        info!(instance_id = %id, "operator retry queued");
        self.status_of(instance)
    }

    /// Queue a driver reconfiguration of a running instance.
    pub fn reconfigure_instance(
        &self,
        id: &str,
        params: ReconfigureParams,
    ) -> LifecycleResult<InstanceStatus> {
        let instance = self.engine.load(id)?;
        if instance.state != InstanceState::Running || instance.deletion_requested {
            return Err(LifecycleError::InvalidState {
                id: id.to_string(),
                state: instance.state,
                action: "reconfigure",
            });
        }
        self.engine.submit(id, Operation::Reconfigure(params))?;
        self.status_of(instance)
    }

    pub fn list_instances(&self, include_deleted: bool) -> LifecycleResult<Vec<InstanceStatus>> {
        let filter = InstanceFilter {
            include_deleted,
            ..Default::default()
        };
        self.engine
            .store()
            .list_instances(&filter)?
            .into_iter()
            .map(|inst| self.status_of(inst))
            .collect()
    }

    pub fn get_instance_logs(&self, id: &str) -> LifecycleResult<Vec<InstanceLog>> {
        self.engine.load(id)?;
        Ok(self.engine.store().list_logs(id)?)
    }

    pub fn pool_snapshot(&self) -> LifecycleResult<Option<PoolSnapshot>> {
        match self.engine.pool() {
            Some(pool) => Ok(Some(pool.snapshot()?)),
            None => Ok(None),
        }
    }

    fn status_of(&self, instance: Instance) -> LifecycleResult<InstanceStatus> {
        let queue = self.engine.queue();
        Ok(InstanceStatus {
            pending: queue
                .pending_ops(&instance.id)
                .iter()
                .map(|op| op.name().to_string())
                .collect(),
            in_flight: queue.is_in_flight(&instance.id),
            id: instance.id,
            name: instance.name,
            state: instance.state,
            metadata: instance.metadata,
            last_error: instance.last_error,
            attempts: instance.attempts,
            respawn_count: instance.respawn_count,
            host_id: instance.host_id,
            deletion_requested: instance.deletion_requested,
        })
    }

    // ── Driving the engine ─────────────────────────────────────────

    /// One monitor sweep.
    pub fn sweep(&self) -> LifecycleResult<SweepReport> {
        self.monitor.sweep()
    }

    /// Run every task that is due right now on the calling task, including
    /// tasks those tasks queue without delay. Returns how many ran.
    pub async fn run_pending(&self) -> usize {
        let queue = self.engine.queue();
        let mut ran = 0;
        while let Some(task) = queue.try_next() {
            let outcome = self.engine.handle(&task).await;
            queue.finish(&task, outcome);
            ran += 1;
        }
        ran
    }

    /// Serve until `shutdown` flips: the worker pool, pool housekeeping and
    /// the monitor run side by side. Work left over from a previous run is
    /// picked up by an initial sweep.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        let config = self.engine.config();
        match self.sweep() {
            Ok(report) => info!(?report, "startup sweep"),
            Err(e) => error!(error = %e, "startup sweep failed"),
        }

        let pool = async {
            if let Some(pool) = self.engine.pool() {
                pool.run(config.pool.tick_interval(), shutdown.clone()).await;
            }
        };
        tokio::join!(
            self.workers.run(shutdown.clone()),
            pool,
            self.monitor
                .run(config.health.probe_interval(), shutdown.clone()),
        );
        info!("orchestrator stopped");
    }
}
