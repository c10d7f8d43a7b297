//! Periodic health and progress sweep.
//!
//! Runs on its own interval, outside the dispatch queue. The sweep only
//! reads records and submits tasks; every state change it causes happens
//! inside a task, on the same write path as driver outcomes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use berth_dispatch::{Admission, Operation};
use berth_state::{Blueprint, Instance, InstanceFilter, InstanceState};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::engine::Engine;
use crate::error::LifecycleResult;

/// What one sweep submitted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Health probes queued for running instances.
    pub probes: usize,
    /// Instances stuck in provisioning that were queued to fail.
    pub stuck: usize,
    /// Instances past their blueprint's max lifetime, queued for deletion.
    pub expired: usize,
    /// Instances with unfinished work but nothing queued, e.g. after a
    /// restart, that got their task back.
    pub recovered: usize,
}

pub struct Monitor {
    engine: Arc<Engine>,
}

impl Monitor {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Look at every live instance once.
    pub fn sweep(&self) -> LifecycleResult<SweepReport> {
        let engine = &self.engine;
        let queue = engine.queue();
        let now = engine.now();
        let stuck_after = engine.config().engine.stuck_timeout().as_secs();
        let mut blueprints: HashMap<String, Option<Blueprint>> = HashMap::new();
        let mut report = SweepReport::default();

        for instance in engine.store().list_instances(&InstanceFilter::default())? {
            let id = instance.id.as_str();
            let idle = !queue.is_in_flight(id) && queue.pending_ops(id).is_empty();

            if instance.deletion_requested {
                if idle {
                    queue.submit(id, Operation::Deprovision)?;
                    report.recovered += 1;
                }
                continue;
            }

            match instance.state {
                InstanceState::Running => {
                    if !blueprints.contains_key(&instance.blueprint_id) {
                        let blueprint = engine.store().get_blueprint(&instance.blueprint_id)?;
                        blueprints.insert(instance.blueprint_id.clone(), blueprint);
                    }
                    let blueprint = blueprints.get(&instance.blueprint_id).and_then(Option::as_ref);
                    if expired(&instance, blueprint, now) {
                        info!(instance_id = %id, "max lifetime reached, deleting");
                        engine.request_deletion(id)?;
                        report.expired += 1;
                        continue;
                    }
                    if let Admission::Queued(_) = queue.submit(id, Operation::CheckStatus)? {
                        report.probes += 1;
                    }
                }
                InstanceState::Provisioning
                    if now.saturating_sub(instance.state_entered_at) >= stuck_after =>
                {
                    let reason = format!(
                        "stuck in provisioning for {}s",
                        now.saturating_sub(instance.state_entered_at)
                    );
                    if let Admission::Queued(_) = queue.submit(id, Operation::ForceFail(reason))? {
                        report.stuck += 1;
                    }
                }
                InstanceState::Requested | InstanceState::Retrying | InstanceState::Provisioning
                    if idle =>
                {
                    queue.submit(id, Operation::Provision)?;
                    report.recovered += 1;
                }
                InstanceState::Reconfiguring if idle => {
                    queue.submit(id, Operation::CheckStatus)?;
                    report.recovered += 1;
                }
                _ => {}
            }
        }

        if report != SweepReport::default() {
            debug!(?report, "monitor sweep");
        }
        Ok(report)
    }

    /// Sweep every `interval` until `shutdown` flips.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = interval.as_millis() as u64, "instance monitor started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.sweep() {
                        error!(error = %e, "monitor sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("instance monitor shutting down");
                    break;
                }
            }
        }
    }
}

fn expired(instance: &Instance, blueprint: Option<&Blueprint>, now: u64) -> bool {
    let (Some(lifetime), Some(since)) = (
        blueprint.and_then(|b| b.max_lifetime),
        instance.provisioned_at,
    ) else {
        return false;
    };
    now.saturating_sub(since) >= lifetime
}
