//! Host pool manager.
//!
//! Keeps enough hosts around to cover the free-slot target per size class,
//! places instances on hosts best-fit, and retires hosts that sit empty.
//! All host record writes go through a per-host lock plus a versioned
//! compare-and-swap, so occupancy can never exceed capacity even with
//! several daemons sharing one store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use berth_core::config::PoolPolicy;
use berth_core::{
    HostId, InstanceId, ShutdownMode, SizeClass, SlotCounts, epoch_secs, generate_id,
};
use berth_driver::{DriverError, HostProvider, HostSpec};
use berth_state::{Host, HostState, StateStore};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{PoolError, PoolResult};

/// Advisory lock guarding housekeeping when several daemons share a store.
pub const HOUSEKEEPING_LOCK: &str = "pool-housekeeping";

/// Outcome of a slot request.
#[derive(Debug, Clone, PartialEq)]
pub enum Reservation {
    /// A slot is held for the instance on this host.
    Placed(Host),
    /// No capacity right now. The request counts as pending demand until
    /// it is placed or cancelled.
    Held,
}

impl Reservation {
    pub fn host(&self) -> Option<&Host> {
        match self {
            Reservation::Placed(host) => Some(host),
            Reservation::Held => None,
        }
    }
}

/// What a single housekeeping tick did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub created: Vec<HostId>,
    pub prepared: Vec<HostId>,
    pub started: Vec<HostId>,
    pub expired: Vec<HostId>,
    pub destroyed: Vec<HostId>,
    pub stopped: Vec<HostId>,
    pub creation_failed: bool,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        self == &TickReport::default()
    }
}

/// Point-in-time view of the pool for operators.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolSnapshot {
    /// All host records, stopped ones included.
    pub hosts: usize,
    pub hosts_by_state: BTreeMap<String, usize>,
    /// Capacity of hosts accepting placements.
    pub capacity: SlotCounts,
    pub occupied: SlotCounts,
    pub free: SlotCounts,
    /// Requests waiting for a slot.
    pub held: SlotCounts,
    pub max_hosts: u32,
    pub creation_failures: u32,
    pub creation_exhausted: bool,
    pub last_creation_error: Option<String>,
}

#[derive(Debug, Default)]
struct CreationState {
    failures: u32,
    next_attempt_at: u64,
    exhausted_at: Option<u64>,
    last_error: Option<String>,
}

pub struct HostPool {
    store: StateStore,
    provider: Arc<dyn HostProvider>,
    policy: PoolPolicy,
    max_hosts: AtomicU32,
    drain: AtomicBool,
    host_locks: Mutex<HashMap<HostId, Arc<tokio::sync::Mutex<()>>>>,
    held: Mutex<BTreeMap<InstanceId, SizeClass>>,
    creation: Mutex<CreationState>,
    /// Serializes ticks within this process.
    tick_guard: tokio::sync::Mutex<()>,
    holder: String,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl HostPool {
    pub fn new(store: StateStore, provider: Arc<dyn HostProvider>, policy: PoolPolicy) -> Self {
        Self {
            store,
            provider,
            max_hosts: AtomicU32::new(policy.max_hosts),
            drain: AtomicBool::new(policy.drain),
            policy,
            host_locks: Mutex::new(HashMap::new()),
            held: Mutex::new(BTreeMap::new()),
            creation: Mutex::new(CreationState::default()),
            tick_guard: tokio::sync::Mutex::new(()),
            holder: generate_id("pool", "housekeeping"),
        }
    }

    pub fn policy(&self) -> &PoolPolicy {
        &self.policy
    }

    pub fn max_hosts(&self) -> u32 {
        self.max_hosts.load(Ordering::Relaxed)
    }

    /// Operator override of the host ceiling. Held requests get capacity
    /// on the next tick.
    pub fn set_max_hosts(&self, max_hosts: u32) {
        let previous = self.max_hosts.swap(max_hosts, Ordering::Relaxed);
        info!(previous, max_hosts, "host ceiling changed");
    }

    pub fn is_draining(&self) -> bool {
        self.drain.load(Ordering::Relaxed)
    }

    /// In drain mode nothing is placed, nothing is created and every empty
    /// host is retired.
    pub fn set_drain(&self, drain: bool) {
        self.drain.store(drain, Ordering::Relaxed);
        info!(drain, "pool drain mode changed");
    }

    // ── Placement ──────────────────────────────────────────────────

    /// Hold a slot of `class` for `instance_id`.
    ///
    /// Idempotent: an instance that already holds a slot gets its host
    /// back. Candidates are tried smallest-sufficient-free first, oldest
    /// host on ties.
    pub async fn reserve(
        &self,
        instance_id: &str,
        class: SizeClass,
        now: u64,
    ) -> PoolResult<Reservation> {
        if let Some(host) = self.placement_of(instance_id)? {
            self.cancel_hold(instance_id);
            return Ok(Reservation::Placed(host));
        }

        if !self.is_draining() {
            let mut candidates: Vec<Host> = self
                .store
                .list_hosts()?
                .into_iter()
                .filter(|h| h.can_place(class))
                .collect();
            // Stable sort: list_hosts is oldest first.
            candidates.sort_by_key(|h| h.free().get(class));

            for candidate in candidates {
                if let Some(host) = self.try_place(&candidate.id, instance_id, class, now).await? {
                    self.cancel_hold(instance_id);
                    info!(
                        instance_id,
                        host = %host.id,
                        %class,
                        free = host.free().get(class),
                        "slot reserved"
                    );
                    return Ok(Reservation::Placed(host));
                }
            }
        }

        let newly_held = guard(&self.held)
            .insert(instance_id.to_string(), class)
            .is_none();
        if newly_held {
            info!(instance_id, %class, "no free slot, request held until capacity frees up");
        }
        Ok(Reservation::Held)
    }

    /// Give back the slot `instance_id` holds on `host_id`.
    ///
    /// Returns false if there was nothing to release, so repeated calls
    /// are harmless.
    pub async fn release(&self, host_id: &str, instance_id: &str, now: u64) -> PoolResult<bool> {
        self.cancel_hold(instance_id);
        let mut released = None;
        self.update_host(host_id, |host| {
            released = None;
            let Some(class) = host.placements.remove(instance_id) else {
                return false;
            };
            let slot = host.occupied.get_mut(class);
            *slot = slot.saturating_sub(1);
            if host.is_empty() {
                host.idle_since = now;
            }
            released = Some(class);
            true
        })
        .await?;

        match released {
            Some(class) => {
                info!(instance_id, host = %host_id, %class, "slot released");
                Ok(true)
            }
            None => {
                debug!(instance_id, host = %host_id, "nothing to release");
                Ok(false)
            }
        }
    }

    /// Drop a pending request, e.g. when the instance is deleted while
    /// waiting for capacity.
    pub fn cancel_hold(&self, instance_id: &str) -> bool {
        guard(&self.held).remove(instance_id).is_some()
    }

    /// The host currently holding a slot for `instance_id`.
    pub fn placement_of(&self, instance_id: &str) -> PoolResult<Option<Host>> {
        Ok(self
            .store
            .list_hosts()?
            .into_iter()
            .find(|h| h.placements.contains_key(instance_id)))
    }

    async fn try_place(
        &self,
        host_id: &str,
        instance_id: &str,
        class: SizeClass,
        now: u64,
    ) -> PoolResult<Option<Host>> {
        self.update_host(host_id, |host| {
            if host.placements.contains_key(instance_id) {
                return true;
            }
            if !host.can_place(class) {
                return false;
            }
            *host.occupied.get_mut(class) += 1;
            host.placements.insert(instance_id.to_string(), class);
            host.first_used_at.get_or_insert(now);
            true
        })
        .await
    }

    fn host_lock(&self, host_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(guard(&self.host_locks).entry(host_id.to_string()).or_default())
    }

    fn forget_host_lock(&self, host_id: &str) {
        guard(&self.host_locks).remove(host_id);
    }

    /// Re-read `host_id` under its lock, apply `f` and write it back.
    ///
    /// `f` returns false to leave the record untouched. Returns the record
    /// as written, or `None` if the host is gone or `f` declined.
    async fn update_host<F>(&self, host_id: &str, mut f: F) -> PoolResult<Option<Host>>
    where
        F: FnMut(&mut Host) -> bool,
    {
        let lock = self.host_lock(host_id);
        let _held = lock.lock().await;
        loop {
            let Some(mut host) = self.store.get_host(host_id)? else {
                return Ok(None);
            };
            if !f(&mut host) {
                return Ok(None);
            }
            match self.store.cas_host(&host) {
                Ok(written) => return Ok(Some(written)),
                Err(e) if e.is_conflict() => {
                    debug!(host = %host_id, "host record changed underneath, re-reading");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // ── Housekeeping ───────────────────────────────────────────────

    /// One scheduling pass: prepare new hosts, recycle expired ones,
    /// retire idle ones, then grow toward the free-slot target.
    pub async fn tick(&self, now: u64) -> PoolResult<TickReport> {
        let _tick = self.tick_guard.lock().await;
        let mut report = TickReport::default();

        self.prepare_spawning(now, &mut report).await?;
        self.expire_hosts(now, &mut report).await?;
        self.retire_idle(now, &mut report).await?;
        self.scale_up(now, &mut report).await?;

        if !report.is_idle() {
            debug!(?report, "pool tick");
        }
        Ok(report)
    }

    /// A tick taken under the cross-process housekeeping lock.
    ///
    /// Returns `None` when another process owns housekeeping.
    pub async fn housekeeping(&self, interval: Duration) -> PoolResult<Option<TickReport>> {
        let now = epoch_secs();
        let ttl = (interval.as_secs() * 3).max(30);
        if !self.store.try_lock(HOUSEKEEPING_LOCK, &self.holder, ttl, now)? {
            debug!("pool housekeeping owned by another process");
            return Ok(None);
        }
        self.tick(now).await.map(Some)
    }

    /// Run housekeeping every `interval` until `shutdown` flips.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = interval.as_millis() as u64,
            max_hosts = self.max_hosts(),
            "host pool started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.housekeeping(interval).await {
                        error!(error = %e, "pool housekeeping failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("host pool shutting down");
                    break;
                }
            }
        }

        if let Err(e) = self.store.unlock(HOUSEKEEPING_LOCK, &self.holder) {
            warn!(error = %e, "could not release housekeeping lock");
        }
    }

    async fn prepare_spawning(&self, now: u64, report: &mut TickReport) -> PoolResult<()> {
        let spawning: Vec<Host> = self
            .store
            .list_hosts()?
            .into_iter()
            .filter(|h| h.state == HostState::Spawning)
            .collect();
        for host in spawning {
            self.prepare(&host, now, report).await?;
        }
        Ok(())
    }

    async fn prepare(&self, host: &Host, now: u64, report: &mut TickReport) -> PoolResult<()> {
        let max_errors = self.policy.max_host_errors;
        match self.provider.prepare_host(host).await {
            Ok(()) => {
                let activated = self
                    .update_host(&host.id, |h| {
                        if h.state != HostState::Spawning {
                            return false;
                        }
                        h.state = HostState::Active;
                        h.state_entered_at = now;
                        h.idle_since = now;
                        h.error_count = 0;
                        true
                    })
                    .await?;
                if activated.is_some() {
                    info!(host = %host.id, address = ?host.address, "host ready for placements");
                    report.prepared.push(host.id.clone());
                }
            }
            Err(e) => {
                let updated = self
                    .update_host(&host.id, |h| {
                        h.error_count += 1;
                        if h.error_count >= max_errors {
                            h.state = HostState::Inactive;
                            h.state_entered_at = now;
                        }
                        true
                    })
                    .await?;
                if let Some(h) = updated {
                    if h.state == HostState::Inactive {
                        error!(host = %h.id, errors = h.error_count, error = %e, "host preparation keeps failing, giving the host up");
                    } else {
                        warn!(host = %h.id, attempt = h.error_count, error = %e, "host preparation failed, retrying next tick");
                    }
                }
            }
        }
        Ok(())
    }

    async fn expire_hosts(&self, now: u64, report: &mut TickReport) -> PoolResult<()> {
        let Some(lifetime) = self.policy.host_lifetime() else {
            return Ok(());
        };
        let lifetime = lifetime.as_secs();
        for host in self.store.list_hosts()? {
            let Some(first_used) = host.first_used_at else {
                continue;
            };
            if host.state != HostState::Active || now.saturating_sub(first_used) < lifetime {
                continue;
            }
            let expired = self
                .update_host(&host.id, |h| {
                    if h.state != HostState::Active {
                        return false;
                    }
                    h.state = HostState::Inactive;
                    h.state_entered_at = now;
                    true
                })
                .await?;
            if expired.is_some() {
                info!(host = %host.id, lifetime_secs = lifetime, "host reached its lifetime, draining");
                report.expired.push(host.id);
            }
        }
        Ok(())
    }

    async fn retire_idle(&self, now: u64, report: &mut TickReport) -> PoolResult<()> {
        let hosts = self.store.list_hosts()?;
        let draining = self.is_draining();
        let need = if draining {
            SlotCounts::ZERO
        } else {
            self.policy.free_slot_target
        };
        let grace = self.policy.idle_grace().as_secs();
        let mut spare = provisioned_free(&hosts);

        // Newest first, so the oldest hosts are the ones kept.
        for host in hosts.iter().rev() {
            if !host.is_empty() {
                continue;
            }
            match host.state {
                HostState::Inactive => {
                    self.retire(host, ShutdownMode::Terminate, now, report).await?;
                }
                HostState::Active => {
                    if !draining && now.saturating_sub(host.idle_since) < grace {
                        continue;
                    }
                    let after = spare.saturating_sub(&host.free());
                    if SizeClass::ALL.iter().any(|c| after.get(*c) < need.get(*c)) {
                        continue;
                    }
                    if self.retire(host, host.shutdown_mode, now, report).await? {
                        spare = after;
                    }
                }
                HostState::Spawning | HostState::Stopped => {}
            }
        }
        Ok(())
    }

    async fn retire(
        &self,
        host: &Host,
        mode: ShutdownMode,
        now: u64,
        report: &mut TickReport,
    ) -> PoolResult<bool> {
        // Out of placement before the backend is touched.
        let taken = self
            .update_host(&host.id, |h| {
                if !h.is_empty() || !matches!(h.state, HostState::Active | HostState::Inactive) {
                    return false;
                }
                h.state = HostState::Inactive;
                h.state_entered_at = now;
                true
            })
            .await?;
        let Some(host) = taken else {
            return Ok(false);
        };

        let mode = if host.error_count >= self.policy.max_host_errors {
            ShutdownMode::Terminate
        } else {
            mode
        };

        match mode {
            ShutdownMode::Terminate => match self.provider.destroy_host(&host).await {
                Ok(()) => {
                    self.store.delete_host(&host.id)?;
                    self.forget_host_lock(&host.id);
                    info!(host = %host.id, "host terminated");
                    report.destroyed.push(host.id);
                    Ok(true)
                }
                Err(e) => {
                    warn!(host = %host.id, error = %e, "host destroy failed, retrying next tick");
                    Ok(false)
                }
            },
            ShutdownMode::PowerOff => match self.provider.stop_host(&host).await {
                Ok(()) => {
                    self.update_host(&host.id, |h| {
                        h.state = HostState::Stopped;
                        h.state_entered_at = now;
                        true
                    })
                    .await?;
                    info!(host = %host.id, "host powered off for reuse");
                    report.stopped.push(host.id);
                    Ok(true)
                }
                Err(e) => {
                    warn!(host = %host.id, error = %e, "host power-off failed, terminating it next tick");
                    Ok(false)
                }
            },
        }
    }

    async fn scale_up(&self, now: u64, report: &mut TickReport) -> PoolResult<()> {
        if self.is_draining() {
            return Ok(());
        }
        let held = self.held_counts();
        let need = self.policy.free_slot_target.add(&held);
        let hosts = self.store.list_hosts()?;
        let mut host_count = hosts.len() as u32;
        let mut spare = provisioned_free(&hosts);
        let mut stopped: Vec<Host> = hosts
            .into_iter()
            .filter(|h| h.state == HostState::Stopped)
            .collect();

        for class in SizeClass::ALL {
            while spare.get(class) < need.get(class) {
                // Powered-off hosts come back before new ones are bought.
                if let Some(pos) = stopped.iter().position(|h| h.capacity.get(class) > 0) {
                    let host = stopped.remove(pos);
                    match self.restart(&host, now).await? {
                        Some(started) => {
                            spare = spare.add(&started.free());
                            report.started.push(started.id);
                        }
                        None => host_count = self.store.list_hosts()?.len() as u32,
                    }
                    continue;
                }

                let max_hosts = self.max_hosts();
                if host_count >= max_hosts {
                    debug!(%class, host_count, max_hosts, "host ceiling reached");
                    break;
                }
                if !self.creation_allowed(now, held.get(class) > 0) {
                    break;
                }

                match self.spawn_host(class, now, report).await {
                    Ok(host) => {
                        host_count += 1;
                        spare = spare.add(&host.free());
                    }
                    Err(PoolError::State(e)) => return Err(e.into()),
                    Err(e) => {
                        self.record_creation_failure(now, &e);
                        report.creation_failed = true;
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Power a stopped host back on. `None` if it could not be started.
    async fn restart(&self, host: &Host, now: u64) -> PoolResult<Option<Host>> {
        match self.provider.start_host(host).await {
            Ok(()) => {
                let started = self
                    .update_host(&host.id, |h| {
                        if h.state != HostState::Stopped {
                            return false;
                        }
                        h.state = HostState::Active;
                        h.state_entered_at = now;
                        h.idle_since = now;
                        true
                    })
                    .await?;
                if started.is_some() {
                    info!(host = %host.id, "stopped host restarted");
                }
                Ok(started)
            }
            Err(DriverError::InconsistentState(reason)) => {
                warn!(host = %host.id, reason = %reason, "stopped host vanished at the backend, dropping its record");
                self.store.delete_host(&host.id)?;
                self.forget_host_lock(&host.id);
                Ok(None)
            }
            Err(e) => {
                warn!(host = %host.id, error = %e, "could not restart stopped host");
                Ok(None)
            }
        }
    }

    async fn spawn_host(
        &self,
        class: SizeClass,
        now: u64,
        report: &mut TickReport,
    ) -> PoolResult<Host> {
        let flavor = self.policy.flavors.for_class(class);
        if flavor.slots.get(class) == 0 {
            return Err(PoolError::NoFlavor(class));
        }

        let id = generate_id("host", &flavor.name);
        let spec = HostSpec {
            name: format!("berth-{id}"),
            flavor: flavor.name.clone(),
            image: self.policy.host_image.clone(),
        };
        let created = self.provider.create_host(&spec).await?;

        let host = Host {
            id: id.clone(),
            name: spec.name,
            flavor: spec.flavor,
            state: HostState::Spawning,
            capacity: flavor.slots,
            occupied: SlotCounts::ZERO,
            placements: BTreeMap::new(),
            address: created.address,
            shutdown_mode: self.policy.shutdown_mode,
            created_at: now,
            state_entered_at: now,
            first_used_at: None,
            idle_since: now,
            error_count: 0,
            version: 0,
        };
        self.store.insert_host(&host)?;
        *guard(&self.creation) = CreationState::default();
        info!(host = %id, flavor = %host.flavor, %class, "host created");
        report.created.push(id.clone());

        // Prepared right away so the new slots are placeable this tick.
        self.prepare(&host, now, report).await?;
        Ok(self.store.get_host(&id)?.unwrap_or(host))
    }

    fn creation_allowed(&self, now: u64, demand_waiting: bool) -> bool {
        let mut creation = guard(&self.creation);
        if let Some(exhausted_at) = creation.exhausted_at {
            let retry_at = exhausted_at + self.policy.exhausted_retry_interval().as_secs();
            if demand_waiting && now >= retry_at {
                info!("pending demand, retrying host creation after earlier exhaustion");
                *creation = CreationState::default();
                return true;
            }
            return false;
        }
        now >= creation.next_attempt_at
    }

    fn record_creation_failure(&self, now: u64, err: &PoolError) {
        let mut creation = guard(&self.creation);
        creation.failures += 1;
        creation.last_error = Some(err.to_string());
        if creation.failures >= self.policy.creation_max_attempts {
            creation.exhausted_at = Some(now);
            error!(
                failures = creation.failures,
                error = %err,
                "host creation keeps failing, automatic growth stopped"
            );
        } else {
            let base = self.policy.creation_backoff_base().as_secs();
            let delay = base.saturating_mul(1u64 << (creation.failures - 1).min(20));
            creation.next_attempt_at = now + delay;
            warn!(
                attempt = creation.failures,
                retry_in_secs = delay,
                error = %err,
                "host creation failed"
            );
        }
    }

    /// Operator retry after creation was given up: clears the backoff and
    /// the error counts of hosts still waiting for preparation.
    pub async fn reset_host_errors(&self) -> PoolResult<()> {
        *guard(&self.creation) = CreationState::default();
        for host in self.store.list_hosts()? {
            if host.state != HostState::Spawning || host.error_count == 0 {
                continue;
            }
            self.update_host(&host.id, |h| {
                h.error_count = 0;
                true
            })
            .await?;
        }
        info!("host error counters reset");
        Ok(())
    }

    fn held_counts(&self) -> SlotCounts {
        let mut counts = SlotCounts::ZERO;
        for class in guard(&self.held).values() {
            *counts.get_mut(*class) += 1;
        }
        counts
    }

    pub fn snapshot(&self) -> PoolResult<PoolSnapshot> {
        let hosts = self.store.list_hosts()?;
        let mut hosts_by_state = BTreeMap::new();
        let mut capacity = SlotCounts::ZERO;
        let mut occupied = SlotCounts::ZERO;
        for host in &hosts {
            *hosts_by_state.entry(host.state.to_string()).or_insert(0) += 1;
            occupied = occupied.add(&host.occupied);
            if host.state == HostState::Active {
                capacity = capacity.add(&host.capacity);
            }
        }
        let creation = guard(&self.creation);
        Ok(PoolSnapshot {
            hosts: hosts.len(),
            hosts_by_state,
            capacity,
            occupied,
            free: placeable_free(&hosts),
            held: self.held_counts(),
            max_hosts: self.max_hosts(),
            creation_failures: creation.failures,
            creation_exhausted: creation.exhausted_at.is_some(),
            last_creation_error: creation.last_error.clone(),
        })
    }
}

/// Free slots on hosts that accept placements.
fn placeable_free(hosts: &[Host]) -> SlotCounts {
    hosts
        .iter()
        .filter(|h| h.state == HostState::Active)
        .fold(SlotCounts::ZERO, |acc, h| acc.add(&h.free()))
}

/// Free slots on hosts that accept placements or soon will.
fn provisioned_free(hosts: &[Host]) -> SlotCounts {
    hosts
        .iter()
        .filter(|h| matches!(h.state, HostState::Active | HostState::Spawning))
        .fold(SlotCounts::ZERO, |acc, h| acc.add(&h.free()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use berth_core::config::{FlavorConfig, FlavorMap};
    use berth_driver::MockHostProvider;

    fn policy(target: u32, max_hosts: u32) -> PoolPolicy {
        PoolPolicy {
            free_slot_target: SlotCounts::new(target, 0),
            max_hosts,
            flavors: FlavorMap {
                small: FlavorConfig {
                    name: "m1.small".to_string(),
                    slots: SlotCounts::new(4, 0),
                },
                large: FlavorConfig {
                    name: "m1.large".to_string(),
                    slots: SlotCounts::new(0, 2),
                },
            },
            idle_grace: "60s".to_string(),
            creation_backoff_base: "10s".to_string(),
            creation_max_attempts: 3,
            exhausted_retry_interval: "300s".to_string(),
            max_host_errors: 2,
            ..PoolPolicy::default()
        }
    }

    fn pool(policy: PoolPolicy) -> (HostPool, Arc<MockHostProvider>, StateStore) {
        let store = StateStore::open_in_memory().unwrap();
        let provider = Arc::new(MockHostProvider::new());
        let pool = HostPool::new(store.clone(), provider.clone(), policy);
        (pool, provider, store)
    }

    fn active_host(id: &str, small: u32, occupied: u32, created_at: u64) -> Host {
        Host {
            id: id.to_string(),
            name: format!("berth-{id}"),
            flavor: "m1.small".to_string(),
            state: HostState::Active,
            capacity: SlotCounts::new(small, 0),
            occupied: SlotCounts::new(occupied, 0),
            placements: (0..occupied)
                .map(|i| (format!("{id}-seed-{i}"), SizeClass::Small))
                .collect(),
            address: Some("10.1.0.1".to_string()),
            shutdown_mode: ShutdownMode::Terminate,
            created_at,
            state_entered_at: created_at,
            first_used_at: None,
            idle_since: created_at,
            error_count: 0,
            version: 0,
        }
    }

    #[tokio::test]
    async fn reserve_prefers_tightest_fit() {
        let (pool, _, store) = pool(policy(0, 5));
        store.insert_host(&active_host("roomy", 4, 0, 1)).unwrap();
        store.insert_host(&active_host("tight", 4, 3, 2)).unwrap();

        let r = pool.reserve("inst-1", SizeClass::Small, 10).await.unwrap();
        assert_eq!(r.host().unwrap().id, "tight");
        assert_eq!(r.host().unwrap().occupied.small, 4);
    }

    #[tokio::test]
    async fn reserve_breaks_ties_by_oldest_host() {
        let (pool, _, store) = pool(policy(0, 5));
        store.insert_host(&active_host("newer", 4, 1, 20)).unwrap();
        store.insert_host(&active_host("older", 4, 1, 10)).unwrap();

        let r = pool.reserve("inst-1", SizeClass::Small, 30).await.unwrap();
        assert_eq!(r.host().unwrap().id, "older");
    }

    #[tokio::test]
    async fn reserve_is_idempotent_per_instance() {
        let (pool, _, store) = pool(policy(0, 5));
        store.insert_host(&active_host("h1", 4, 0, 1)).unwrap();

        let first = pool.reserve("inst-1", SizeClass::Small, 10).await.unwrap();
        let second = pool.reserve("inst-1", SizeClass::Small, 11).await.unwrap();
        assert_eq!(first.host().unwrap().id, second.host().unwrap().id);
        assert_eq!(store.get_host("h1").unwrap().unwrap().occupied.small, 1);
        assert_eq!(
            store.get_host("h1").unwrap().unwrap().first_used_at,
            Some(10)
        );
    }

    #[tokio::test]
    async fn no_capacity_holds_the_request() {
        let (pool, _, store) = pool(policy(0, 5));
        store.insert_host(&active_host("full", 2, 2, 1)).unwrap();

        let r = pool.reserve("inst-1", SizeClass::Small, 10).await.unwrap();
        assert_eq!(r, Reservation::Held);
        assert_eq!(pool.snapshot().unwrap().held, SlotCounts::new(1, 0));

        assert!(pool.cancel_hold("inst-1"));
        assert_eq!(pool.snapshot().unwrap().held, SlotCounts::ZERO);
    }

    #[tokio::test]
    async fn release_is_idempotent_and_marks_idle() {
        let (pool, _, store) = pool(policy(0, 5));
        store.insert_host(&active_host("h1", 4, 0, 1)).unwrap();
        pool.reserve("inst-1", SizeClass::Small, 10).await.unwrap();

        assert!(pool.release("h1", "inst-1", 50).await.unwrap());
        assert!(!pool.release("h1", "inst-1", 51).await.unwrap());
        assert!(!pool.release("missing", "inst-1", 52).await.unwrap());

        let host = store.get_host("h1").unwrap().unwrap();
        assert!(host.is_empty());
        assert_eq!(host.idle_since, 50);
    }

    #[tokio::test]
    async fn concurrent_reservations_never_exceed_capacity() {
        let (pool, _, store) = pool(policy(0, 5));
        store.insert_host(&active_host("h1", 3, 0, 1)).unwrap();
        let pool = Arc::new(pool);

        let mut tasks = Vec::new();
        for i in 0..10 {
            let pool = Arc::clone(&pool);
            tasks.push(tokio::spawn(async move {
                pool.reserve(&format!("inst-{i}"), SizeClass::Small, 5)
                    .await
                    .unwrap()
            }));
        }
        let mut placed = 0;
        for task in tasks {
            if task.await.unwrap().host().is_some() {
                placed += 1;
            }
        }

        let host = store.get_host("h1").unwrap().unwrap();
        assert_eq!(placed, 3);
        assert_eq!(host.occupied.small, 3);
        assert_eq!(host.placements.len(), 3);
        assert_eq!(pool.snapshot().unwrap().held.small, 7);
    }

    #[tokio::test]
    async fn tick_creates_and_prepares_hosts_for_the_target() {
        let (pool, provider, _) = pool(policy(6, 5));

        let report = pool.tick(100).await.unwrap();
        assert_eq!(report.created.len(), 2);
        assert_eq!(report.prepared.len(), 2);
        assert_eq!(provider.created().len(), 2);

        let snapshot = pool.snapshot().unwrap();
        assert_eq!(snapshot.free.small, 8);
        assert_eq!(snapshot.hosts_by_state.get("active"), Some(&2));

        assert!(pool.tick(101).await.unwrap().is_idle());
    }

    #[tokio::test]
    async fn failed_preparation_retries_then_gives_up() {
        let (pool, provider, store) = pool(policy(1, 5));
        provider.fail_prepares(2);

        let report = pool.tick(100).await.unwrap();
        assert_eq!(report.created.len(), 1);
        assert!(report.prepared.is_empty());
        let host = store.list_hosts().unwrap().remove(0);
        assert_eq!(host.state, HostState::Spawning);
        assert_eq!(host.error_count, 1);

        // Second failure hits max_host_errors: the host goes inactive, is
        // destroyed, and a replacement is created in the same tick.
        let report = pool.tick(110).await.unwrap();
        assert_eq!(report.destroyed, vec![host.id.clone()]);
        assert_eq!(report.created.len(), 1);
        assert_eq!(report.prepared.len(), 1);
        assert_eq!(provider.destroyed(), vec![host.name]);
    }

    #[tokio::test]
    async fn creation_failures_back_off_then_exhaust() {
        let (pool, provider, _) = pool(policy(1, 5));
        provider.fail_creates(3);

        assert!(pool.tick(100).await.unwrap().creation_failed);
        // Backoff 10s after the first failure.
        assert!(!pool.tick(105).await.unwrap().creation_failed);
        assert!(pool.tick(110).await.unwrap().creation_failed);
        // Backoff 20s after the second.
        assert!(!pool.tick(125).await.unwrap().creation_failed);
        assert!(pool.tick(130).await.unwrap().creation_failed);

        let snapshot = pool.snapshot().unwrap();
        assert!(snapshot.creation_exhausted);
        assert_eq!(snapshot.creation_failures, 3);
        assert!(snapshot.last_creation_error.is_some());

        // Exhausted: no demand waiting, so nothing happens even much later.
        assert!(pool.tick(10_000).await.unwrap().is_idle());

        pool.reset_host_errors().await.unwrap();
        let report = pool.tick(10_001).await.unwrap();
        assert_eq!(report.created.len(), 1);
        assert!(!pool.snapshot().unwrap().creation_exhausted);
    }

    #[tokio::test]
    async fn pending_demand_retries_after_exhaustion_interval() {
        let mut p = policy(0, 5);
        p.creation_max_attempts = 1;
        let (pool, provider, _) = pool(p);
        provider.fail_creates(1);

        assert_eq!(
            pool.reserve("inst-1", SizeClass::Small, 100).await.unwrap(),
            Reservation::Held
        );
        assert!(pool.tick(100).await.unwrap().creation_failed);
        assert!(pool.snapshot().unwrap().creation_exhausted);

        assert!(pool.tick(200).await.unwrap().is_idle());
        let report = pool.tick(400).await.unwrap();
        assert_eq!(report.created.len(), 1);

        let r = pool.reserve("inst-1", SizeClass::Small, 401).await.unwrap();
        assert!(r.host().is_some());
        assert_eq!(pool.snapshot().unwrap().held, SlotCounts::ZERO);
    }

    #[tokio::test]
    async fn idle_hosts_above_target_are_retired_newest_first() {
        let (pool, provider, store) = pool(policy(4, 5));
        for (id, created) in [("old", 1), ("mid", 2), ("new", 3)] {
            let host = active_host(id, 4, 0, created);
            provider
                .create_host(&HostSpec {
                    name: host.name.clone(),
                    flavor: host.flavor.clone(),
                    image: "img".to_string(),
                })
                .await
                .unwrap();
            store.insert_host(&host).unwrap();
        }

        // Inside the grace period nothing is retired.
        assert!(pool.tick(30).await.unwrap().destroyed.is_empty());

        let report = pool.tick(100).await.unwrap();
        assert_eq!(report.destroyed, vec!["new".to_string(), "mid".to_string()]);
        assert_eq!(store.list_hosts().unwrap().len(), 1);
        assert_eq!(store.list_hosts().unwrap()[0].id, "old");
    }

    #[tokio::test]
    async fn occupied_hosts_are_never_retired() {
        let (pool, _, store) = pool(policy(0, 5));
        store.insert_host(&active_host("busy", 4, 1, 1)).unwrap();

        let report = pool.tick(10_000).await.unwrap();
        assert!(report.destroyed.is_empty());
        assert_eq!(store.list_hosts().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn host_lifetime_drains_used_hosts_only() {
        let mut p = policy(0, 5);
        p.host_lifetime = Some("100s".to_string());
        p.idle_grace = "1000s".to_string();
        let (pool, _, store) = pool(p);
        store.insert_host(&active_host("alpha", 4, 0, 1)).unwrap();
        store.insert_host(&active_host("beta", 4, 0, 1)).unwrap();

        pool.reserve("inst-1", SizeClass::Small, 10).await.unwrap();
        assert_eq!(pool.placement_of("inst-1").unwrap().unwrap().id, "alpha");

        let report = pool.tick(200).await.unwrap();
        assert_eq!(report.expired, vec!["alpha".to_string()]);
        // Still occupied, so it drains instead of being destroyed.
        assert!(report.destroyed.is_empty());
        assert_eq!(
            store.get_host("alpha").unwrap().unwrap().state,
            HostState::Inactive
        );

        // No new placements on an inactive host.
        let r = pool.reserve("inst-2", SizeClass::Small, 201).await.unwrap();
        assert_eq!(r.host().unwrap().id, "beta");

        pool.release("alpha", "inst-1", 210).await.unwrap();
        let report = pool.tick(211).await.unwrap();
        assert_eq!(report.destroyed, vec!["alpha".to_string()]);
    }

    #[tokio::test]
    async fn drain_retires_every_empty_host_and_stops_placing() {
        let (pool, _, store) = pool(policy(4, 5));
        store.insert_host(&active_host("a", 4, 0, 1)).unwrap();
        store.insert_host(&active_host("b", 4, 1, 2)).unwrap();

        pool.set_drain(true);
        let report = pool.tick(5).await.unwrap();
        assert_eq!(report.destroyed, vec!["a".to_string()]);
        assert!(report.created.is_empty());

        let r = pool.reserve("inst-1", SizeClass::Small, 6).await.unwrap();
        assert_eq!(r, Reservation::Held);
    }

    #[tokio::test]
    async fn housekeeping_lock_excludes_other_processes() {
        let (pool, _, store) = pool(policy(0, 5));
        assert!(
            store
                .try_lock(HOUSEKEEPING_LOCK, "someone-else", 3600, epoch_secs())
                .unwrap()
        );
        let report = pool.housekeeping(Duration::from_secs(5)).await.unwrap();
        assert!(report.is_none());

        store.unlock(HOUSEKEEPING_LOCK, "someone-else").unwrap();
        let report = pool.housekeeping(Duration::from_secs(5)).await.unwrap();
        assert!(report.is_some());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let (pool, _, _) = pool(policy(0, 5));
        let (tx, rx) = watch::channel(false);
        let pool = Arc::new(pool);
        let task = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.run(Duration::from_millis(10), rx).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
