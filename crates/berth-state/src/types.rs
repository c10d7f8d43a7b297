//! Record types persisted in the Berth store.
//!
//! Instances and hosts are the mutable records; blueprints are written by
//! the surrounding application and only read by the engine.

use std::collections::BTreeMap;
use std::fmt;

use berth_core::{BlueprintId, HostId, InstanceId, ShutdownMode, SizeClass, SlotCounts};
use serde::{Deserialize, Serialize};

// ── Instance ──────────────────────────────────────────────────────

/// Lifecycle state of a provisioned workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Requested,
    Provisioning,
    Retrying,
    Running,
    Reconfiguring,
    Deprovisioning,
    Failed,
    Deleted,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Requested => "requested",
            InstanceState::Provisioning => "provisioning",
            InstanceState::Retrying => "retrying",
            InstanceState::Running => "running",
            InstanceState::Reconfiguring => "reconfiguring",
            InstanceState::Deprovisioning => "deprovisioning",
            InstanceState::Failed => "failed",
            InstanceState::Deleted => "deleted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, InstanceState::Deleted)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A provisioned workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instance {
    pub id: InstanceId,
    /// Backend resource name, derived from the id.
    pub name: String,
    pub blueprint_id: BlueprintId,
    pub owner: String,
    /// Registry name of the driver handling this instance.
    pub driver: String,
    pub size_class: SizeClass,
    pub state: InstanceState,
    /// Unix timestamp when `state` was entered.
    pub state_entered_at: u64,
    pub last_error: Option<String>,
    /// Provisioning attempts in the current respawn round.
    pub attempts: u32,
    /// Automatic respawns consumed so far.
    pub respawn_count: u32,
    /// Backend metadata reported by the driver (address, resource ids).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Pool host holding this instance's slot.
    pub host_id: Option<HostId>,
    /// Set once a user asked for deletion; never cleared.
    #[serde(default)]
    pub deletion_requested: bool,
    pub created_at: u64,
    pub provisioned_at: Option<u64>,
    pub deprovisioned_at: Option<u64>,
    /// First failed health probe of the current unreachable streak.
    pub health_failing_since: Option<u64>,
    /// Compare-and-swap counter, bumped by every store write.
    #[serde(default)]
    pub version: u64,
}

impl Instance {
    /// A fresh record in the `requested` state.
    pub fn new(
        id: InstanceId,
        name: String,
        blueprint: &Blueprint,
        owner: &str,
        now: u64,
    ) -> Self {
        Self {
            id,
            name,
            blueprint_id: blueprint.id.clone(),
            owner: owner.to_string(),
            driver: blueprint.driver.clone(),
            size_class: blueprint.size_class,
            state: InstanceState::Requested,
            state_entered_at: now,
            last_error: None,
            attempts: 0,
            respawn_count: 0,
            metadata: BTreeMap::new(),
            host_id: None,
            deletion_requested: false,
            created_at: now,
            provisioned_at: None,
            deprovisioned_at: None,
            health_failing_since: None,
            version: 0,
        }
    }

    /// Move to `state`, stamping the entry time.
    pub fn enter(&mut self, state: InstanceState, now: u64) {
        self.state = state;
        self.state_entered_at = now;
    }
}

/// Filter for [`crate::StateStore::list_instances`].
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub include_deleted: bool,
    pub owner: Option<String>,
    pub state: Option<InstanceState>,
}

impl InstanceFilter {
    pub fn matches(&self, instance: &Instance) -> bool {
        if !self.include_deleted && instance.state == InstanceState::Deleted {
            return false;
        }
        if let Some(owner) = &self.owner
            && &instance.owner != owner
        {
            return false;
        }
        if let Some(state) = self.state
            && instance.state != state
        {
            return false;
        }
        true
    }
}

// ── Host ──────────────────────────────────────────────────────────

/// Pool host state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    /// Created at the backend, awaiting preparation.
    Spawning,
    /// Accepting placements.
    Active,
    /// No new placements; retired once empty.
    Inactive,
    /// Powered off for reuse; still counts against the host ceiling.
    Stopped,
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HostState::Spawning => "spawning",
            HostState::Active => "active",
            HostState::Inactive => "inactive",
            HostState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// A backend compute node serving pool-based drivers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Host {
    pub id: HostId,
    /// Backend resource name.
    pub name: String,
    pub flavor: String,
    pub state: HostState,
    pub capacity: SlotCounts,
    pub occupied: SlotCounts,
    /// Instances holding a slot on this host.
    #[serde(default)]
    pub placements: BTreeMap<InstanceId, SizeClass>,
    /// Address the driver uses to reach the host.
    pub address: Option<String>,
    pub shutdown_mode: ShutdownMode,
    pub created_at: u64,
    pub state_entered_at: u64,
    /// First placement ever made on this host; lifetime counts from here.
    pub first_used_at: Option<u64>,
    /// Last time the host went from occupied to empty (or was created).
    pub idle_since: u64,
    /// Consecutive preparation failures.
    #[serde(default)]
    pub error_count: u32,
    #[serde(default)]
    pub version: u64,
}

impl Host {
    pub fn free(&self) -> SlotCounts {
        self.capacity.saturating_sub(&self.occupied)
    }

    pub fn is_empty(&self) -> bool {
        self.occupied.is_zero()
    }

    pub fn can_place(&self, class: SizeClass) -> bool {
        self.state == HostState::Active && self.free().get(class) > 0
    }
}

// ── Blueprint ─────────────────────────────────────────────────────

/// Template describing what to launch. Read-only to the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Blueprint {
    pub id: BlueprintId,
    pub name: String,
    /// Registry name of the driver ("dummy", "docker", ...).
    pub driver: String,
    pub size_class: SizeClass,
    pub image: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Seconds a running instance may live before it is deleted.
    pub max_lifetime: Option<u64>,
    /// Driver launch parameters.
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

// ── Provisioning logs ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogType {
    Provisioning,
    Deprovisioning,
    Housekeeping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// One audit line for an instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceLog {
    pub instance_id: InstanceId,
    pub seq: u64,
    pub log_type: LogType,
    pub level: LogLevel,
    pub timestamp: u64,
    pub message: String,
}

// ── Locks ─────────────────────────────────────────────────────────

/// Advisory lock entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LockRecord {
    pub holder: String,
    pub expires_at: u64,
}
