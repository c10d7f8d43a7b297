//! The capability contract every backend driver implements.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use berth_process::{CommandRecord, CommandSink};
use berth_state::{Blueprint, Host, Instance, LogLevel};
use serde::{Deserialize, Serialize};

use crate::credentials::CredentialStore;
use crate::error::DriverResult;

/// Boxed future returned by driver and host-provider methods.
pub type DriverFuture<'a, T> = Pin<Box<dyn Future<Output = DriverResult<T>> + Send + 'a>>;

/// Driver-specific reconfiguration parameters.
pub type ReconfigureParams = BTreeMap<String, String>;

/// What `query_status` observed at the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    /// Up and reachable.
    Running,
    /// Exists but is still starting.
    Pending,
    /// Exists but does not answer or reports an error.
    Unreachable,
    /// No backend resource exists for the instance.
    NotFound,
}

/// Successful provision or reconfigure.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProvisionOutcome {
    /// Backend metadata merged into the instance record.
    pub metadata: BTreeMap<String, String>,
}

impl ProvisionOutcome {
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Per-instance audit log that drivers write to.
pub trait InstanceLogSink: Send + Sync {
    fn write(&self, level: LogLevel, message: &str);

    fn info(&self, message: &str) {
        self.write(LogLevel::Info, message);
    }

    fn warn(&self, message: &str) {
        self.write(LogLevel::Warning, message);
    }
}

/// Adapts an [`InstanceLogSink`] to receive process audit records.
pub struct CommandLog<'a>(pub &'a dyn InstanceLogSink);

impl CommandSink for CommandLog<'_> {
    fn record(&self, record: &CommandRecord) {
        let level = if record.success() {
            LogLevel::Info
        } else {
            LogLevel::Error
        };
        self.0.write(level, &record.to_string());
    }
}

/// Discards everything.
pub struct NullLogSink;

impl InstanceLogSink for NullLogSink {
    fn write(&self, _level: LogLevel, _message: &str) {}
}

/// Keeps log lines in memory.
#[derive(Default)]
pub struct MemoryLogSink {
    lines: Mutex<Vec<(LogLevel, String)>>,
}

impl MemoryLogSink {
    pub fn lines(&self) -> Vec<(LogLevel, String)> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl InstanceLogSink for MemoryLogSink {
    fn write(&self, level: LogLevel, message: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((level, message.to_string()));
        }
    }
}

/// Everything a driver needs for one operation on one instance.
#[derive(Clone)]
pub struct DriverContext {
    pub instance: Instance,
    pub blueprint: Blueprint,
    /// Placed host, for pool-based drivers.
    pub host: Option<Host>,
    pub credentials: Arc<dyn CredentialStore>,
    pub log: Arc<dyn InstanceLogSink>,
}

impl DriverContext {
    /// Blueprint launch parameter by name.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.blueprint.config.get(key).map(String::as_str)
    }

    pub fn command_log(&self) -> CommandLog<'_> {
        CommandLog(self.log.as_ref())
    }
}

/// Backend driver.
///
/// Implementations must be safe to retry: `provision` finds and reuses a
/// resource an earlier attempt left behind (drivers key resources by
/// `instance.name`), and `deprovision` of a resource that never
/// materialized succeeds as a no-op.
pub trait Driver: Send + Sync {
    /// Registry name.
    fn name(&self) -> &'static str;

    /// Whether instances need a slot on a pool host before provisioning.
    fn uses_host_pool(&self) -> bool {
        false
    }

    fn provision<'a>(&'a self, ctx: &'a DriverContext) -> DriverFuture<'a, ProvisionOutcome>;

    fn deprovision<'a>(&'a self, ctx: &'a DriverContext) -> DriverFuture<'a, ()>;

    /// Side-effect-free probe of the backend resource.
    fn query_status<'a>(&'a self, ctx: &'a DriverContext) -> DriverFuture<'a, BackendStatus>;

    /// Drivers without reconfiguration support keep this default.
    fn reconfigure<'a>(
        &'a self,
        _ctx: &'a DriverContext,
        _params: &'a ReconfigureParams,
    ) -> DriverFuture<'a, ProvisionOutcome> {
        let name = self.name();
        Box::pin(async move {
            Err(crate::error::DriverError::Unsupported(format!(
                "{name} driver does not support reconfigure"
            )))
        })
    }
}
