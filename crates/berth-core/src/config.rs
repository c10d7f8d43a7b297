//! berth.toml configuration parser.
//!
//! Every field has a default so an empty file is a valid configuration.
//! Durations are human strings ("30s", "5m") resolved through
//! [`parse_duration`]; call [`BerthConfig::validate`] after loading.
//!
//! Any scalar key can be overridden from the environment with
//! `BERTH_<SECTION>_<KEY>`, e.g. `BERTH_POOL_MAX_HOSTS=6` or
//! `BERTH_POOL_FREE_SLOT_TARGET_SMALL=2`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{parse_duration, ShutdownMode, SizeClass, SlotCounts};

const ENV_PREFIX: &str = "BERTH_";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid environment override {var}: {reason}")]
    Env { var: String, reason: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BerthConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub pool: PoolPolicy,
    #[serde(default)]
    pub health: HealthPolicy,
    #[serde(default)]
    pub drivers: DriversConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
}

/// Lifecycle state machine settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Provisioning attempts before a transient failure becomes `failed`.
    pub provision_retry_budget: u32,
    /// How long an instance may sit in `provisioning` before it is stuck.
    pub stuck_timeout: String,
    /// Automatic respawns per instance before an operator must step in.
    pub respawn_limit: u32,
    /// Base delay for retry backoff of failed operations.
    pub retry_backoff_base: String,
    /// Backoff ceiling, also used for deprovision retries.
    pub retry_backoff_max: String,
    /// Timeout applied to each external command a driver runs.
    pub command_timeout: String,
    /// Prefix for generated backend resource names.
    pub instance_name_prefix: String,
    /// Persist per-instance provisioning logs in the record store.
    pub write_provisioning_logs: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            provision_retry_budget: 3,
            stuck_timeout: "15m".to_string(),
            respawn_limit: 2,
            retry_backoff_base: "5s".to_string(),
            retry_backoff_max: "5m".to_string(),
            command_timeout: "10m".to_string(),
            instance_name_prefix: "pb-".to_string(),
            write_provisioning_logs: true,
        }
    }
}

impl EngineConfig {
    pub fn stuck_timeout(&self) -> Duration {
        parse_duration(&self.stuck_timeout).unwrap_or(Duration::from_secs(15 * 60))
    }

    pub fn retry_backoff_base(&self) -> Duration {
        parse_duration(&self.retry_backoff_base).unwrap_or(Duration::from_secs(5))
    }

    pub fn retry_backoff_max(&self) -> Duration {
        parse_duration(&self.retry_backoff_max).unwrap_or(Duration::from_secs(300))
    }

    pub fn command_timeout(&self) -> Duration {
        parse_duration(&self.command_timeout).unwrap_or(Duration::from_secs(600))
    }
}

/// Dispatch queue settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Global ceiling on concurrently executing operations.
    pub concurrency: usize,
    /// How often idle workers re-scan the queue for held tasks.
    pub poll_interval: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: "250ms".to_string(),
        }
    }
}

impl DispatchConfig {
    pub fn poll_interval(&self) -> Duration {
        parse_duration(&self.poll_interval).unwrap_or(Duration::from_millis(250))
    }
}

/// A host flavor and the slots it provides per size class.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlavorConfig {
    pub name: String,
    pub slots: SlotCounts,
}

/// Flavor used when the pool grows for each size class.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlavorMap {
    pub small: FlavorConfig,
    pub large: FlavorConfig,
}

impl FlavorMap {
    pub fn for_class(&self, class: SizeClass) -> &FlavorConfig {
        match class {
            SizeClass::Small => &self.small,
            SizeClass::Large => &self.large,
        }
    }
}

impl Default for FlavorMap {
    fn default() -> Self {
        Self {
            small: FlavorConfig {
                name: "standard.medium".to_string(),
                slots: SlotCounts::new(6, 0),
            },
            large: FlavorConfig {
                name: "standard.xlarge".to_string(),
                slots: SlotCounts::new(0, 24),
            },
        }
    }
}

/// Host pool policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolPolicy {
    /// Scheduling tick interval for pool housekeeping.
    pub tick_interval: String,
    /// Desired spare capacity per size class.
    pub free_slot_target: SlotCounts,
    /// Hard ceiling on hosts, stopped hosts included.
    pub max_hosts: u32,
    pub flavors: FlavorMap,
    /// Image used for newly created hosts.
    pub host_image: String,
    pub shutdown_mode: ShutdownMode,
    /// How long an empty host is kept before retirement.
    pub idle_grace: String,
    /// Recycle hosts this long after their first placement.
    pub host_lifetime: Option<String>,
    /// Preparation failures before a host is given up.
    pub max_host_errors: u32,
    /// Base delay for host creation retries.
    pub creation_backoff_base: String,
    /// Creation attempts before automatic growth stops.
    pub creation_max_attempts: u32,
    /// After exhaustion, how long until pending demand may retry creation.
    pub exhausted_retry_interval: String,
    /// Retire every empty host and ignore the free-slot target.
    pub drain: bool,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            tick_interval: "5s".to_string(),
            free_slot_target: SlotCounts::new(4, 0),
            max_hosts: 4,
            flavors: FlavorMap::default(),
            host_image: "CentOS-7.0".to_string(),
            shutdown_mode: ShutdownMode::Terminate,
            idle_grace: "10m".to_string(),
            host_lifetime: None,
            max_host_errors: 5,
            creation_backoff_base: "30s".to_string(),
            creation_max_attempts: 5,
            exhausted_retry_interval: "10m".to_string(),
            drain: false,
        }
    }
}

impl PoolPolicy {
    pub fn tick_interval(&self) -> Duration {
        parse_duration(&self.tick_interval).unwrap_or(Duration::from_secs(5))
    }

    pub fn idle_grace(&self) -> Duration {
        parse_duration(&self.idle_grace).unwrap_or(Duration::from_secs(600))
    }

    pub fn host_lifetime(&self) -> Option<Duration> {
        self.host_lifetime.as_deref().and_then(parse_duration)
    }

    pub fn creation_backoff_base(&self) -> Duration {
        parse_duration(&self.creation_backoff_base).unwrap_or(Duration::from_secs(30))
    }

    pub fn exhausted_retry_interval(&self) -> Duration {
        parse_duration(&self.exhausted_retry_interval).unwrap_or(Duration::from_secs(600))
    }
}

/// Health probe settings for running instances.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthPolicy {
    /// Interval between probe rounds (also drives stuck detection).
    pub probe_interval: String,
    /// How long a running instance may stay unreachable before it fails.
    pub unreachable_grace: String,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            probe_interval: "30s".to_string(),
            unreachable_grace: "3m".to_string(),
        }
    }
}

impl HealthPolicy {
    pub fn probe_interval(&self) -> Duration {
        parse_duration(&self.probe_interval).unwrap_or(Duration::from_secs(30))
    }

    pub fn unreachable_grace(&self) -> Duration {
        parse_duration(&self.unreachable_grace).unwrap_or(Duration::from_secs(180))
    }
}

/// Driver registry settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DriversConfig {
    /// Names of drivers resolved into the registry at start-up.
    pub enabled: Vec<String>,
    pub docker: DockerSettings,
    pub openstack: OpenStackSettings,
    pub kubernetes: KubernetesSettings,
}

impl Default for DriversConfig {
    fn default() -> Self {
        Self {
            enabled: vec!["dummy".to_string()],
            docker: DockerSettings::default(),
            openstack: OpenStackSettings::default(),
            kubernetes: KubernetesSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DockerSettings {
    pub binary: String,
    /// Port the docker daemon listens on at each pool host.
    pub daemon_port: u16,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            daemon_port: 2375,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OpenStackSettings {
    pub binary: String,
    /// Network attached to created servers.
    pub network: Option<String>,
    /// Security group attached to pool hosts.
    pub host_security_group: String,
    /// Script run over SSH to prepare a fresh pool host.
    pub host_prepare_script: Option<PathBuf>,
}

impl Default for OpenStackSettings {
    fn default() -> Self {
        Self {
            binary: "openstack".to_string(),
            network: None,
            host_security_group: "pb_server".to_string(),
            host_prepare_script: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KubernetesSettings {
    pub binary: String,
    pub namespace: String,
    pub context: Option<String>,
}

impl Default for KubernetesSettings {
    fn default() -> Self {
        Self {
            binary: "kubectl".to_string(),
            namespace: "default".to_string(),
            context: None,
        }
    }
}

/// Machine-to-machine credential store location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CredentialsConfig {
    pub path: PathBuf,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/run/berth_m2m.json"),
        }
    }
}

impl BerthConfig {
    /// Load a config file and apply environment overrides.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        config.with_env_overrides(std::env::vars())
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply `BERTH_<SECTION>_<KEY>` overrides from the given variables.
    ///
    /// Values are coerced to the type of the key they replace. Variables
    /// that match no known key are ignored.
    pub fn with_env_overrides<I>(self, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut root = toml::Value::try_from(&self)?;
        let mut touched = false;

        for (var, raw) in vars {
            let Some(path) = var.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let path = path.to_ascii_lowercase();
            let Some(table) = root.as_table_mut() else {
                continue;
            };
            match set_by_env_path(table, &path, &raw) {
                Ok(true) => touched = true,
                Ok(false) => {}
                Err(reason) => return Err(ConfigError::Env { var, reason }),
            }
        }

        if !touched {
            return Ok(self);
        }
        Ok(root.try_into()?)
    }

    /// Reject values that would make the engine misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let durations = [
            ("engine.stuck_timeout", Some(&self.engine.stuck_timeout)),
            ("engine.retry_backoff_base", Some(&self.engine.retry_backoff_base)),
            ("engine.retry_backoff_max", Some(&self.engine.retry_backoff_max)),
            ("engine.command_timeout", Some(&self.engine.command_timeout)),
            ("dispatch.poll_interval", Some(&self.dispatch.poll_interval)),
            ("pool.tick_interval", Some(&self.pool.tick_interval)),
            ("pool.idle_grace", Some(&self.pool.idle_grace)),
            ("pool.host_lifetime", self.pool.host_lifetime.as_ref()),
            ("pool.creation_backoff_base", Some(&self.pool.creation_backoff_base)),
            ("pool.exhausted_retry_interval", Some(&self.pool.exhausted_retry_interval)),
            ("health.probe_interval", Some(&self.health.probe_interval)),
            ("health.unreachable_grace", Some(&self.health.unreachable_grace)),
        ];
        for (key, value) in durations {
            if let Some(value) = value
                && parse_duration(value).is_none()
            {
                return Err(ConfigError::Invalid(format!(
                    "{key}: cannot parse duration {value:?}"
                )));
            }
        }

        if self.dispatch.concurrency == 0 {
            return Err(ConfigError::Invalid(
                "dispatch.concurrency must be at least 1".to_string(),
            ));
        }
        if self.engine.provision_retry_budget == 0 {
            return Err(ConfigError::Invalid(
                "engine.provision_retry_budget must be at least 1".to_string(),
            ));
        }
        for class in SizeClass::ALL {
            let target = self.pool.free_slot_target.get(class);
            let flavor = self.pool.flavors.for_class(class);
            if target > 0 && flavor.slots.get(class) == 0 {
                return Err(ConfigError::Invalid(format!(
                    "pool.flavors.{class} provides no {class} slots but the free-slot target is {target}"
                )));
            }
        }
        if self.drivers.enabled.is_empty() {
            return Err(ConfigError::Invalid(
                "drivers.enabled must name at least one driver".to_string(),
            ));
        }
        Ok(())
    }
}

/// Walk `path` (underscore-joined keys) into `table` and replace the leaf.
///
/// Returns `Ok(false)` if no key matches. Keys may themselves contain
/// underscores, so every table key that is a prefix of the path is tried.
fn set_by_env_path(
    table: &mut toml::map::Map<String, toml::Value>,
    path: &str,
    raw: &str,
) -> Result<bool, String> {
    if let Some(existing) = table.get_mut(path) {
        if existing.is_table() {
            return Ok(false);
        }
        *existing = coerce(existing, raw)?;
        return Ok(true);
    }

    let keys: Vec<String> = table.keys().cloned().collect();
    for key in keys {
        let Some(rest) = path
            .strip_prefix(key.as_str())
            .and_then(|r| r.strip_prefix('_'))
        else {
            continue;
        };
        if let Some(toml::Value::Table(inner)) = table.get_mut(&key)
            && set_by_env_path(inner, rest, raw)?
        {
            return Ok(true);
        }
    }
    Ok(false)
}

fn coerce(existing: &toml::Value, raw: &str) -> Result<toml::Value, String> {
    let raw = raw.trim();
    match existing {
        toml::Value::Integer(_) => raw
            .parse::<i64>()
            .map(toml::Value::Integer)
            .map_err(|e| format!("expected integer: {e}")),
        toml::Value::Boolean(_) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(toml::Value::Boolean(true)),
            "0" | "false" | "no" | "off" => Ok(toml::Value::Boolean(false)),
            other => Err(format!("expected boolean, got {other:?}")),
        },
        toml::Value::Float(_) => raw
            .parse::<f64>()
            .map(toml::Value::Float)
            .map_err(|e| format!("expected float: {e}")),
        toml::Value::Array(_) => Ok(toml::Value::Array(
            raw.split([',', ' '])
                .filter(|s| !s.is_empty())
                .map(|s| toml::Value::String(s.to_string()))
                .collect(),
        )),
        _ => Ok(toml::Value::String(raw.to_string())),
    }
}
