//! Static registry of named drivers, resolved once at start-up.

use std::collections::BTreeMap;
use std::sync::Arc;

use berth_core::BerthConfig;
use berth_process::CommandRunner;
use thiserror::Error;
use tracing::info;

use crate::credentials::CredentialStore;
use crate::driver::Driver;
use crate::drivers::{DockerDriver, DummyDriver, KubernetesDriver, OpenStackDriver};

/// Names accepted in `[drivers] enabled`.
pub const KNOWN_DRIVERS: [&str; 4] = ["dummy", "docker", "openstack", "kubernetes"];

#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("unknown driver {0:?} (known: dummy, docker, openstack, kubernetes)")]
    UnknownDriver(String),
}

#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: BTreeMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry from `[drivers] enabled`.
    pub fn from_config(
        config: &BerthConfig,
        runner: Arc<dyn CommandRunner>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Result<Self, RegistryError> {
        let timeout = config.engine.command_timeout();
        let drivers = &config.drivers;
        let mut registry = Self::new();
        for name in &drivers.enabled {
            let driver: Arc<dyn Driver> = match name.as_str() {
                "dummy" => Arc::new(DummyDriver::new()),
                "docker" => Arc::new(DockerDriver::new(
                    drivers.docker.clone(),
                    Arc::clone(&runner),
                    timeout,
                )),
                "openstack" => Arc::new(OpenStackDriver::new(
                    drivers.openstack.clone(),
                    Arc::clone(&runner),
                    Arc::clone(&credentials),
                    timeout,
                )),
                "kubernetes" => Arc::new(KubernetesDriver::new(
                    drivers.kubernetes.clone(),
                    Arc::clone(&runner),
                    timeout,
                )),
                other => return Err(RegistryError::UnknownDriver(other.to_string())),
            };
            registry.register(driver);
        }
        info!(drivers = ?registry.names(), "driver registry built");
        Ok(registry)
    }

    /// Register under the driver's own name.
    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        let name = driver.name().to_string();
        self.drivers.insert(name, driver);
    }

    /// Register under an explicit name.
    pub fn register_as(&mut self, name: &str, driver: Arc<dyn Driver>) {
        self.drivers.insert(name.to_string(), driver);
    }

    pub fn with(mut self, name: &str, driver: Arc<dyn Driver>) -> Self {
        self.register_as(name, driver);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Driver>> {
        self.drivers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.drivers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.drivers.keys().map(String::as_str).collect()
    }

    /// Whether any registered driver places instances on pool hosts.
    pub fn needs_host_pool(&self) -> bool {
        self.drivers.values().any(|d| d.uses_host_pool())
    }
}
