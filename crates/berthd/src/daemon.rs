//! Daemon mode: open the store, assemble the orchestrator and serve until
//! Ctrl-C.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use berth_core::BerthConfig;
use berth_driver::drivers::OpenStackHostProvider;
use berth_driver::{CredentialStore, DriverRegistry, FileCredentialStore};
use berth_lifecycle::Orchestrator;
use berth_process::{CommandRunner, ProcessRunner};
use berth_state::StateStore;
use tokio::sync::watch;
use tracing::{error, info};

use crate::blueprints;

/// Configuration from `path` (or defaults), with `BERTH_*` overrides
/// applied and validated.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<BerthConfig> {
    let config = match path {
        Some(path) => BerthConfig::from_file(path)?,
        None => BerthConfig::default().with_env_overrides(std::env::vars())?,
    };
    config.validate()?;
    Ok(config)
}

pub async fn run(
    config_path: Option<PathBuf>,
    data_dir: PathBuf,
    blueprint_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    info!("berth daemon starting");
    let config = load_config(config_path.as_deref())?;

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("berth.redb");

    // ── State store ────────────────────────────────────────────────
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    if let Some(path) = blueprint_path {
        let loaded = blueprints::import(&store, &path)?;
        info!(path = ?path, count = loaded, "blueprints loaded");
    }

    // ── Drivers ────────────────────────────────────────────────────
    let credentials: Arc<dyn CredentialStore> =
        Arc::new(FileCredentialStore::new(&config.credentials.path));
    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new());
    let registry =
        DriverRegistry::from_config(&config, Arc::clone(&runner), Arc::clone(&credentials))?;

    // ── Orchestrator ───────────────────────────────────────────────
    let needs_pool = registry.needs_host_pool();
    let mut builder = Orchestrator::builder(
        config.clone(),
        store,
        registry,
        Arc::clone(&credentials),
    );
    if needs_pool {
        builder = builder.host_provider(Arc::new(OpenStackHostProvider::new(
            config.drivers.openstack.clone(),
            runner,
            credentials,
            config.engine.command_timeout(),
        )));
        info!(max_hosts = config.pool.max_hosts, "host pool enabled");
    }
    let orchestrator = builder.build()?;
    info!(
        concurrency = config.dispatch.concurrency,
        probe_interval = %config.health.probe_interval,
        "orchestrator initialized"
    );

    // ── Run until shutdown ─────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl-C handler");
            // Keep the sender alive so the engine is not stopped by the drop.
            std::future::pending::<()>().await;
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    orchestrator.run(shutdown_rx).await;
    info!("berth daemon stopped");
    Ok(())
}

/// Validate the configuration and the blueprint catalog against it, then
/// print the effective configuration.
pub fn check_config(
    config_path: Option<PathBuf>,
    blueprint_path: Option<PathBuf>,
) -> anyhow::Result<()> {
    let config = load_config(config_path.as_deref())?;
    if let Some(path) = blueprint_path {
        let catalog = blueprints::read(&path)?;
        blueprints::check_drivers(&catalog, &config)?;
        info!(path = ?path, count = catalog.len(), "blueprint catalog ok");
    }
    print!("{}", config.to_toml_string()?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_config(Some(&dir.path().join("absent.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn config_file_is_validated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("berth.toml");
        std::fs::write(&path, "[drivers]\nenabled = []\n").unwrap();
        let err = load_config(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("drivers.enabled"), "{err}");
    }
}
