//! Blueprint catalog files.
//!
//! ```toml
//! [[blueprint]]
//! id = "web"
//! name = "web server"
//! driver = "docker"
//! size_class = "small"
//! image = "nginx:1.27"
//!
//! [blueprint.config]
//! port = "80"
//! ```

use std::path::Path;

use anyhow::{Context, bail};
use berth_core::BerthConfig;
use berth_state::{Blueprint, StateStore};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct Catalog {
    #[serde(default, rename = "blueprint")]
    blueprints: Vec<Blueprint>,
}

pub fn parse(content: &str) -> anyhow::Result<Vec<Blueprint>> {
    let catalog: Catalog = toml::from_str(content)?;
    let mut seen = std::collections::BTreeSet::new();
    for bp in &catalog.blueprints {
        if bp.id.is_empty() {
            bail!("blueprint with empty id");
        }
        if !seen.insert(bp.id.as_str()) {
            bail!("duplicate blueprint id {}", bp.id);
        }
    }
    Ok(catalog.blueprints)
}

pub fn read(path: &Path) -> anyhow::Result<Vec<Blueprint>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read blueprint catalog {}", path.display()))?;
    parse(&content).with_context(|| format!("invalid blueprint catalog {}", path.display()))
}

/// Every enabled blueprint must name a driver the configuration enables.
pub fn check_drivers(catalog: &[Blueprint], config: &BerthConfig) -> anyhow::Result<()> {
    for bp in catalog.iter().filter(|bp| bp.enabled) {
        if !config.drivers.enabled.contains(&bp.driver) {
            bail!(
                "blueprint {} uses driver {:?}, which is not enabled",
                bp.id,
                bp.driver
            );
        }
    }
    Ok(())
}

/// Upsert every blueprint in the file. Returns how many were written.
pub fn import(store: &StateStore, path: &Path) -> anyhow::Result<usize> {
    let catalog = read(path)?;
    for bp in &catalog {
        store.put_blueprint(bp)?;
    }
    Ok(catalog.len())
}
