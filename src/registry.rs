//! Catalog of configured apps and their assigned ports.
//!
//! Built once at startup and immutable afterwards; per-record mutable state
//! lives behind each [`AppRecord`]'s own lock, so lookups need no locking.

use crate::app::{AppRecord, AppState};
use crate::config::{AppConfig, AppsConfig};
use anyhow::Context;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Owner of every app record, including the management app
pub struct Registry {
    apps: Vec<Arc<AppRecord>>,
    ports: HashMap<String, u16>,
    config: AppsConfig,
    management: Arc<AppRecord>,
}

/// Snapshot served by `GET /apps`
#[derive(Debug, Serialize)]
pub struct RegistrySnapshot<'a> {
    pub cfg: &'a AppsConfig,
    pub ports: BTreeMap<&'a str, u16>,
    pub statuses: BTreeMap<&'a str, AppState>,
}

impl Registry {
    /// Build records from configuration, resolving code paths against the
    /// current working directory
    pub fn from_config(config: AppsConfig) -> anyhow::Result<Self> {
        let cwd = std::env::current_dir().context("Failed to determine working directory")?;
        Self::from_config_in(config, &cwd)
    }

    /// Build records with relative code paths resolved against `cwd`
    pub fn from_config_in(config: AppsConfig, cwd: &Path) -> anyhow::Result<Self> {
        config.validate()?;

        let mut apps = Vec::with_capacity(config.apps.len());
        let mut ports = HashMap::new();

        for (index, app_config) in config.apps.iter().enumerate() {
            let port = config
                .port_for(index)
                .ok_or_else(|| anyhow::anyhow!("No port available for app '{}'", app_config.name))?;
            let record = build_record(app_config, port, &config.server.python, cwd)?;
            ports.insert(record.id().to_string(), port);
            apps.push(Arc::new(record));
        }

        let management_port = config.server.management_port;
        let management = Arc::new(
            build_record(&config.ui, management_port, &config.server.python, cwd)
                .context("Invalid management app configuration")?,
        );
        ports.insert(management.id().to_string(), management_port);

        info!(
            app_count = apps.len(),
            base_port = config.server.base_port,
            management_port,
            "App registry built"
        );

        Ok(Self {
            apps,
            ports,
            config,
            management,
        })
    }

    /// Look up a regular app (the management app is not addressable here)
    pub fn get_app(&self, id: &str) -> Option<Arc<AppRecord>> {
        self.apps.iter().find(|a| a.id() == id).cloned()
    }

    pub fn get_app_config(&self, id: &str) -> Option<&AppConfig> {
        self.config.apps.iter().find(|a| a.name == id)
    }

    pub fn get_app_port(&self, id: &str) -> Option<u16> {
        self.ports.get(id).copied()
    }

    pub fn apps(&self) -> &[Arc<AppRecord>] {
        &self.apps
    }

    pub fn management(&self) -> &Arc<AppRecord> {
        &self.management
    }

    pub fn config(&self) -> &AppsConfig {
        &self.config
    }

    /// Configuration, ports and per-app state strings
    pub fn snapshot(&self) -> RegistrySnapshot<'_> {
        let ports = self.ports.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        let statuses = self
            .apps
            .iter()
            .chain(std::iter::once(&self.management))
            .map(|a| (a.id(), a.state()))
            .collect();
        RegistrySnapshot {
            cfg: &self.config,
            ports,
            statuses,
        }
    }
}

fn build_record(
    config: &AppConfig,
    port: u16,
    python: &str,
    cwd: &Path,
) -> anyhow::Result<AppRecord> {
    if config.route_path.is_none() {
        anyhow::bail!("App '{}': routePath not found in config", config.name);
    }
    let root_dir = config.root_dir(cwd)?;
    let command = config.resolve_command(port)?;
    Ok(AppRecord::new(
        &config.name,
        config.kind,
        root_dir,
        command,
        port,
        python,
    ))
}
