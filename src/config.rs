use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Placeholder in command templates replaced by the assigned port
pub const PORT_PLACEHOLDER: &str = "${PORT}";

/// Top-level configuration document
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppsConfig {
    /// Document version (informational)
    #[serde(default)]
    pub version: String,

    /// Apps to supervise, in port assignment order
    pub apps: Vec<AppConfig>,

    /// The management UI app
    pub ui: AppConfig,

    /// Repositories to stage before launch
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub repos: Vec<RepoConfig>,

    /// Gateway settings
    #[serde(default)]
    pub server: ServerConfig,
}

/// Gateway-wide settings
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port the gateway listens on (default: 8000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Fixed port of the management app (default: 7999)
    #[serde(default = "default_management_port")]
    pub management_port: u16,

    /// First port handed out to apps (default: 8001)
    #[serde(default = "default_base_port")]
    pub base_port: u16,

    /// Maximum number of concurrently active apps (default: 5)
    #[serde(default = "default_max_running")]
    pub max_running: usize,

    /// X-Forwarded-Host value used when the caller sent none
    #[serde(default = "default_forwarded_host")]
    pub default_forwarded_host: String,

    /// Python interpreter used to create virtual environments
    #[serde(default = "default_python")]
    pub python: String,

    /// Directory whose contents are copied into the management app's code path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_assets: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            management_port: default_management_port(),
            base_port: default_base_port(),
            max_running: default_max_running(),
            default_forwarded_host: default_forwarded_host(),
            python: default_python(),
            ui_assets: None,
        }
    }
}

/// Runtime family of an app
#[derive(Debug, Deserialize, Serialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AppKind {
    /// Runs inside a per-app virtual environment (default)
    #[default]
    Python,
    R,
    Nodejs,
}

impl AppKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AppKind::Python => "python",
            AppKind::R => "r",
            AppKind::Nodejs => "nodejs",
        }
    }
}

impl std::fmt::Display for AppKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Display-only metadata
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Meta {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Configuration for a single app
///
/// # Security Warning
///
/// `command` is run through `bash -c` with the permissions of the gateway.
/// Configuration files must come from trusted sources only.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Unique identifier, also the routing segment under /relay/
    pub name: String,

    /// Command template; `${PORT}` is replaced by the assigned port
    pub command: String,

    pub route_path: Option<String>,

    /// Source directory, relative paths resolve against the working directory
    pub code_path: Option<String>,

    /// Forward `/relay/<name><path>` instead of just `<path>`
    #[serde(default, skip_serializing_if = "is_false")]
    pub pass_full_proxy_path: bool,

    #[serde(default, rename = "type")]
    pub kind: AppKind,

    #[serde(default)]
    pub meta: Option<Meta>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl AppConfig {
    /// Create a new app config with defaults
    pub fn new(name: &str, command: &str, code_path: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            route_path: Some(format!("/{}", name)),
            code_path: Some(code_path.to_string()),
            pass_full_proxy_path: false,
            kind: AppKind::Python,
            meta: None,
        }
    }

    /// Substitute the port and split the command into an argument vector
    pub fn resolve_command(&self, port: u16) -> anyhow::Result<Vec<String>> {
        let command = self.command.replace(PORT_PLACEHOLDER, &port.to_string());
        let words = shell_words::split(&command)
            .map_err(|e| anyhow::anyhow!("App '{}': invalid command: {}", self.name, e))?;
        if words.is_empty() {
            anyhow::bail!("App '{}': no commands found", self.name);
        }
        Ok(words)
    }

    /// Absolute source directory, resolved against `cwd` when relative
    pub fn root_dir(&self, cwd: &Path) -> anyhow::Result<PathBuf> {
        let code_path = self
            .code_path
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("App '{}': codePath not found in config", self.name))?;
        let path = PathBuf::from(code_path);
        Ok(if path.is_absolute() { path } else { cwd.join(path) })
    }

    /// Validate this app's configuration
    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("name must not be empty".to_string());
        } else if self.name.contains('/') {
            errors.push("name must not contain '/'".to_string());
        }
        if self.route_path.is_none() {
            errors.push("routePath not found in config".to_string());
        }
        if self.code_path.is_none() {
            errors.push("codePath not found in config".to_string());
        }
        if let Err(e) = self.resolve_command(0) {
            errors.push(e.to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(format!("App '{}': {}", self.name, errors.join(", ")))
        }
    }
}

/// A repository checked out at a pinned revision before launch
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RepoConfig {
    pub url: String,
    pub hash: String,
    pub target_dir: String,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    8000
}

fn default_management_port() -> u16 {
    7999
}

fn default_base_port() -> u16 {
    8001
}

fn default_max_running() -> usize {
    5
}

fn default_forwarded_host() -> String {
    "localhost:8000".to_string()
}

fn default_python() -> String {
    "python".to_string()
}

impl AppsConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: AppsConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Port assigned to the app at `index` in `apps`
    pub fn port_for(&self, index: usize) -> Option<u16> {
        u16::try_from(index)
            .ok()
            .and_then(|i| self.server.base_port.checked_add(i))
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();

        for app in &self.apps {
            if let Err(e) = app.validate() {
                errors.push(e);
            }
            if !seen.insert(app.name.as_str()) {
                errors.push(format!("App '{}': duplicate name", app.name));
            }
        }

        if let Err(e) = self.ui.validate() {
            errors.push(format!("ui: {}", e));
        }

        if self.server.max_running == 0 {
            errors.push("server.maxRunning must be at least 1".to_string());
        }

        for index in 0..self.apps.len() {
            match self.port_for(index) {
                None => {
                    errors.push(format!(
                        "server.basePort {} leaves no room for {} apps",
                        self.server.base_port,
                        self.apps.len()
                    ));
                    break;
                }
                Some(port) if port == self.server.management_port => {
                    errors.push(format!(
                        "App '{}': assigned port {} collides with the management port",
                        self.apps[index].name, port
                    ));
                }
                Some(port) if port == self.server.port => {
                    errors.push(format!(
                        "App '{}': assigned port {} collides with the gateway port",
                        self.apps[index].name, port
                    ));
                }
                Some(_) => {}
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
