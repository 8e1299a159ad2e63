use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::models::BuildConfig;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/wharf/config.yml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerSettings {
    #[serde(default = "default_socket")]
    pub socket: String,
    #[serde(default)]
    pub autoupdate_images: bool,
    /// Seconds the engine waits before killing a stopping container.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: i64,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            socket: default_socket(),
            autoupdate_images: false,
            stop_timeout: default_stop_timeout(),
        }
    }
}

fn default_socket() -> String {
    "/var/run/docker.sock".to_string()
}

fn default_stop_timeout() -> i64 {
    10
}

fn default_data_path() -> PathBuf {
    PathBuf::from("/srv/wharf/servers")
}

fn default_log_dir() -> String {
    "/var/log/wharf".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerEntry {
    pub uuid: Uuid,
    pub container_id: String,
    pub build: BuildConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub docker: DockerSettings,
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            docker: DockerSettings::default(),
            data_path: default_data_path(),
            log_dir: default_log_dir(),
            servers: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// Reads the YAML file at `path`, then applies `WHARF_*` environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config = Self::from_yaml(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(socket) = lookup("WHARF_DOCKER_SOCKET") {
            self.docker.socket = socket;
        }
        if let Some(flag) = lookup("WHARF_AUTOUPDATE_IMAGES") {
            self.docker.autoupdate_images = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        if let Some(dir) = lookup("WHARF_LOG_DIR") {
            self.log_dir = dir;
        }
    }

    pub fn server(&self, uuid: Uuid) -> Option<&ServerEntry> {
        self.servers.iter().find(|s| s.uuid == uuid)
    }

    pub fn server_data_path(&self, uuid: Uuid) -> PathBuf {
        self.data_path.join(uuid.to_string())
    }
}
