use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use uuid::Uuid;

/// Agent configuration, loaded from a TOML file at startup.
///
/// Node role flags and network modes live on the node record in the
/// document store; the file only identifies this node and the local
/// filesystem layout.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Identity of this node in the document store.
    pub node_id: Uuid,
    /// Root for disk images and instance data.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Directory scanned for running-instance marker files.
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
    /// Seconds between image-catalog syncs per object store.
    #[serde(default = "default_storage_sync_secs")]
    pub storage_sync_secs: u64,
    /// Document store URI. The driver is an external integration;
    /// leave empty to run against the in-process store.
    #[serde(default)]
    pub database_uri: String,
    /// Emit JSON logs instead of human-readable output.
    #[serde(default)]
    pub log_json: bool,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/hna")
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("/var/run")
}

fn default_storage_sync_secs() -> u64 {
    90
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: AgentConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }
}
