use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::types::RingGeometry;

/// Where the bins look for the config when no path is given on the CLI.
pub const DEFAULT_CONFIG_PATH: &str = "config/config.toml";

/// Resolve the config location: first CLI argument if present, the default
/// path otherwise.
pub fn config_path_from_args() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Top-level application config — loaded from config/config.toml
#[derive(Debug, Deserialize)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub ring: RingConfig,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize)]
pub struct RingConfig {
    /// Name of the shared memory segment under /dev/shm.
    pub shm_name: String,
    pub packet_size: u32,
    pub num_buffers: u32,
}

impl RingConfig {
    pub fn geometry(&self) -> RingGeometry {
        RingGeometry::new(self.packet_size, self.num_buffers)
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {}", path.display()))?;
        let config: AppConfig = toml::from_str(&content)
            .with_context(|| format!("failed to parse config: {}", path.display()))?;
        Ok(config)
    }
}
