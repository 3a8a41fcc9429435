//! Configuration for objectstore

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::queue::QueueConfig;

/// Default debounce interval between a write call and its disk write (4s)
pub const DEFAULT_WRITE_INTERVAL_MS: u64 = 4_000;

/// Default worker idle time before the thread exits (60s)
pub const DEFAULT_KEEP_ALIVE_MS: u64 = 60_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the `<name>.obj` files
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,

    /// Minimum interval between a write call and the disk write; later writes restart it
    #[serde(default = "default_write_interval_ms")]
    pub write_interval_ms: u64,

    /// Worker idle keep-alive
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_ms: u64,
}

fn default_store_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("objectstore")
}

fn default_write_interval_ms() -> u64 {
    DEFAULT_WRITE_INTERVAL_MS
}

fn default_keep_alive_ms() -> u64 {
    DEFAULT_KEEP_ALIVE_MS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_dir: default_store_dir(),
            write_interval_ms: default_write_interval_ms(),
            keep_alive_ms: default_keep_alive_ms(),
        }
    }
}

impl Config {
    /// Load config from file, or use defaults
    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        if let Some(config_path) = path {
            return Self::load_file(config_path);
        }

        // Try default locations
        let default_paths = [
            dirs::config_dir().map(|p| p.join("objectstore").join("config.yml")),
            Some(PathBuf::from("objectstore.yml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                return Self::load_file(path);
            }
        }

        Ok(Config::default())
    }

    fn load_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).context(format!("Failed to read config file {}", path.display()))?;
        let config: Config =
            serde_yaml::from_str(&content).context(format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn write_interval(&self) -> Duration {
        Duration::from_millis(self.write_interval_ms)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    /// Worker settings derived from this config
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            keep_alive: self.keep_alive(),
            ..QueueConfig::default()
        }
    }
}
