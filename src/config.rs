use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

const DATA_DIR_ENV: &str = "VIEWHOST_DATA_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read host config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Tunables shared by the browser host, its script channels and the
/// component host.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub default_script_timeout_ms: Option<u64>,
    pub engine_start_timeout_ms: u64,
    pub dispose_timeout_ms: u64,
    pub prerender_cache_entries: usize,
    pub storage_domain: String,
    pub data_dir: Option<PathBuf>,
    pub debug_mode: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            default_script_timeout_ms: None,
            engine_start_timeout_ms: 15_000,
            dispose_timeout_ms: 5_000,
            prerender_cache_entries: 0,
            storage_domain: "default".to_string(),
            data_dir: None,
            debug_mode: false,
        }
    }
}

impl HostConfig {
    /// Reads the YAML file at `config_path` when it exists, falling back to
    /// defaults otherwise. `VIEWHOST_DATA_DIR` always wins over the file.
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut config = match config_path {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path)?;
                serde_yaml::from_str(&contents)?
            }
            _ => Self::default(),
        };

        if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
            config.data_dir = Some(PathBuf::from(dir));
        }

        Ok(config)
    }

    pub fn default_script_timeout(&self) -> Option<Duration> {
        self.default_script_timeout_ms.map(Duration::from_millis)
    }

    pub fn engine_start_timeout(&self) -> Duration {
        Duration::from_millis(self.engine_start_timeout_ms)
    }

    pub fn dispose_timeout(&self) -> Duration {
        Duration::from_millis(self.dispose_timeout_ms)
    }

    pub fn with_cache_entries(mut self, entries: usize) -> Self {
        self.prerender_cache_entries = entries;
        self
    }

    pub fn with_engine_start_timeout(mut self, timeout: Duration) -> Self {
        self.engine_start_timeout_ms = timeout.as_millis() as u64;
        self
    }
}
