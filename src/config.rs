use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from diskwarden.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct WardenConfig {
    pub quota: QuotaConfig,
    pub monitor: MonitorConfig,
    pub run: RunConfig,
    pub paths: PathsConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Byte budget for the watched directory, in GB.
    pub limit_gb: f64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Seconds between usage samples while a command runs.
    pub poll_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Wall-clock limit on a protected command, in seconds.
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory the quota bounds; also the default extraction target.
    pub watch_dir: PathBuf,
    /// Directory scanned for .tar.zst archives.
    pub source_dir: PathBuf,
}

// --- Default implementations ---

impl Default for QuotaConfig {
    fn default() -> Self {
        Self { limit_gb: 70.0 }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 3,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self { timeout_secs: 500 }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            watch_dir: PathBuf::from("./data"),
            source_dir: PathBuf::from("./data"),
        }
    }
}

/// Errors from loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

/// Read and parse the config file. A missing file yields defaults.
pub fn load(path: &Path) -> Result<WardenConfig, ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(WardenConfig::default());
        }
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    toml::from_str(&raw).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
