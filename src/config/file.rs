//! TOML configuration file loading
//!
//! Supports `~/.config/tether/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct TetherConfigFile {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Store settings
    #[serde(default)]
    pub database: DatabaseFileConfig,

    /// Liveness and hygiene timing
    #[serde(default)]
    pub health: HealthFileConfig,

    /// Event delivery settings
    #[serde(default)]
    pub notify: NotifyFileConfig,

    /// Lease arbitration settings
    #[serde(default)]
    pub lease: LeaseFileConfig,
}

/// Server/runtime configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    /// API server port
    pub port: Option<u16>,

    /// Bearer key required on API routes
    pub api_key: Option<String>,
}

/// Store configuration
#[derive(Debug, Default, Deserialize)]
pub struct DatabaseFileConfig {
    /// `SQLite` file path
    pub path: Option<String>,
}

/// Health tracker timing, all in seconds
#[derive(Debug, Default, Deserialize)]
pub struct HealthFileConfig {
    pub sweep_interval_secs: Option<u64>,
    pub probe_timeout_secs: Option<u64>,
    pub heartbeat_timeout_secs: Option<u64>,
    pub hygiene_interval_secs: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
}

/// Notification delivery configuration
#[derive(Debug, Default, Deserialize)]
pub struct NotifyFileConfig {
    /// Per-send timeout in milliseconds
    pub send_timeout_ms: Option<u64>,

    /// Queue depth per event stream connection
    pub queue_capacity: Option<usize>,
}

/// Lease arbitration configuration
#[derive(Debug, Default, Deserialize)]
pub struct LeaseFileConfig {
    /// Longest wait for a busy device, in milliseconds
    pub lock_timeout_ms: Option<u64>,

    /// Device ranking: `uniform` or `prefer_own_group`
    pub scoring: Option<String>,
}

/// Load the TOML config file from the standard path
///
/// Returns `TetherConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> TetherConfigFile {
    config_file_path().map_or_else(TetherConfigFile::default, |path| load_from(&path))
}

/// Load a TOML config file from `path`
pub fn load_from(path: &Path) -> TetherConfigFile {
    if !path.exists() {
        return TetherConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                TetherConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            TetherConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/tether/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("tether").join("config.toml"))
}
