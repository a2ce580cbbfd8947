//! Configuration management
//!
//! Values resolve as environment variable, then `config.toml`, then default.

pub mod file;

use std::path::PathBuf;
use std::time::Duration;

use crate::health::HealthSettings;
use crate::lease::DEFAULT_LOCK_TIMEOUT;
use crate::scoring::ScoringKind;
use crate::{Error, Result};

/// Default API port
pub const DEFAULT_PORT: u16 = 18_800;

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP API server configuration
    pub api_server: ApiServerConfig,

    /// `SQLite` database file
    pub db_path: PathBuf,

    /// Liveness and hygiene timing
    pub health: HealthConfig,

    /// Event delivery
    pub notify: NotifyConfig,

    /// Lease arbitration
    pub lease: LeaseConfig,
}

/// HTTP API server configuration
#[derive(Debug, Clone)]
pub struct ApiServerConfig {
    pub port: u16,
    /// Bearer key for API routes; `None` leaves them open
    pub api_key: Option<String>,
}

/// Health tracker timing
#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    pub sweep_interval: Duration,
    pub probe_timeout: Duration,
    /// Heartbeat age after which a device is stale
    pub heartbeat_timeout: Duration,
    pub hygiene_interval: Duration,
    /// Lease inactivity after which the hygiene sweep evicts
    pub idle_timeout: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(90),
            hygiene_interval: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl HealthConfig {
    /// Tracker settings derived from this config
    #[must_use]
    pub const fn settings(&self) -> HealthSettings {
        HealthSettings {
            sweep_interval: self.sweep_interval,
            hygiene_interval: self.hygiene_interval,
            probe_timeout: self.probe_timeout,
            idle_timeout: self.idle_timeout,
        }
    }
}

/// Event delivery configuration
#[derive(Debug, Clone, Copy)]
pub struct NotifyConfig {
    pub send_timeout: Duration,
    pub queue_capacity: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(2),
            queue_capacity: crate::api::DEFAULT_WS_QUEUE,
        }
    }
}

/// Lease arbitration configuration
#[derive(Debug, Clone, Copy)]
pub struct LeaseConfig {
    /// Longest wait for a busy device before `Timeout`
    pub lock_timeout: Duration,
    pub scoring: ScoringKind,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            scoring: ScoringKind::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment value");
            None
        }
    }
}

fn secs(env_key: &str, file_value: Option<u64>, default: Duration) -> Duration {
    env_parse::<u64>(env_key)
        .or(file_value)
        .map_or(default, Duration::from_secs)
}

/// Default database path: `<data dir>/tether/tether.db`
fn default_db_path() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from("tether.db"),
        |d| d.data_dir().join("tether").join("tether.db"),
    )
}

impl Config {
    /// Load configuration from the environment and the config file
    ///
    /// # Errors
    ///
    /// Returns `Config` if a timing value is zero or the data directory
    /// cannot be created
    pub fn load() -> Result<Self> {
        Self::from_file(file::load_config_file())
    }

    /// Resolve configuration over an already-loaded file
    ///
    /// # Errors
    ///
    /// Returns `Config` if a timing value is zero, the scoring strategy is
    /// unknown or the data directory cannot be created
    pub fn from_file(fc: file::TetherConfigFile) -> Result<Self> {
        let api_server = ApiServerConfig {
            port: env_parse("TETHER_PORT")
                .or_else(|| env_parse("PORT"))
                .or(fc.server.port)
                .unwrap_or(DEFAULT_PORT),
            api_key: std::env::var("TETHER_API_KEY")
                .ok()
                .or(fc.server.api_key)
                .filter(|k| !k.is_empty()),
        };

        let db_path = std::env::var("TETHER_DB_PATH")
            .ok()
            .or(fc.database.path)
            .map_or_else(default_db_path, PathBuf::from);
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::Config(format!(
                    "failed to create data directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let defaults = HealthConfig::default();
        let health = HealthConfig {
            sweep_interval: secs(
                "TETHER_SWEEP_INTERVAL_SECS",
                fc.health.sweep_interval_secs,
                defaults.sweep_interval,
            ),
            probe_timeout: secs(
                "TETHER_PROBE_TIMEOUT_SECS",
                fc.health.probe_timeout_secs,
                defaults.probe_timeout,
            ),
            heartbeat_timeout: secs(
                "TETHER_HEARTBEAT_TIMEOUT_SECS",
                fc.health.heartbeat_timeout_secs,
                defaults.heartbeat_timeout,
            ),
            hygiene_interval: secs(
                "TETHER_HYGIENE_INTERVAL_SECS",
                fc.health.hygiene_interval_secs,
                defaults.hygiene_interval,
            ),
            idle_timeout: secs(
                "TETHER_IDLE_TIMEOUT_SECS",
                fc.health.idle_timeout_secs,
                defaults.idle_timeout,
            ),
        };

        let notify_defaults = NotifyConfig::default();
        let notify = NotifyConfig {
            send_timeout: env_parse::<u64>("TETHER_SEND_TIMEOUT_MS")
                .or(fc.notify.send_timeout_ms)
                .map_or(notify_defaults.send_timeout, Duration::from_millis),
            queue_capacity: env_parse("TETHER_QUEUE_CAPACITY")
                .or(fc.notify.queue_capacity)
                .unwrap_or(notify_defaults.queue_capacity),
        };

        let lease_defaults = LeaseConfig::default();
        let scoring = match std::env::var("TETHER_SCORING").ok().or(fc.lease.scoring) {
            Some(name) => name.parse()?,
            None => lease_defaults.scoring,
        };
        let lease = LeaseConfig {
            lock_timeout: env_parse::<u64>("TETHER_LOCK_TIMEOUT_MS")
                .or(fc.lease.lock_timeout_ms)
                .map_or(lease_defaults.lock_timeout, Duration::from_millis),
            scoring,
        };

        let config = Self {
            api_server,
            db_path,
            health,
            notify,
            lease,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let timings = [
            ("sweep interval", self.health.sweep_interval),
            ("probe timeout", self.health.probe_timeout),
            ("heartbeat timeout", self.health.heartbeat_timeout),
            ("hygiene interval", self.health.hygiene_interval),
            ("idle timeout", self.health.idle_timeout),
            ("send timeout", self.notify.send_timeout),
            ("lock timeout", self.lease.lock_timeout),
        ];
        if let Some((name, _)) = timings.iter().find(|(_, d)| d.is_zero()) {
            return Err(Error::Config(format!("{name} must be greater than zero")));
        }
        if self.notify.queue_capacity == 0 {
            return Err(Error::Config("queue capacity must be greater than zero".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::file::{
        DatabaseFileConfig, HealthFileConfig, LeaseFileConfig, TetherConfigFile,
    };

    fn file_with_db(dir: &tempfile::TempDir) -> TetherConfigFile {
        TetherConfigFile {
            database: DatabaseFileConfig {
                path: Some(dir.path().join("data").join("t.db").display().to_string()),
            },
            ..TetherConfigFile::default()
        }
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let mut fc = file_with_db(&dir);
        fc.health = HealthFileConfig {
            heartbeat_timeout_secs: Some(15),
            ..HealthFileConfig::default()
        };

        let config = Config::from_file(fc).unwrap();
        assert_eq!(config.health.heartbeat_timeout, Duration::from_secs(15));
        assert_eq!(config.health.sweep_interval, Duration::from_secs(30));
        assert!(dir.path().join("data").is_dir());
    }

    #[test]
    fn zero_timing_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut fc = file_with_db(&dir);
        fc.health.probe_timeout_secs = Some(0);

        assert!(matches!(Config::from_file(fc), Err(Error::Config(_))));
    }

    #[test]
    fn lease_settings_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut fc = file_with_db(&dir);
        fc.lease = LeaseFileConfig {
            lock_timeout_ms: Some(750),
            scoring: Some("prefer_own_group".to_string()),
        };

        let config = Config::from_file(fc).unwrap();
        assert_eq!(config.lease.lock_timeout, Duration::from_millis(750));
        assert_eq!(config.lease.scoring, ScoringKind::PreferOwnGroup);
    }

    #[test]
    fn zero_lock_timeout_and_unknown_scoring_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut fc = file_with_db(&dir);
        fc.lease.lock_timeout_ms = Some(0);
        assert!(matches!(Config::from_file(fc), Err(Error::Config(_))));

        let mut fc = file_with_db(&dir);
        fc.lease.scoring = Some("fastest".to_string());
        assert!(matches!(Config::from_file(fc), Err(Error::Config(_))));
    }

    #[test]
    fn health_settings_follow_config() {
        let health = HealthConfig::default();
        let settings = health.settings();
        assert_eq!(settings.idle_timeout, health.idle_timeout);
        assert_eq!(settings.probe_timeout, health.probe_timeout);
    }
}
