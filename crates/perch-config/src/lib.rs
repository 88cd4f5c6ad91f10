#![deny(unsafe_code)]

//! Configuration loading and validation for perch.
//!
//! Loads TOML configuration files and validates them against expected ranges.
//! Provides the [`AppConfig`] type as the central configuration structure,
//! and the [`paths`] module for locating the config file and the daemon socket.

/// Well-known filesystem locations (config file, daemon socket).
pub mod paths;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon configuration.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Backlight control configuration.
    #[serde(default)]
    pub backlight: BacklightConfig,
}

/// Configuration for the core daemon.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Explicit control socket path. When unset, the path is derived from
    /// the user's runtime directory (see [`paths::socket_path`]).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Backlight configuration.
///
/// The backlight is driven through sysfs-style pseudo files:
/// `<sysfs_root>/<device_name>/brightness` and `.../max_brightness`.
///
/// ## TOML Example
///
/// ```toml
/// [backlight]
/// device_name = "intel_backlight"
/// minimum_percent = 1.0
/// step_percent = 10.0
/// poll_interval_ms = 250
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacklightConfig {
    /// Whether the brightness commands are registered at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Device directory name. Empty means "first device found".
    #[serde(default)]
    pub device_name: String,

    /// Directory holding one subdirectory per backlight device.
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: String,

    /// Lowest brightness reachable through `set` and `down`, in percent.
    #[serde(default = "default_minimum_percent")]
    pub minimum_percent: f64,

    /// Increment used by `up` and `down`, in percent.
    #[serde(default = "default_step_percent")]
    pub step_percent: f64,

    /// How often the device file is sampled while clients are subscribed.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for BacklightConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            device_name: String::new(),
            sysfs_root: default_sysfs_root(),
            minimum_percent: default_minimum_percent(),
            step_percent: default_step_percent(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl BacklightConfig {
    /// Polling interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_sysfs_root() -> String {
    "/sys/class/backlight".to_string()
}

fn default_minimum_percent() -> f64 {
    0.5
}

fn default_step_percent() -> f64 {
    5.0
}

fn default_poll_interval_ms() -> u64 {
    500
}

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Load configuration from `path`, falling back to defaults when the file
    /// does not exist. Any other failure is returned.
    pub async fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        match tokio::fs::metadata(path).await {
            Ok(_) => Self::load(path).await,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as pretty-printed TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.level must be one of {:?}, got {:?}",
                VALID_LOG_LEVELS, self.logging.level
            )));
        }

        if let Some(path) = &self.daemon.socket_path
            && path.is_empty()
        {
            return Err(ConfigError::Validation(
                "daemon.socket_path must not be empty when set".to_string(),
            ));
        }

        let backlight = &self.backlight;
        if !(0.0..=100.0).contains(&backlight.minimum_percent) {
            return Err(ConfigError::Validation(format!(
                "backlight.minimum_percent must be in [0, 100], got {}",
                backlight.minimum_percent
            )));
        }
        if !(backlight.step_percent > 0.0 && backlight.step_percent <= 100.0) {
            return Err(ConfigError::Validation(format!(
                "backlight.step_percent must be in (0, 100], got {}",
                backlight.step_percent
            )));
        }
        if backlight.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "backlight.poll_interval_ms must be non-zero".to_string(),
            ));
        }
        if backlight.sysfs_root.is_empty() {
            return Err(ConfigError::Validation(
                "backlight.sysfs_root must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.daemon.socket_path, None);
        assert_eq!(config.logging.level, "info");
        assert!(config.backlight.enabled);
        assert_eq!(config.backlight.sysfs_root, "/sys/class/backlight");
        assert_eq!(config.backlight.poll_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config = AppConfig::parse("").unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
            [daemon]
            socket_path = "/run/user/1000/perch-test.sock"

            [logging]
            level = "debug"

            [backlight]
            enabled = false
            device_name = "intel_backlight"
            sysfs_root = "/tmp/backlight"
            minimum_percent = 2.0
            step_percent = 10.0
            poll_interval_ms = 100
        "#;
        let config = AppConfig::parse(toml).unwrap();
        assert_eq!(
            config.daemon.socket_path.as_deref(),
            Some("/run/user/1000/perch-test.sock")
        );
        assert_eq!(config.logging.level, "debug");
        assert!(!config.backlight.enabled);
        assert_eq!(config.backlight.device_name, "intel_backlight");
        assert_eq!(config.backlight.sysfs_root, "/tmp/backlight");
        assert_eq!(config.backlight.minimum_percent, 2.0);
        assert_eq!(config.backlight.step_percent, 10.0);
        assert_eq!(config.backlight.poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn test_validation_rejects_unknown_log_level() {
        let result = AppConfig::parse("[logging]\nlevel = \"loud\"\n");
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_validation_rejects_empty_socket_path() {
        let result = AppConfig::parse("[daemon]\nsocket_path = \"\"\n");
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_validation_rejects_out_of_range_minimum() {
        let result = AppConfig::parse("[backlight]\nminimum_percent = 120.0\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_validation_rejects_zero_step() {
        let result = AppConfig::parse("[backlight]\nstep_percent = 0.0\n");
        assert!(result.is_err());
        assert!(AppConfig::parse("[backlight]\nstep_percent = nan\n").is_err());
    }

    #[test]
    fn test_validation_rejects_zero_poll_interval() {
        let result = AppConfig::parse("[backlight]\npoll_interval_ms = 0\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_toml_dump_roundtrips() {
        let mut config = AppConfig::default();
        config.backlight.device_name = "acpi_video0".to_string();
        let dumped = config.to_toml().unwrap();
        assert!(dumped.contains("poll_interval_ms"));
        assert_eq!(AppConfig::parse(&dumped).unwrap(), config);
    }

    // ── Async file-based loading ──────────────────────────────────────

    #[tokio::test]
    async fn test_load_from_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("perch.toml");
        tokio::fs::write(&path, b"[backlight]\nstep_percent = 2.5\n")
            .await
            .unwrap();

        let config = AppConfig::load(&path).await.unwrap();
        assert_eq!(config.backlight.step_percent, 2.5);
    }

    #[tokio::test]
    async fn test_load_nonexistent_file() {
        let result = AppConfig::load(Path::new("/nonexistent/perch.toml")).await;
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[tokio::test]
    async fn test_load_or_default_missing_file() {
        let tmp = TempDir::new().unwrap();
        let config = AppConfig::load_or_default(&tmp.path().join("absent.toml"))
            .await
            .unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[tokio::test]
    async fn test_load_invalid_toml_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("bad.toml");
        tokio::fs::write(&path, b"not valid toml [[[").await.unwrap();

        let result = AppConfig::load_or_default(&path).await;
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Validation("bad value".to_string());
        assert_eq!(err.to_string(), "validation error: bad value");
    }
}
