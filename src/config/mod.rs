//! Configuration module for sshfleet.
//!
//! Handles loading and parsing the `~/.sshfleet/config` file.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::fanout::FanOut;
use crate::logging::LogConfig;
use crate::session::{DEFAULT_COMMAND_TIMEOUT_SECS, DEFAULT_CONNECT_TIMEOUT_SECS};

/// Name of the per-user data directory.
pub const DATA_DIR_NAME: &str = ".sshfleet";

/// Config file name inside the data directory.
pub const CONFIG_FILE_NAME: &str = "config";

/// Default progress report spacing in milliseconds.
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 100;

/// Default config file content with all settings documented.
const DEFAULT_CONFIG: &str = r#"# sshfleet configuration
# ======================
# Lines starting with '#' are comments.

# Storage
# -------
# Directory holding hosts.json, the vault salt and logs.
# data_dir = ~/.sshfleet

# Connections
# -----------
# connect_timeout = 10        # Seconds to wait for connect + authentication
# command_timeout = 30        # Seconds a single remote command may run

# Fan-out
# -------
# Maximum concurrent hosts. 0 runs every selected host at once.
# max_workers = 0

# Transfers
# ---------
# progress_interval_ms = 100  # Minimum spacing between progress updates

# Logging
# -------
# Logs are stored in <data_dir>/logs/ with automatic cleanup.
#
# log_enabled = true          # Enable/disable file logging (true/false)
# log_level = info            # trace, debug, info, warn, error, off
# log_retention = 24          # Hours to keep log files
"#;

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Directory for the registry document, salt and logs.
    pub data_dir: PathBuf,
    /// Connect + authentication timeout.
    pub connect_timeout: Duration,
    /// Per-command timeout.
    pub command_timeout: Duration,
    /// Fan-out worker cap (0 = one per host).
    pub max_workers: usize,
    /// Minimum spacing between progress reports.
    pub progress_interval: Duration,
    /// Path the config was loaded from.
    pub config_path: PathBuf,
    /// Logging configuration.
    pub log_config: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = Self::default_data_dir();
        Self {
            config_path: data_dir.join(CONFIG_FILE_NAME),
            data_dir,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            command_timeout: Duration::from_secs(DEFAULT_COMMAND_TIMEOUT_SECS),
            max_workers: 0,
            progress_interval: Duration::from_millis(DEFAULT_PROGRESS_INTERVAL_MS),
            log_config: LogConfig::default(),
        }
    }
}

impl Config {
    /// Returns the default data directory (`~/.sshfleet`).
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DATA_DIR_NAME)
    }

    /// Returns the default config file path (`~/.sshfleet/config`).
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        Self::default_data_dir().join(CONFIG_FILE_NAME)
    }

    /// Loads configuration from the default path, creating it if missing.
    pub fn load() -> io::Result<Self> {
        Self::load_from(&Self::default_config_path())
    }

    /// Loads configuration from `path`, creating a documented default
    /// file if it does not exist.
    pub fn load_from(path: &Path) -> io::Result<Self> {
        if !path.exists() {
            Self::create_default_config(path)?;
        }

        let content = fs::read_to_string(path)?;
        let mut config = Self::parse_str(&content);
        config.config_path = path.to_path_buf();
        Ok(config)
    }

    /// Parses config content over the defaults.
    ///
    /// Unknown keys are ignored and unparsable values keep their default.
    #[must_use]
    pub fn parse_str(content: &str) -> Self {
        let mut config = Self::default();

        for line in content.lines() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.split('#').next().unwrap_or(value).trim();
                config.apply_setting(key, value);
            }
        }

        config
    }

    /// Fan-out engine matching `max_workers`.
    #[must_use]
    pub fn engine(&self) -> FanOut {
        FanOut::bounded(self.max_workers)
    }

    fn create_default_config(path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(path)?;
        file.write_all(DEFAULT_CONFIG.as_bytes())?;
        Ok(())
    }

    fn apply_setting(&mut self, key: &str, value: &str) {
        match key {
            "data_dir" => {
                if !value.is_empty() {
                    self.data_dir = expand_home(value);
                }
            }
            "connect_timeout" => {
                if let Some(secs) = parse_positive(value) {
                    self.connect_timeout = Duration::from_secs(secs);
                }
            }
            "command_timeout" => {
                if let Some(secs) = parse_positive(value) {
                    self.command_timeout = Duration::from_secs(secs);
                }
            }
            "max_workers" => {
                if let Ok(n) = value.parse() {
                    self.max_workers = n;
                }
            }
            "progress_interval_ms" => {
                if let Ok(ms) = value.parse() {
                    self.progress_interval = Duration::from_millis(ms);
                }
            }
            "log_level" => {
                self.log_config.level = LogConfig::parse_level(value);
            }
            "log_retention" | "log_retention_hours" => {
                self.log_config.retention_hours = LogConfig::parse_retention(value);
            }
            "log_enabled" | "logging" => {
                self.log_config.enabled = parse_bool(value);
            }
            _ => {}
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "yes" | "1" | "on")
}

fn parse_positive(value: &str) -> Option<u64> {
    value.parse().ok().filter(|n| *n > 0)
}

/// Expands a leading `~/` to the home directory.
fn expand_home(value: &str) -> PathBuf {
    match value.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None if value == "~" => dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
        None => PathBuf::from(value),
    }
}
