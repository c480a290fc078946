//! Configuration management for crashkeep
//!
//! Handles loading and validation of crashkeep.toml configuration files.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "CRASHKEEP_CONFIG";

/// Upper bound on the pre-termination grace period.
pub const MAX_GRACE_PERIOD_MS: u64 = 10_000;

/// Upper bound on `storage.retention_days` (100 years).
pub const MAX_RETENTION_DAYS: u64 = 36_500;

const SECS_PER_DAY: u64 = 86_400;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Record storage and retention
    #[serde(default)]
    pub storage: StorageConfig,

    /// Fault dispatch and termination
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Record upload
    #[serde(default)]
    pub upload: UploadConfig,

    /// Logging
    #[serde(default)]
    pub logging: LogConfig,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name, used in records and for the default log directory
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Application version reported in records
    #[serde(default = "default_app_version")]
    pub app_version: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            app_version: default_app_version(),
        }
    }
}

fn default_app_name() -> String {
    "crashkeep".to_string()
}

fn default_app_version() -> String {
    crate::VERSION.to_string()
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Record directory; defaults to `<data_local_dir>/<app_name>/crash_logs`
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// File extension marking records as pending upload
    #[serde(default = "default_record_extension")]
    pub record_extension: String,

    /// Delete records older than this many days (0 disables the sweep)
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            record_extension: default_record_extension(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_record_extension() -> String {
    "log".to_string()
}

fn default_retention_days() -> u64 {
    7
}

/// How the process is ended once a fatal fault has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TerminationMode {
    /// `std::process::exit` with the configured exit code
    #[default]
    Exit,
    /// `std::process::abort`
    Abort,
}

impl std::fmt::Display for TerminationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exit => write!(f, "exit"),
            Self::Abort => write!(f, "abort"),
        }
    }
}

/// Dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Delay before forced termination, letting handler side effects finish
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    #[serde(default)]
    pub termination: TerminationMode,

    /// Exit code used with `termination = "exit"`
    #[serde(default = "default_exit_code")]
    pub exit_code: i32,

    /// Capture a backtrace on the faulting thread
    #[serde(default = "default_true")]
    pub capture_backtrace: bool,

    /// Scrub secret-looking tokens from descriptions and stack traces
    #[serde(default = "default_true")]
    pub redact_secrets: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            grace_period_ms: default_grace_period_ms(),
            termination: TerminationMode::Exit,
            exit_code: default_exit_code(),
            capture_backtrace: true,
            redact_secrets: true,
        }
    }
}

fn default_grace_period_ms() -> u64 {
    1_000
}

fn default_exit_code() -> i32 {
    101
}

fn default_true() -> bool {
    true
}

/// Upload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Collector endpoint; uploads are disabled when unset
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Upload pending records when the agent initializes
    #[serde(default = "default_true")]
    pub on_startup: bool,

    /// Interval for periodic upload + retention passes (0 = startup only)
    #[serde(default)]
    pub maintenance_interval_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: default_timeout_secs(),
            on_startup: true,
            maintenance_interval_secs: 0,
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

impl Config {
    /// Load configuration from `$CRASHKEEP_CONFIG` or the default location.
    ///
    /// A missing file at the default location yields the defaults; a missing
    /// file named by the environment variable is an error.
    pub fn load() -> Result<Self, ConfigError> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::load_from(Path::new(&path));
        }
        match default_config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        let config = Self::from_toml(&contents)?;
        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.general.app_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "general.app_name must not be empty".to_string(),
            ));
        }
        let ext = &self.storage.record_extension;
        if ext.is_empty() || ext.contains(['.', '/', '\\']) {
            return Err(ConfigError::ValidationError(format!(
                "storage.record_extension {ext:?} must be a bare extension like \"log\""
            )));
        }
        if self.storage.retention_days > MAX_RETENTION_DAYS {
            return Err(ConfigError::ValidationError(format!(
                "storage.retention_days {} exceeds {MAX_RETENTION_DAYS}",
                self.storage.retention_days
            )));
        }
        if self.dispatch.grace_period_ms > MAX_GRACE_PERIOD_MS {
            return Err(ConfigError::ValidationError(format!(
                "dispatch.grace_period_ms {} exceeds {MAX_GRACE_PERIOD_MS}",
                self.dispatch.grace_period_ms
            )));
        }
        if self.upload.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "upload.timeout_secs must be positive".to_string(),
            ));
        }
        if let Some(endpoint) = &self.upload.endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(ConfigError::ValidationError(format!(
                    "upload.endpoint {endpoint:?} must be an http(s) URL"
                )));
            }
        }
        Ok(())
    }

    /// Effective record directory.
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.storage.log_dir.as_deref().map_or_else(
            || default_log_dir(&self.general.app_name),
            expand_home,
        )
    }

    /// Retention age, `None` when the sweep is disabled.
    #[must_use]
    pub fn retention(&self) -> Option<Duration> {
        (self.storage.retention_days > 0).then(|| retention_age(self.storage.retention_days))
    }

    #[must_use]
    pub fn maintenance_interval(&self) -> Option<Duration> {
        (self.upload.maintenance_interval_secs > 0)
            .then(|| Duration::from_secs(self.upload.maintenance_interval_secs))
    }
}

/// Age for a retention window of `days`, saturating instead of wrapping.
#[must_use]
pub fn retention_age(days: u64) -> Duration {
    Duration::from_secs(days.saturating_mul(SECS_PER_DAY))
}

/// `<config_dir>/crashkeep/crashkeep.toml`
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("crashkeep").join("crashkeep.toml"))
}

/// `<data_local_dir>/<app_name>/crash_logs`, falling back to the temp dir.
#[must_use]
pub fn default_log_dir(app_name: &str) -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(app_name)
        .join("crash_logs")
}

fn expand_home(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}
