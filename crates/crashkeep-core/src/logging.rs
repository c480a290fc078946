//! Diagnostics for the agent and the `ck` binary.
//!
//! Events go to stderr as pretty text or JSON lines, and optionally to an
//! append-only file (`0600`, parent `0700` on unix).
//!
//! ```ignore
//! use crashkeep_core::config::LogFormat;
//! use crashkeep_core::logging::{LogConfig, init_logging};
//!
//! init_logging(&LogConfig {
//!     level: "debug".to_string(),
//!     format: LogFormat::Json,
//!     file: None,
//! })?;
//! ```
//!
//! Field names used across the crate:
//! - `record_id`: `crash_<millis>[_<seq>]`
//! - `handler`: handler that produced the outcome
//! - `fault_class`: `general` or `out_of_memory`
//! - `thread`: faulting thread name
//! - `dispatch_state`: coordinator state
//! - `path`: record or directory path
//!
//! Fault descriptions are logged only after redaction, and only once the
//! record is on disk.

pub use crate::config::LogFormat;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

static LOGGING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// The `[logging]` config table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter level; `RUST_LOG` wins when set.
    pub level: String,
    pub format: LogFormat,
    /// Extra append-only destination.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("failed to create log file: {0}")]
    FileCreate(#[from] io::Error),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

pub(crate) fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
        return Ok(());
    };
    let existed = parent.exists();
    std::fs::create_dir_all(parent)?;
    #[cfg(unix)]
    if !existed {
        std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

#[cfg(unix)]
pub(crate) fn set_file_permissions(path: &Path, mode: u32) -> io::Result<()> {
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

fn open_log_file(path: &Path) -> io::Result<File> {
    ensure_parent_dir(path)?;
    let existed = path.exists();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    #[cfg(unix)]
    if !existed {
        set_file_permissions(path, 0o600)?;
    }
    Ok(file)
}

/// Install the global subscriber.
///
/// A second call fails with [`LogError::AlreadyInitialized`]. `RUST_LOG`
/// (e.g. `RUST_LOG=crashkeep_core=debug,ck=trace`) replaces `config.level`.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let level: LogLevel = config.level.parse().map_err(LogError::InvalidLevel)?;
            EnvFilter::new(level.as_str())
        }
    };
    let file = config.file.as_deref().map(open_log_file).transpose()?;

    match config.format {
        LogFormat::Pretty => {
            let stderr = fmt::layer()
                .with_writer(io::stderr)
                .with_target(true)
                .with_thread_names(true)
                .with_span_events(FmtSpan::NONE)
                .with_ansi(true);
            let file = file.map(|file| {
                fmt::layer()
                    .with_writer(file)
                    .with_target(true)
                    .with_thread_names(true)
                    .with_ansi(false)
            });
            tracing::subscriber::set_global_default(
                tracing_subscriber::registry().with(env_filter).with(stderr).with(file),
            )?;
        }
        LogFormat::Json => {
            let stderr = fmt::layer()
                .json()
                .with_timer(SystemTime)
                .with_writer(io::stderr)
                .with_target(true)
                .with_current_span(true)
                .with_span_list(false)
                .flatten_event(true);
            let file = file.map(|file| {
                fmt::layer()
                    .json()
                    .with_timer(SystemTime)
                    .with_writer(file)
                    .with_target(true)
                    .with_current_span(true)
                    .flatten_event(true)
            });
            tracing::subscriber::set_global_default(
                tracing_subscriber::registry().with(env_filter).with(stderr).with(file),
            )?;
        }
    }

    let _ = LOGGING_INITIALIZED.set(());

    tracing::info!(
        log_level = %config.level,
        log_format = %config.format,
        log_file = ?config.file,
        "Logging initialized"
    );

    Ok(())
}

/// `info_span!` with the crash field names.
///
/// ```ignore
/// let span = crashkeep_core::crash_span!("dispatch", fault_class = "general", thread = "main");
/// let _guard = span.enter();
/// ```
#[macro_export]
macro_rules! crash_span {
    ($name:expr $(, $field:ident = $value:expr)* $(,)?) => {
        tracing::info_span!($name $(, $field = $value)*)
    };
}

/// Accepted spellings of `logging.level`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(format!(
                "unknown log level: {s}. Expected one of: trace, debug, info, warn, error"
            )),
        }
    }
}
