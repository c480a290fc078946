//! Error types for crashkeep-core

use std::fmt::Write;
use std::path::PathBuf;

use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for crashkeep-core
#[derive(Error, Debug)]
pub enum Error {
    /// A record could not be persisted
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// A handler reported a failure
    #[error("Handler error: {0}")]
    Handler(#[from] HandlerError),

    /// Upload transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// A crash agent already owns the process-wide panic hook
    #[error("a crash agent is already installed")]
    AlreadyInstalled,

    /// The dispatch worker is gone (shut down or died)
    #[error("dispatch worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Persistence(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Transport(_) => Some(
                Remediation::new("Check the upload endpoint and network, then retry.")
                    .command("Retry upload", "ck upload")
                    .alternative("Records stay on disk until a later upload pass succeeds."),
            ),
            Self::AlreadyInstalled => Some(
                Remediation::new("Uninstall the existing agent before installing another.")
                    .alternative("Keep a single agent per process and register extra handlers on it."),
            ),
            Self::WorkerUnavailable(_) => Some(Remediation::new(
                "The agent was shut down; build a new agent before reporting faults.",
            )),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .command("Show config", "ck config"),
            ),
            Self::Handler(_) => None,
        }
    }
}

/// Failure to persist a crash record.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("log directory {path} unavailable: {reason}")]
    DirectoryUnavailable { path: PathBuf, reason: String },

    #[error("failed to create {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to allocate {len} bytes for {path}: {source}")]
    Allocate {
        path: PathBuf,
        len: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to sync {path} to disk: {source}")]
    Sync {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no free record name in {dir} for timestamp {millis}")]
    NameExhausted { dir: PathBuf, millis: u64 },
}

impl PersistenceError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::DirectoryUnavailable { .. } | Self::Create { .. } => {
                Remediation::new("Make sure the log directory exists and is writable.")
                    .command("Show config", "ck config")
                    .alternative("Set storage.log_dir to a writable location.")
            }
            Self::Allocate { .. } | Self::Write { .. } | Self::Sync { .. } => {
                Remediation::new("Free disk space on the volume holding the log directory.")
                    .command("Delete old records", "ck sweep --max-age-days 1")
            }
            Self::NameExhausted { .. } => Remediation::new(
                "Too many records were written in the same millisecond; remove stale records.",
            ),
        }
    }
}

/// Failure reported by a fault handler.
#[derive(Error, Debug)]
pub enum HandlerError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// The handler claimed the fault but the fault turned out to be of
    /// another kind. The chain moves on to the next handler.
    #[error("handler {handler} cannot handle fault of kind {kind}")]
    ClassificationMismatch { handler: String, kind: String },

    #[error("heap snapshot failed: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("{0}")]
    Other(String),
}

impl HandlerError {
    #[must_use]
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }
}

/// Failure to capture a heap snapshot.
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("heap snapshots are not supported here")]
    Unsupported,

    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Upload rejected by the transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("collector rejected {path}: {reason}")]
    Rejected { path: PathBuf, reason: String },

    #[error("cannot read record {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("transport failure: {0}")]
    Other(String),
}

/// Configuration loading or validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Invalid config value: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!("Create {path} or point CRASHKEEP_CONFIG elsewhere."))
                .command("Print defaults", "ck config > crashkeep.toml"),
            Self::ReadFailed(..) => Remediation::new("Check read permissions on the config file."),
            Self::ParseError(_) => Remediation::new("Fix the TOML syntax in the config file.")
                .command("Print defaults", "ck config"),
            Self::SerializeError(_) => Remediation::new("Report this as a bug."),
            Self::ValidationError(_) => Remediation::new("Adjust the offending value and retry.")
                .alternative("Remove the key to fall back to its default."),
        }
    }
}

/// Format an error with remediation guidance (plain text)
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}\n");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}
