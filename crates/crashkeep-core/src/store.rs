//! The managed log directory and record listing.
//!
//! Records live flat in one directory:
//!
//! ```text
//! <data_local_dir>/<app>/crash_logs/
//! ├── crash_1767225600123.log
//! ├── crash_1767225600123_1.log   # same millisecond
//! └── dump.hprof                  # heap snapshot, never uploaded
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PersistenceError;
use crate::record::RecordId;

/// Record directory, created on first use.
#[derive(Debug)]
pub struct LogDirectory {
    path: PathBuf,
    ready: OnceLock<()>,
}

impl LogDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ready: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the directory (mode `0700` on unix) if this instance has not
    /// done so yet. A failed attempt is retried on the next call.
    pub fn ensure(&self) -> Result<&Path, PersistenceError> {
        if self.ready.get().is_some() {
            return Ok(&self.path);
        }
        create_private_dir(&self.path).map_err(|e| PersistenceError::DirectoryUnavailable {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        let _ = self.ready.set(());
        tracing::debug!(path = %self.path.display(), "Log directory ready");
        Ok(&self.path)
    }
}

fn create_private_dir(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// A record found on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSummary {
    pub id: RecordId,
    pub path: PathBuf,
    pub len: u64,
    pub modified: Option<DateTime<Utc>>,
}

impl RecordSummary {
    #[must_use]
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// List records in `dir`, newest first, at most `limit`.
///
/// Files that do not parse as `crash_<millis>[_<seq>].<extension>` are
/// skipped. A missing directory yields an empty list.
#[must_use]
pub fn list_records(dir: &Path, extension: &str, limit: usize) -> Vec<RecordSummary> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut records: Vec<RecordSummary> = entries
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            let name = entry.file_name();
            let id = RecordId::parse_file_name(name.to_str()?, extension)?;
            Some(RecordSummary {
                id,
                path: entry.path(),
                len: meta.len(),
                modified: meta.modified().ok().map(DateTime::<Utc>::from),
            })
        })
        .collect();

    records.sort_by(|a, b| b.id.cmp(&a.id));
    records.truncate(limit);
    records
}

/// The most recent record, if any.
#[must_use]
pub fn latest_record(dir: &Path, extension: &str) -> Option<RecordSummary> {
    list_records(dir, extension, 1).into_iter().next()
}

/// Find a record by file name, stem, or `latest`.
#[must_use]
pub fn find_record(dir: &Path, extension: &str, name: &str) -> Option<RecordSummary> {
    if name == "latest" {
        return latest_record(dir, extension);
    }
    let id = RecordId::parse_file_name(name, extension).or_else(|| RecordId::parse_stem(name))?;
    list_records(dir, extension, usize::MAX)
        .into_iter()
        .find(|r| r.id == id)
}

/// Every regular file carrying `extension`, oldest first.
///
/// Unlike [`list_records`] this does not require the `crash_` naming scheme:
/// anything with the record extension is considered pending upload.
#[must_use]
pub fn pending_files(dir: &Path, extension: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<(Option<RecordId>, PathBuf)> = entries
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_ok_and(|ft| ft.is_file()))
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == extension))
        .map(|p| {
            let id = p
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| RecordId::parse_file_name(n, extension));
            (id, p)
        })
        .collect();
    files.sort();
    files.into_iter().map(|(_, p)| p).collect()
}

/// Read a record's bytes.
pub fn read_record(path: &Path) -> io::Result<Vec<u8>> {
    fs::read(path)
}
