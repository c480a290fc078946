//! Age-based retention for the log directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;

/// One deletion that did not go through.
#[derive(Debug, Clone, Serialize)]
pub struct SweepFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Result of one retention pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Regular files examined
    pub scanned: usize,
    pub deleted: Vec<PathBuf>,
    pub failed: Vec<SweepFailure>,
}

impl SweepReport {
    #[must_use]
    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Delete files in `dir` last modified more than `max_age` ago.
pub fn sweep(dir: &Path, max_age: Duration) -> SweepReport {
    sweep_at(dir, max_age, SystemTime::now())
}

/// [`sweep`] against an explicit clock.
///
/// Only regular files whose modification time is strictly before
/// `now - max_age` are removed. Failures are collected, never retried within
/// the pass.
pub fn sweep_at(dir: &Path, max_age: Duration, now: SystemTime) -> SweepReport {
    let mut report = SweepReport::default();
    let Some(cutoff) = now.checked_sub(max_age) else {
        return report;
    };
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(path = %dir.display(), error = %e, "Retention sweep skipped");
            return report;
        }
    };

    for entry in entries.filter_map(Result::ok) {
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        report.scanned += 1;

        let Ok(modified) = meta.modified() else {
            continue;
        };
        if modified >= cutoff {
            continue;
        }

        let path = entry.path();
        match fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(path = %path.display(), "Deleted expired crash record");
                report.deleted.push(path);
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to delete expired crash record"
                );
                report.failed.push(SweepFailure {
                    path,
                    error: e.to_string(),
                });
            }
        }
    }

    tracing::debug!(
        path = %dir.display(),
        scanned = report.scanned,
        deleted = report.deleted.len(),
        failed = report.failed.len(),
        "Retention sweep finished"
    );
    report
}
