//! Hands pending records to an upload transport.
//!
//! Retry is pull-based: a record that fails to upload stays on disk and is
//! offered again on the next pass. There is no backoff.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;

use crate::error::TransportError;
use crate::store::pending_files;

/// Called once the collector has accepted the record.
pub type UploadSuccess = Box<dyn FnOnce() + Send + 'static>;
/// Called when the upload was rejected or failed.
pub type UploadFailure = Box<dyn FnOnce(TransportError) + Send + 'static>;

/// Sends one record somewhere. Exactly one of the callbacks must be invoked,
/// on any thread, now or later.
pub trait UploadTransport: Send + Sync {
    fn upload(&self, record: &Path, on_success: UploadSuccess, on_failure: UploadFailure);
}

#[derive(Debug, Default)]
struct TallyInner {
    dispatched: AtomicUsize,
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    deleted: AtomicUsize,
}

/// Live counters for one pass, updated by the callbacks as they complete.
#[derive(Debug, Clone, Default)]
pub struct UploadTally {
    inner: Arc<TallyInner>,
}

/// Point-in-time view of an [`UploadTally`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UploadCounts {
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub deleted: usize,
}

impl UploadCounts {
    /// Uploads still waiting on a callback.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.dispatched
            .saturating_sub(self.succeeded)
            .saturating_sub(self.failed)
    }
}

impl UploadTally {
    #[must_use]
    pub fn counts(&self) -> UploadCounts {
        UploadCounts {
            dispatched: self.inner.dispatched.load(Ordering::SeqCst),
            succeeded: self.inner.succeeded.load(Ordering::SeqCst),
            failed: self.inner.failed.load(Ordering::SeqCst),
            deleted: self.inner.deleted.load(Ordering::SeqCst),
        }
    }
}

/// Offers every pending record in a directory to the transport.
pub struct UploadScheduler {
    transport: Arc<dyn UploadTransport>,
    extension: String,
}

impl std::fmt::Debug for UploadScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadScheduler")
            .field("extension", &self.extension)
            .finish_non_exhaustive()
    }
}

impl UploadScheduler {
    pub fn new(transport: Arc<dyn UploadTransport>, extension: impl Into<String>) -> Self {
        Self {
            transport,
            extension: extension.into(),
        }
    }

    /// Upload records oldest first; each accepted record is deleted locally.
    pub fn upload_pending(&self, dir: &Path) -> UploadTally {
        let tally = UploadTally::default();
        let pending = pending_files(dir, &self.extension);
        if pending.is_empty() {
            tracing::debug!(path = %dir.display(), "No crash records pending upload");
            return tally;
        }
        tracing::info!(
            path = %dir.display(),
            count = pending.len(),
            "Uploading pending crash records"
        );

        for path in pending {
            tally.inner.dispatched.fetch_add(1, Ordering::SeqCst);
            let on_success = success_callback(path.clone(), Arc::clone(&tally.inner));
            let on_failure = failure_callback(path.clone(), Arc::clone(&tally.inner));
            self.transport.upload(&path, on_success, on_failure);
        }
        tally
    }
}

fn success_callback(path: PathBuf, tally: Arc<TallyInner>) -> UploadSuccess {
    Box::new(move || {
        tally.succeeded.fetch_add(1, Ordering::SeqCst);
        match fs::remove_file(&path) {
            Ok(()) => {
                tally.deleted.fetch_add(1, Ordering::SeqCst);
                tracing::info!(path = %path.display(), "Uploaded crash record");
            }
            Err(e) => tracing::warn!(
                path = %path.display(),
                error = %e,
                "Uploaded crash record but could not delete it"
            ),
        }
    })
}

fn failure_callback(path: PathBuf, tally: Arc<TallyInner>) -> UploadFailure {
    Box::new(move |err| {
        tally.failed.fetch_add(1, Ordering::SeqCst);
        tracing::warn!(
            path = %path.display(),
            error = %err,
            "Crash record upload failed; keeping it for the next pass"
        );
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Accepting;

    impl UploadTransport for Accepting {
        fn upload(&self, _record: &Path, on_success: UploadSuccess, _on_failure: UploadFailure) {
            on_success();
        }
    }

    /// Holds callbacks until the test releases them.
    #[derive(Default)]
    struct Deferred {
        pending: Mutex<Vec<(PathBuf, UploadSuccess, UploadFailure)>>,
    }

    impl UploadTransport for Deferred {
        fn upload(&self, record: &Path, on_success: UploadSuccess, on_failure: UploadFailure) {
            self.pending
                .lock()
                .unwrap()
                .push((record.to_path_buf(), on_success, on_failure));
        }
    }

    fn records(dir: &Path, names: &[&str]) {
        for name in names {
            fs::write(dir.join(name), name).unwrap();
        }
    }

    #[test]
    fn accepted_records_are_deleted() {
        let tmp = tempfile::tempdir().unwrap();
        records(tmp.path(), &["crash_1.log", "crash_2.log", "dump.hprof"]);

        let scheduler = UploadScheduler::new(Arc::new(Accepting), "log");
        let counts = scheduler.upload_pending(tmp.path()).counts();
        assert_eq!(
            counts,
            UploadCounts {
                dispatched: 2,
                succeeded: 2,
                failed: 0,
                deleted: 2
            }
        );
        assert!(tmp.path().join("dump.hprof").exists());
        assert!(!tmp.path().join("crash_1.log").exists());
    }

    #[test]
    fn deferred_callbacks_report_into_tally() {
        let tmp = tempfile::tempdir().unwrap();
        records(tmp.path(), &["crash_20.log", "crash_10.log"]);

        let transport = Arc::new(Deferred::default());
        let scheduler = UploadScheduler::new(transport.clone(), "log");
        let tally = scheduler.upload_pending(tmp.path());
        assert_eq!(tally.counts().in_flight(), 2);

        let mut pending = std::mem::take(&mut *transport.pending.lock().unwrap());
        assert_eq!(pending[0].0.file_name().unwrap(), "crash_10.log");

        let (_, _, fail) = pending.pop().unwrap();
        fail(TransportError::Other("503".into()));
        let (first, ok, _) = pending.pop().unwrap();
        ok();

        let counts = tally.counts();
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.in_flight(), 0);
        assert!(!first.exists());
        assert!(tmp.path().join("crash_20.log").exists());
    }

    #[test]
    fn empty_and_missing_directories_are_noops() {
        let tmp = tempfile::tempdir().unwrap();
        let scheduler = UploadScheduler::new(Arc::new(Accepting), "log");
        assert_eq!(scheduler.upload_pending(tmp.path()).counts(), UploadCounts::default());
        assert_eq!(
            scheduler
                .upload_pending(&tmp.path().join("missing"))
                .counts(),
            UploadCounts::default()
        );
    }
}
