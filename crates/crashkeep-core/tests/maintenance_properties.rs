//! Retention and upload behaviour against real directories.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use proptest::prelude::*;

use crashkeep_core::error::TransportError;
use crashkeep_core::record::RecordId;
use crashkeep_core::retention::sweep_at;
use crashkeep_core::upload::{UploadFailure, UploadScheduler, UploadSuccess, UploadTransport};

const DAY: Duration = Duration::from_secs(86_400);

fn write_aged(dir: &Path, name: &str, modified: SystemTime) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, name).unwrap();
    File::options()
        .write(true)
        .open(&path)
        .unwrap()
        .set_modified(modified)
        .unwrap();
    path
}

/// Whole-second clock so file systems with coarse timestamps agree with it.
fn whole_second_now() -> SystemTime {
    let secs = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
    UNIX_EPOCH + Duration::from_secs(secs)
}

// =============================================================================
// Retention
// =============================================================================

#[test]
fn retention_deletes_only_strictly_older_records() {
    let max_age_days = 7u32;
    let tmp = tempfile::tempdir().unwrap();
    let now = whole_second_now();

    let ages = [0, max_age_days - 1, max_age_days, max_age_days + 1];
    let paths: Vec<PathBuf> = ages
        .iter()
        .enumerate()
        .map(|(i, age)| {
            write_aged(
                tmp.path(),
                &RecordId::new(i as u64 + 1, 0).file_name("log"),
                now - DAY * *age,
            )
        })
        .collect();

    let report = sweep_at(tmp.path(), DAY * max_age_days, now);
    assert_eq!(report.scanned, 4);
    assert_eq!(report.deleted, vec![paths[3].clone()]);
    assert!(report.failed.is_empty());
    for kept in &paths[..3] {
        assert!(kept.exists(), "{} should be kept", kept.display());
    }
}

#[test]
fn retention_sweeps_foreign_files_in_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let now = whole_second_now();
    let dump = write_aged(tmp.path(), "heap.hprof", now - 30 * DAY);
    let report = sweep_at(tmp.path(), 7 * DAY, now);
    assert_eq!(report.deleted, vec![dump]);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn retention_matches_age_predicate(
        ages_hours in prop::collection::vec(0u64..24 * 30, 1..12),
        max_age_hours in 1u64..24 * 20,
    ) {
        let tmp = tempfile::tempdir().unwrap();
        let now = whole_second_now();
        let hour = Duration::from_secs(3600);
        for (i, age) in ages_hours.iter().enumerate() {
            write_aged(tmp.path(), &format!("crash_{}.log", i + 1), now - hour * (*age as u32));
        }

        let report = sweep_at(tmp.path(), hour * max_age_hours as u32, now);
        let expected = ages_hours.iter().filter(|age| **age > max_age_hours).count();
        prop_assert_eq!(report.deleted.len(), expected);
        prop_assert_eq!(
            fs::read_dir(tmp.path()).unwrap().count(),
            ages_hours.len() - expected
        );
    }
}

// =============================================================================
// Upload
// =============================================================================

/// Accepts records whose file name is in the allow-list, rejects the rest.
struct SelectiveTransport {
    accept: BTreeSet<String>,
}

impl UploadTransport for SelectiveTransport {
    fn upload(&self, record: &Path, on_success: UploadSuccess, on_failure: UploadFailure) {
        let name = record
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.accept.contains(&name) {
            on_success();
        } else {
            on_failure(TransportError::Rejected {
                path: record.to_path_buf(),
                reason: "HTTP 503".into(),
            });
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn upload_deletes_exactly_the_accepted_subset(
        accepted in prop::collection::vec(any::<bool>(), 0..10)
    ) {
        let tmp = tempfile::tempdir().unwrap();
        let mut accept = BTreeSet::new();
        let mut names = Vec::new();
        for (i, ok) in accepted.iter().enumerate() {
            let name = RecordId::new(1_700_000_000_000 + i as u64, 0).file_name("log");
            fs::write(tmp.path().join(&name), "record").unwrap();
            if *ok {
                accept.insert(name.clone());
            }
            names.push(name);
        }

        let scheduler = UploadScheduler::new(Arc::new(SelectiveTransport { accept: accept.clone() }), "log");
        let counts = scheduler.upload_pending(tmp.path()).counts();

        prop_assert_eq!(counts.dispatched, names.len());
        prop_assert_eq!(counts.succeeded, accept.len());
        prop_assert_eq!(counts.deleted, accept.len());
        prop_assert_eq!(counts.failed, names.len() - accept.len());
        for name in &names {
            prop_assert_eq!(tmp.path().join(name).exists(), !accept.contains(name));
        }
    }
}

#[test]
fn upload_offers_records_oldest_first() {
    use std::sync::Mutex;

    struct Recording(Mutex<Vec<String>>);

    impl UploadTransport for Recording {
        fn upload(&self, record: &Path, _ok: UploadSuccess, fail: UploadFailure) {
            self.0
                .lock()
                .unwrap()
                .push(record.file_name().unwrap().to_string_lossy().into_owned());
            fail(TransportError::Other("offline".into()));
        }
    }

    let tmp = tempfile::tempdir().unwrap();
    for name in ["crash_300.log", "crash_100_1.log", "crash_100.log", "crash_200.log"] {
        fs::write(tmp.path().join(name), "x").unwrap();
    }
    let transport = Arc::new(Recording(Mutex::new(Vec::new())));
    UploadScheduler::new(transport.clone(), "log").upload_pending(tmp.path());
    assert_eq!(
        *transport.0.lock().unwrap(),
        vec!["crash_100.log", "crash_100_1.log", "crash_200.log", "crash_300.log"]
    );
}
