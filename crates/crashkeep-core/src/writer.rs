//! Durable record writer.
//!
//! A record is written with a size / write / force sequence and the call does
//! not return success until the bytes are on stable storage:
//!
//! 1. `create_new` a uniquely named file (`0600` on unix)
//! 2. `set_len` to exactly the payload length
//! 3. `write_all` the payload
//! 4. `sync_all` the file, then best-effort fsync of the directory
//!
//! The open file sits in a [`PartialFile`] guard that removes it on every
//! error path.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::PersistenceError;
use crate::record::{RecordHandle, RecordId};
use crate::store::LogDirectory;

/// Highest same-millisecond suffix tried before giving up.
pub const MAX_NAME_ATTEMPTS: u32 = 100;

/// Destination for rendered records.
pub trait RecordSink: Send + Sync {
    /// Persist `payload` as a new record.
    fn persist(&self, payload: &[u8]) -> Result<RecordHandle, PersistenceError>;

    /// Directory the sink writes into; heap snapshots land here too.
    fn directory(&self) -> &Path;
}

/// [`RecordSink`] writing durable files into a [`LogDirectory`].
#[derive(Debug, Clone)]
pub struct DurableWriter {
    dir: Arc<LogDirectory>,
    extension: String,
}

impl DurableWriter {
    pub fn new(dir: Arc<LogDirectory>, extension: impl Into<String>) -> Self {
        Self {
            dir,
            extension: extension.into(),
        }
    }
}

impl RecordSink for DurableWriter {
    fn persist(&self, payload: &[u8]) -> Result<RecordHandle, PersistenceError> {
        write_record(&self.dir, &self.extension, payload)
    }

    fn directory(&self) -> &Path {
        self.dir.path()
    }
}

/// Write `payload` as a new record named after the current millisecond.
pub fn write_record(
    dir: &LogDirectory,
    extension: &str,
    payload: &[u8],
) -> Result<RecordHandle, PersistenceError> {
    write_record_at(dir, extension, payload, epoch_millis())
}

/// Like [`write_record`] with an explicit timestamp.
pub fn write_record_at(
    dir: &LogDirectory,
    extension: &str,
    payload: &[u8],
    millis: u64,
) -> Result<RecordHandle, PersistenceError> {
    let root = dir.ensure()?;
    let (id, mut guard) = create_unique(root, extension, millis)?;
    let len = payload.len() as u64;

    guard
        .file()
        .and_then(|f| f.set_len(len))
        .map_err(|source| PersistenceError::Allocate {
            path: guard.path.clone(),
            len,
            source,
        })?;
    guard
        .file()
        .and_then(|f| f.write_all(payload))
        .map_err(|source| PersistenceError::Write {
            path: guard.path.clone(),
            source,
        })?;
    guard
        .file()
        .and_then(|f| f.sync_all())
        .map_err(|source| PersistenceError::Sync {
            path: guard.path.clone(),
            source,
        })?;

    let path = guard.commit();
    sync_directory(root);
    Ok(RecordHandle { id, path, len })
}

fn create_unique(
    root: &Path,
    extension: &str,
    millis: u64,
) -> Result<(RecordId, PartialFile), PersistenceError> {
    for seq in 0..=MAX_NAME_ATTEMPTS {
        let id = RecordId::new(millis, seq);
        let path = root.join(id.file_name(extension));
        match open_new(&path) {
            Ok(file) => return Ok((id, PartialFile::new(path, file))),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(source) => return Err(PersistenceError::Create { path, source }),
        }
    }
    Err(PersistenceError::NameExhausted {
        dir: root.to_path_buf(),
        millis,
    })
}

fn open_new(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}

#[cfg(unix)]
fn sync_directory(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        tracing::debug!(path = %dir.display(), error = %e, "directory fsync failed");
    }
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) {}

pub(crate) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Open record file that is deleted on drop unless committed.
struct PartialFile {
    path: PathBuf,
    file: Option<File>,
}

impl PartialFile {
    fn new(path: PathBuf, file: File) -> Self {
        Self {
            path,
            file: Some(file),
        }
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::other("record file already closed"))
    }

    /// Close the handle and keep the file.
    fn commit(mut self) -> PathBuf {
        drop(self.file.take());
        std::mem::take(&mut self.path)
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            drop(file);
            if let Err(e) = fs::remove_file(&self.path) {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to remove partial record");
            }
        }
    }
}
