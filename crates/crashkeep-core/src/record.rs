//! Crash record rendering and identity.
//!
//! # Record Layout
//!
//! ```text
//! ========== Crash Report ==========
//! [Crash Time]
//! 2026-03-01 12:00:00.123 +0100
//!
//! [Device Information]
//! OS: linux
//! ...
//!
//! [Stack Trace]
//! Thread: main (ThreadId(1))
//! ...
//! ========== End Report ==========
//! ```

use std::fmt::{self, Write as _};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::fault::FaultEvent;
use crate::handler::panic_message;
use crate::metadata::{Field, MetadataSource, Section};
use crate::redact::Redactor;

pub const REPORT_HEADER: &str = "========== Crash Report ==========";
pub const REPORT_TRAILER: &str = "========== End Report ==========";

/// File name prefix shared by every record.
pub const RECORD_PREFIX: &str = "crash_";

const CRASH_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f %z";

/// Record identity derived from the write timestamp.
///
/// `seq` disambiguates records written within the same millisecond; zero
/// means no suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordId {
    pub millis: u64,
    pub seq: u32,
}

impl RecordId {
    #[must_use]
    pub const fn new(millis: u64, seq: u32) -> Self {
        Self { millis, seq }
    }

    /// `crash_<millis>` or `crash_<millis>_<seq>`
    #[must_use]
    pub fn file_stem(&self) -> String {
        if self.seq == 0 {
            format!("{RECORD_PREFIX}{}", self.millis)
        } else {
            format!("{RECORD_PREFIX}{}_{}", self.millis, self.seq)
        }
    }

    #[must_use]
    pub fn file_name(&self, extension: &str) -> String {
        format!("{}.{extension}", self.file_stem())
    }

    /// Parse a record file name with the given extension.
    #[must_use]
    pub fn parse_file_name(name: &str, extension: &str) -> Option<Self> {
        let stem = name.strip_suffix(extension)?.strip_suffix('.')?;
        Self::parse_stem(stem)
    }

    /// Parse `crash_<millis>[_<seq>]`.
    #[must_use]
    pub fn parse_stem(stem: &str) -> Option<Self> {
        let rest = stem.strip_prefix(RECORD_PREFIX)?;
        let (millis, seq) = match rest.split_once('_') {
            Some((millis, seq)) => (millis, parse_digits::<u32>(seq)?),
            None => (rest, 0),
        };
        let millis = parse_digits::<u64>(millis)?;
        if seq == 0 && rest.contains('_') {
            return None;
        }
        Some(Self { millis, seq })
    }
}

fn parse_digits<T: std::str::FromStr>(s: &str) -> Option<T> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    // Only canonical numbers, so one id never has two file names.
    if s.len() > 1 && s.starts_with('0') {
        return None;
    }
    s.parse().ok()
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_stem())
    }
}

/// A record durably written to the log directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordHandle {
    pub id: RecordId,
    pub path: PathBuf,
    pub len: u64,
}

/// Renders a [`FaultEvent`] plus environment metadata into record bytes.
#[derive(Clone)]
pub struct RecordBuilder {
    source: Arc<dyn MetadataSource>,
    redactor: Option<Redactor>,
}

impl fmt::Debug for RecordBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordBuilder")
            .field("redact", &self.redactor.is_some())
            .finish_non_exhaustive()
    }
}

impl RecordBuilder {
    pub fn new(source: Arc<dyn MetadataSource>) -> Self {
        Self {
            source,
            redactor: None,
        }
    }

    #[must_use]
    pub fn with_redaction(mut self, enabled: bool) -> Self {
        self.redactor = enabled.then(Redactor::new);
        self
    }

    /// Render the record. Never panics on metadata failures: each failing
    /// section becomes a placeholder line.
    pub fn build(&self, event: &FaultEvent) -> Vec<u8> {
        let mut out = String::with_capacity(4096);
        out.push_str(REPORT_HEADER);
        out.push('\n');

        push_title(&mut out, Section::CrashTime);
        let local = event.occurred_at.with_timezone(&Local);
        let _ = writeln!(out, "{}", local.format(CRASH_TIME_FORMAT));
        out.push('\n');

        for section in Section::COLLECTED {
            push_title(&mut out, section);
            match self.collect_guarded(section) {
                Ok(fields) if fields.is_empty() => {
                    let _ = writeln!(out, "{}", section.placeholder("no data"));
                }
                Ok(fields) => {
                    for field in fields {
                        let _ = writeln!(out, "{}: {}", field.key, field.value);
                    }
                }
                Err(reason) => {
                    tracing::debug!(section = section.title(), %reason, "metadata section unavailable");
                    let _ = writeln!(out, "{}", section.placeholder(&reason));
                }
            }
            out.push('\n');
        }

        push_title(&mut out, Section::StackTrace);
        self.push_fault(&mut out, event);

        out.push_str(REPORT_TRAILER);
        out.push('\n');
        out.into_bytes()
    }

    fn collect_guarded(&self, section: Section) -> Result<Vec<Field>, String> {
        match catch_unwind(AssertUnwindSafe(|| self.source.collect(section))) {
            Ok(Ok(fields)) => Ok(fields),
            Ok(Err(err)) => Err(err.to_string()),
            Err(payload) => Err(format!(
                "collector panicked: {}",
                panic_message(payload.as_ref())
            )),
        }
    }

    fn push_fault(&self, out: &mut String, event: &FaultEvent) {
        let fault = &event.fault;
        let _ = writeln!(out, "Thread: {}", event.thread);
        let _ = writeln!(out, "Process ID: {}", event.pid);
        let _ = writeln!(out, "Fault Class: {}", fault.class);
        let _ = writeln!(out, "Kind: {}", fault.kind);
        let _ = writeln!(out, "Description: {}", self.scrub(&fault.description));
        if let Some(location) = &fault.location {
            let _ = writeln!(out, "Location: {location}");
        }
        for cause in &fault.causes {
            let _ = writeln!(out, "Caused by: {}", self.scrub(cause));
        }
        match &fault.stack_trace {
            Some(trace) => {
                out.push_str("Backtrace:\n");
                out.push_str(&self.scrub(trace));
                if !trace.ends_with('\n') {
                    out.push('\n');
                }
            }
            None => out.push_str("Backtrace: not captured\n"),
        }
    }

    fn scrub(&self, text: &str) -> String {
        match &self.redactor {
            Some(redactor) => redactor.redact(text),
            None => text.to_string(),
        }
    }
}

fn push_title(out: &mut String, section: Section) {
    let _ = writeln!(out, "[{}]", section.title());
}
