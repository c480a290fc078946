//! Fault model: what crashed, where, and on which thread.
//!
//! A [`FaultEvent`] is built on the faulting thread (the backtrace has to be
//! captured there) and then handed to the dispatch worker behind an `Arc`.

use std::any::Any;
use std::backtrace::Backtrace;
use std::collections::TryReserveError;
use std::fmt;
use std::panic::PanicHookInfo;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum stack trace length kept in a fault (64 KiB).
pub const MAX_STACK_TRACE_LEN: usize = 64 * 1024;

const TRUNCATION_MARKER: &str = "\n... [truncated]";

/// `memory allocation of <N> bytes failed`, as printed by std's
/// allocation error handler.
const ALLOC_FAILURE_PREFIX: &str = "memory allocation of ";
const ALLOC_FAILURE_SUFFIX: &str = " bytes failed";

/// Coarse fault classification used for handler selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultClass {
    General,
    OutOfMemory,
}

impl FaultClass {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::General => "general",
            Self::OutOfMemory => "out_of_memory",
        }
    }
}

impl fmt::Display for FaultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the thread a fault occurred on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadIdentifier {
    pub name: Option<String>,
    /// `ThreadId` debug rendering, e.g. `ThreadId(7)`
    pub id: String,
}

impl ThreadIdentifier {
    #[must_use]
    pub fn current() -> Self {
        let thread = std::thread::current();
        Self {
            name: thread.name().map(String::from),
            id: format!("{:?}", thread.id()),
        }
    }

    /// Name if set, otherwise the id.
    #[must_use]
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

impl fmt::Display for ThreadIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name} ({})", self.id),
            None => f.write_str(&self.id),
        }
    }
}

/// Description of the fault itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultObject {
    pub class: FaultClass,
    /// Short kind tag: `panic`, `error`, `out_of_memory`, ...
    pub kind: String,
    pub description: String,
    /// `file:line:col`
    pub location: Option<String>,
    /// Rendered backtrace, truncated to [`MAX_STACK_TRACE_LEN`]
    pub stack_trace: Option<String>,
    /// Error source chain, outermost first
    pub causes: Vec<String>,
}

impl FaultObject {
    #[must_use]
    pub fn new(kind: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            class: FaultClass::General,
            kind: kind.into(),
            description: description.into(),
            location: None,
            stack_trace: None,
            causes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_class(mut self, class: FaultClass) -> Self {
        self.class = class;
        self
    }

    #[must_use]
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    #[must_use]
    pub fn with_stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = Some(truncate_trace(trace.into()));
        self
    }

    #[must_use]
    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    #[must_use]
    pub fn is_out_of_memory(&self) -> bool {
        self.class == FaultClass::OutOfMemory
    }
}

/// One fault occurrence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultEvent {
    pub thread: ThreadIdentifier,
    pub fault: FaultObject,
    pub occurred_at: DateTime<Utc>,
    pub pid: u32,
}

impl FaultEvent {
    /// Wrap a fault observed on the current thread.
    #[must_use]
    pub fn new(fault: FaultObject) -> Self {
        Self {
            thread: ThreadIdentifier::current(),
            fault,
            occurred_at: Utc::now(),
            pid: std::process::id(),
        }
    }

    /// Build from panic hook info. Must run on the panicking thread.
    ///
    /// Out-of-memory panics never capture a backtrace: resolving symbols
    /// allocates heavily.
    #[must_use]
    pub fn from_panic(info: &PanicHookInfo<'_>, capture_backtrace: bool) -> Self {
        let (kind, description, class) = describe_payload(info.payload());
        let mut fault = FaultObject::new(kind, description).with_class(class);
        if let Some(loc) = info.location() {
            fault = fault.with_location(format!("{}:{}:{}", loc.file(), loc.line(), loc.column()));
        }
        if capture_backtrace && class != FaultClass::OutOfMemory {
            fault = fault.with_stack_trace(Backtrace::force_capture().to_string());
        }
        Self::new(fault)
    }

    /// Build from a recoverable error, walking its `source()` chain.
    #[must_use]
    pub fn from_error(err: &(dyn std::error::Error + 'static), capture_backtrace: bool) -> Self {
        let mut fault = FaultObject::new("error", err.to_string());
        let mut source = err.source();
        while let Some(cause) = source {
            fault.causes.push(cause.to_string());
            source = cause.source();
        }
        if capture_backtrace {
            fault = fault.with_stack_trace(Backtrace::force_capture().to_string());
        }
        Self::new(fault)
    }

    /// Correlation-friendly thread label.
    #[must_use]
    pub fn thread_label(&self) -> &str {
        self.thread.label()
    }
}

fn describe_payload(payload: &(dyn Any + Send)) -> (&'static str, String, FaultClass) {
    if let Some(err) = payload.downcast_ref::<TryReserveError>() {
        return ("out_of_memory", err.to_string(), FaultClass::OutOfMemory);
    }
    let message = if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    if is_allocation_failure(&message) {
        ("out_of_memory", message, FaultClass::OutOfMemory)
    } else {
        ("panic", message, FaultClass::General)
    }
}

/// True only for std's allocation failure message with a byte count.
///
/// `capacity overflow` is a size computation bug raised with a healthy heap
/// and stays [`FaultClass::General`].
#[must_use]
pub fn is_allocation_failure(message: &str) -> bool {
    message
        .trim()
        .strip_prefix(ALLOC_FAILURE_PREFIX)
        .and_then(|rest| rest.strip_suffix(ALLOC_FAILURE_SUFFIX))
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// Truncate on a char boundary at or below [`MAX_STACK_TRACE_LEN`].
#[must_use]
pub fn truncate_trace(mut trace: String) -> String {
    if trace.len() <= MAX_STACK_TRACE_LEN {
        return trace;
    }
    let mut end = MAX_STACK_TRACE_LEN;
    while !trace.is_char_boundary(end) {
        end -= 1;
    }
    trace.truncate(end);
    trace.push_str(TRUNCATION_MARKER);
    trace
}
