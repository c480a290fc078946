//! Fault handler chain.
//!
//! Handlers are consulted in ascending priority (ties in registration order).
//! The first handler whose `can_handle` returns true runs, and its
//! `suppress_termination` policy decides what happens to the process. At most
//! one handler runs per fault: a fault nobody claims goes to the fallback,
//! which always records it.
//!
//! The list is copy-on-write. Dispatch clones an `Arc` of the current list
//! under a short read lock; registration builds a new list and swaps it in.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{HandlerError, PersistenceError, SnapshotError};
use crate::fault::{FaultClass, FaultEvent};
use crate::record::{RecordBuilder, RecordHandle};
use crate::writer::RecordSink;

/// Priority of the built-in out-of-memory handler.
pub const OOM_HANDLER_PRIORITY: i32 = -1000;

/// Priority used when none is given.
pub const DEFAULT_PRIORITY: i32 = 0;

/// Name of the built-in fallback handler.
pub const FALLBACK_HANDLER_NAME: &str = "record";

/// Captures a heap snapshot into a directory.
pub trait HeapSnapshotter: Send + Sync {
    fn capture(&self, dir: &Path) -> Result<PathBuf, SnapshotError>;
}

/// What a handler gets to work with.
pub struct HandlerContext<'a> {
    pub sink: &'a dyn RecordSink,
    pub builder: &'a RecordBuilder,
    pub snapshotter: Option<&'a dyn HeapSnapshotter>,
}

impl HandlerContext<'_> {
    /// Render `event` and persist it through the sink.
    pub fn write_record(&self, event: &FaultEvent) -> Result<RecordHandle, PersistenceError> {
        let payload = self.builder.build(event);
        self.sink.persist(&payload)
    }
}

/// Result of a handler that ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    /// A text record was written
    Recorded(RecordHandle),
    /// A heap snapshot was attempted; `None` when no snapshotter is wired
    Snapshot(Option<PathBuf>),
    /// The handler only logged or notified
    Logged,
}

impl HandlerOutcome {
    #[must_use]
    pub fn record(&self) -> Option<&RecordHandle> {
        match self {
            Self::Recorded(handle) => Some(handle),
            _ => None,
        }
    }
}

/// A pluggable unit of fault handling.
pub trait FaultHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Capability predicate.
    fn can_handle(&self, event: &FaultEvent) -> bool;

    fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        event: &FaultEvent,
    ) -> Result<HandlerOutcome, HandlerError>;

    /// Post-handling policy: return true to keep the process alive after a
    /// fatal fault this handler handled.
    fn suppress_termination(&self, _event: &FaultEvent) -> bool {
        false
    }
}

/// A registered handler.
#[derive(Clone)]
pub struct HandlerEntry {
    pub handler: Arc<dyn FaultHandler>,
    pub priority: i32,
}

impl fmt::Debug for HandlerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerEntry")
            .field("name", &self.handler.name())
            .field("priority", &self.priority)
            .finish()
    }
}

/// Outcome of running the chain for one fault.
#[derive(Debug)]
pub struct ChainOutcome {
    /// Name of the handler that ran
    pub handler: String,
    pub result: Result<HandlerOutcome, HandlerError>,
    pub suppress_termination: bool,
    /// Handlers that claimed the fault but reported a classification mismatch
    pub skipped: Vec<String>,
    pub used_fallback: bool,
}

impl ChainOutcome {
    #[must_use]
    pub fn record(&self) -> Option<&RecordHandle> {
        self.result.as_ref().ok().and_then(HandlerOutcome::record)
    }
}

/// Ordered, copy-on-write handler list with a fixed fallback.
pub struct HandlerChain {
    entries: RwLock<Arc<Vec<HandlerEntry>>>,
    fallback: Arc<dyn FaultHandler>,
}

impl fmt::Debug for HandlerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerChain")
            .field("entries", &self.snapshot())
            .field("fallback", &self.fallback.name())
            .finish()
    }
}

impl HandlerChain {
    /// Empty chain with the given fallback.
    pub fn new(fallback: Arc<dyn FaultHandler>) -> Self {
        Self {
            entries: RwLock::new(Arc::new(Vec::new())),
            fallback,
        }
    }

    /// Out-of-memory handler plus the record fallback.
    #[must_use]
    pub fn with_defaults() -> Self {
        let chain = Self::new(Arc::new(RecordFallbackHandler));
        chain.register(Arc::new(OutOfMemoryHandler), OOM_HANDLER_PRIORITY);
        chain
    }

    /// Insert after every entry with priority `<= priority`.
    pub fn register(&self, handler: Arc<dyn FaultHandler>, priority: i32) {
        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut next: Vec<HandlerEntry> = guard.as_ref().clone();
        let at = next.partition_point(|e| e.priority <= priority);
        tracing::debug!(handler = handler.name(), priority, position = at, "Registering fault handler");
        next.insert(at, HandlerEntry { handler, priority });
        *guard = Arc::new(next);
    }

    /// Remove every handler named `name`. Returns true if one was removed.
    pub fn remove(&self, name: &str) -> bool {
        let mut guard = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = guard.len();
        let next: Vec<HandlerEntry> = guard
            .iter()
            .filter(|e| e.handler.name() != name)
            .cloned()
            .collect();
        let removed = next.len() != before;
        if removed {
            *guard = Arc::new(next);
        }
        removed
    }

    /// Current list, not including the fallback.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<HandlerEntry>> {
        Arc::clone(&self.entries.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Handler names in dispatch order, fallback last.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.snapshot()
            .iter()
            .map(|e| e.handler.name().to_string())
            .chain(std::iter::once(self.fallback.name().to_string()))
            .collect()
    }

    /// Run the first capable handler for `event`.
    ///
    /// Never panics: a panicking predicate counts as "cannot handle", a
    /// panicking action becomes `HandlerError::Other`.
    pub fn dispatch(&self, ctx: &HandlerContext<'_>, event: &FaultEvent) -> ChainOutcome {
        let entries = self.snapshot();
        let mut skipped = Vec::new();

        for entry in entries.iter() {
            let handler = entry.handler.as_ref();
            let capable = catch_unwind(AssertUnwindSafe(|| handler.can_handle(event)))
                .unwrap_or_else(|payload| {
                    tracing::warn!(
                        handler = handler.name(),
                        panic = %panic_message(payload.as_ref()),
                        "handler predicate panicked; skipping"
                    );
                    false
                });
            if !capable {
                continue;
            }
            match run_handler(handler, ctx, event) {
                Err(HandlerError::ClassificationMismatch { handler: name, kind }) => {
                    tracing::warn!(handler = %name, kind = %kind, "handler declined fault after claiming it");
                    skipped.push(name);
                }
                result => return finish(handler, result, event, skipped, false),
            }
        }

        let result = run_handler(self.fallback.as_ref(), ctx, event);
        finish(self.fallback.as_ref(), result, event, skipped, true)
    }
}

fn run_handler(
    handler: &dyn FaultHandler,
    ctx: &HandlerContext<'_>,
    event: &FaultEvent,
) -> Result<HandlerOutcome, HandlerError> {
    catch_unwind(AssertUnwindSafe(|| handler.handle(ctx, event))).unwrap_or_else(|payload| {
        Err(HandlerError::Other(format!(
            "handler {} panicked: {}",
            handler.name(),
            panic_message(payload.as_ref())
        )))
    })
}

fn finish(
    handler: &dyn FaultHandler,
    result: Result<HandlerOutcome, HandlerError>,
    event: &FaultEvent,
    skipped: Vec<String>,
    used_fallback: bool,
) -> ChainOutcome {
    let suppress_termination =
        catch_unwind(AssertUnwindSafe(|| handler.suppress_termination(event))).unwrap_or(false);

    match &result {
        Ok(outcome) => {
            let record_id = outcome.record().map(|r| r.id.to_string()).unwrap_or_default();
            tracing::info!(
                handler = handler.name(),
                fault_class = %event.fault.class,
                record_id = %record_id,
                used_fallback,
                "Fault handled"
            );
        }
        Err(err) if used_fallback && err.is_persistence() => tracing::error!(
            handler = handler.name(),
            error = %err,
            "Crash record lost: fallback handler could not persist"
        ),
        Err(err) => tracing::warn!(handler = handler.name(), error = %err, "Fault handler failed"),
    }

    ChainOutcome {
        handler: handler.name().to_string(),
        result,
        suppress_termination,
        skipped,
        used_fallback,
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Handles out-of-memory faults without touching the text record path.
///
/// Rendering a record allocates; under memory exhaustion that is the wrong
/// move. When a [`HeapSnapshotter`] is wired the handler asks it for a dump
/// in the record directory instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct OutOfMemoryHandler;

impl FaultHandler for OutOfMemoryHandler {
    fn name(&self) -> &str {
        "out_of_memory"
    }

    fn can_handle(&self, event: &FaultEvent) -> bool {
        event.fault.class == FaultClass::OutOfMemory
    }

    fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        event: &FaultEvent,
    ) -> Result<HandlerOutcome, HandlerError> {
        if event.fault.class != FaultClass::OutOfMemory {
            return Err(HandlerError::ClassificationMismatch {
                handler: self.name().to_string(),
                kind: event.fault.kind.clone(),
            });
        }
        match ctx.snapshotter {
            Some(snapshotter) => {
                let path = snapshotter.capture(ctx.sink.directory())?;
                Ok(HandlerOutcome::Snapshot(Some(path)))
            }
            None => Ok(HandlerOutcome::Snapshot(None)),
        }
    }
}

/// Fallback: renders and persists a text record for any fault.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordFallbackHandler;

impl FaultHandler for RecordFallbackHandler {
    fn name(&self) -> &str {
        FALLBACK_HANDLER_NAME
    }

    fn can_handle(&self, _event: &FaultEvent) -> bool {
        true
    }

    fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        event: &FaultEvent,
    ) -> Result<HandlerOutcome, HandlerError> {
        Ok(HandlerOutcome::Recorded(ctx.write_record(event)?))
    }
}

type Predicate = dyn Fn(&FaultEvent) -> bool + Send + Sync;
type Action = dyn Fn(&HandlerContext<'_>, &FaultEvent) -> Result<HandlerOutcome, HandlerError> + Send + Sync;

/// Handler assembled from closures.
///
/// ```ignore
/// let handler = FnHandler::new(
///     "net",
///     |event| event.fault.description.contains("connection reset"),
///     |ctx, event| Ok(HandlerOutcome::Recorded(ctx.write_record(event)?)),
/// )
/// .suppressing(|_| true);
/// ```
pub struct FnHandler {
    name: String,
    predicate: Box<Predicate>,
    action: Box<Action>,
    policy: Box<Predicate>,
}

impl FnHandler {
    pub fn new<P, A>(name: impl Into<String>, predicate: P, action: A) -> Self
    where
        P: Fn(&FaultEvent) -> bool + Send + Sync + 'static,
        A: Fn(&HandlerContext<'_>, &FaultEvent) -> Result<HandlerOutcome, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            predicate: Box::new(predicate),
            action: Box::new(action),
            policy: Box::new(|_| false),
        }
    }

    /// Set the post-handling policy.
    #[must_use]
    pub fn suppressing<F>(mut self, policy: F) -> Self
    where
        F: Fn(&FaultEvent) -> bool + Send + Sync + 'static,
    {
        self.policy = Box::new(policy);
        self
    }
}

impl fmt::Debug for FnHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").field("name", &self.name).finish_non_exhaustive()
    }
}

impl FaultHandler for FnHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_handle(&self, event: &FaultEvent) -> bool {
        (self.predicate)(event)
    }

    fn handle(
        &self,
        ctx: &HandlerContext<'_>,
        event: &FaultEvent,
    ) -> Result<HandlerOutcome, HandlerError> {
        (self.action)(ctx, event)
    }

    fn suppress_termination(&self, event: &FaultEvent) -> bool {
        (self.policy)(event)
    }
}
