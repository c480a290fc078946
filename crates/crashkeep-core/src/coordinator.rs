//! Dispatch coordinator: one worker thread, FIFO, decides termination.
//!
//! ```text
//! Idle ──notify──▶ Dispatching ──chain done──▶ Deciding ─┬─▶ Terminating
//!                                                        └─▶ Resumed ──▶ Idle
//! ```
//!
//! Every record write and every maintenance pass (upload, retention) runs on
//! the `crashkeep-dispatch` thread, so writes to the log directory never
//! interleave. A fault is `Terminating` when it was dispatched as
//! [`FaultMode::Fatal`] and the handler that ran did not suppress
//! termination. The [`Terminator`] then waits out the grace period and ends
//! the process.

use std::cell::Cell;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::config::{DispatchConfig, MAX_GRACE_PERIOD_MS, TerminationMode};
use crate::error::{Error, Result};
use crate::fault::FaultEvent;
use crate::handler::{HandlerChain, HandlerContext, HandlerOutcome, HeapSnapshotter, panic_message};
use crate::record::{RecordBuilder, RecordHandle};
use crate::writer::RecordSink;

/// Name of the dispatch worker thread.
pub const WORKER_THREAD_NAME: &str = "crashkeep-dispatch";

thread_local! {
    static IN_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// True on a dispatch worker thread. Faults raised there must not be queued
/// back onto the same worker.
#[must_use]
pub fn on_worker_thread() -> bool {
    IN_WORKER.with(Cell::get)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    Idle,
    Dispatching,
    Deciding,
    Terminating,
    Resumed,
}

impl DispatchState {
    const fn to_u8(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Dispatching => 1,
            Self::Deciding => 2,
            Self::Terminating => 3,
            Self::Resumed => 4,
        }
    }

    const fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Dispatching,
            2 => Self::Deciding,
            3 => Self::Terminating,
            4 => Self::Resumed,
            _ => Self::Idle,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Dispatching => "dispatching",
            Self::Deciding => "deciding",
            Self::Terminating => "terminating",
            Self::Resumed => "resumed",
        }
    }
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the process may continue after the fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultMode {
    /// Unhandled panic: the process ends unless the handler suppresses it
    Fatal,
    /// Reported fault: record it and carry on
    NonFatal,
}

/// How the process is ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationAction {
    Exit(i32),
    Abort,
}

/// Ends the process. Implementations used in production do not return.
pub trait Terminator: Send + Sync {
    fn terminate(&self, grace: Duration, action: TerminationAction);
}

/// Sleeps the grace period, then `exit`s or `abort`s.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessTerminator;

impl Terminator for ProcessTerminator {
    fn terminate(&self, grace: Duration, action: TerminationAction) {
        if !grace.is_zero() {
            std::thread::sleep(grace);
        }
        match action {
            TerminationAction::Exit(code) => std::process::exit(code),
            TerminationAction::Abort => std::process::abort(),
        }
    }
}

/// Grace period and action applied in `Terminating`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationPolicy {
    pub grace_period: Duration,
    pub action: TerminationAction,
}

impl TerminationPolicy {
    #[must_use]
    pub fn from_config(config: &DispatchConfig) -> Self {
        let action = match config.termination {
            TerminationMode::Exit => TerminationAction::Exit(config.exit_code),
            TerminationMode::Abort => TerminationAction::Abort,
        };
        Self {
            grace_period: Duration::from_millis(config.grace_period_ms),
            action,
        }
        .capped()
    }

    #[must_use]
    fn capped(mut self) -> Self {
        self.grace_period = self
            .grace_period
            .min(Duration::from_millis(MAX_GRACE_PERIOD_MS));
        self
    }
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

/// What happened to one dispatched fault.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Handler that ran
    pub handler: String,
    pub mode: FaultMode,
    pub record: Option<RecordHandle>,
    pub snapshot: Option<PathBuf>,
    /// Handler failure, rendered
    pub error: Option<String>,
    pub suppress_termination: bool,
    pub used_fallback: bool,
    pub skipped: Vec<String>,
    /// `Terminating` or `Resumed`
    pub final_state: DispatchState,
    pub started_at: Instant,
    pub finished_at: Instant,
}

impl DispatchOutcome {
    #[must_use]
    pub fn is_terminating(&self) -> bool {
        self.final_state == DispatchState::Terminating
    }
}

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Job {
    Fault {
        event: Arc<FaultEvent>,
        mode: FaultMode,
        reply: Sender<DispatchOutcome>,
    },
    Maintenance {
        name: String,
        task: Task,
    },
}

/// Everything the worker needs to handle faults.
pub struct CoordinatorParts {
    pub chain: Arc<HandlerChain>,
    pub sink: Arc<dyn RecordSink>,
    pub builder: RecordBuilder,
    pub snapshotter: Option<Arc<dyn HeapSnapshotter>>,
    pub terminator: Arc<dyn Terminator>,
    pub policy: TerminationPolicy,
}

struct Worker {
    chain: Arc<HandlerChain>,
    sink: Arc<dyn RecordSink>,
    builder: RecordBuilder,
    snapshotter: Option<Arc<dyn HeapSnapshotter>>,
    terminator: Arc<dyn Terminator>,
    policy: TerminationPolicy,
    state: Arc<AtomicU8>,
}

impl Worker {
    fn run(self, jobs: Receiver<Job>) {
        IN_WORKER.with(|flag| flag.set(true));
        tracing::debug!("Dispatch worker started");
        for job in jobs.iter() {
            match job {
                Job::Fault { event, mode, reply } => {
                    let handled = catch_unwind(AssertUnwindSafe(|| {
                        let outcome = self.process(&event, mode);
                        let _ = reply.send(outcome);
                    }));
                    if let Err(payload) = handled {
                        self.set_state(DispatchState::Idle);
                        tracing::error!(
                            thread = event.thread_label(),
                            panic = %panic_message(payload.as_ref()),
                            "Dispatch worker panicked while handling fault"
                        );
                    }
                }
                Job::Maintenance { name, task } => {
                    tracing::debug!(task = %name, "Running maintenance task");
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
                        tracing::error!(
                            task = %name,
                            panic = %panic_message(payload.as_ref()),
                            "Maintenance task panicked"
                        );
                    }
                }
            }
        }
        tracing::debug!("Dispatch worker stopped");
    }

    fn set_state(&self, state: DispatchState) {
        self.state.store(state.to_u8(), Ordering::SeqCst);
    }

    fn process(&self, event: &FaultEvent, mode: FaultMode) -> DispatchOutcome {
        let span = crate::crash_span!(
            "dispatch",
            thread = event.thread_label(),
            fault_class = event.fault.class.as_str(),
        );
        let _guard = span.enter();

        self.set_state(DispatchState::Dispatching);
        let started_at = Instant::now();
        let ctx = HandlerContext {
            sink: self.sink.as_ref(),
            builder: &self.builder,
            snapshotter: self.snapshotter.as_deref(),
        };
        let chain_outcome = self.chain.dispatch(&ctx, event);
        let finished_at = Instant::now();

        self.set_state(DispatchState::Deciding);
        let terminate = mode == FaultMode::Fatal && !chain_outcome.suppress_termination;
        let final_state = if terminate {
            DispatchState::Terminating
        } else {
            DispatchState::Resumed
        };
        self.set_state(final_state);

        let (record, snapshot, error) = match chain_outcome.result {
            Ok(HandlerOutcome::Recorded(handle)) => (Some(handle), None, None),
            Ok(HandlerOutcome::Snapshot(path)) => (None, path, None),
            Ok(HandlerOutcome::Logged) => (None, None, None),
            Err(err) => (None, None, Some(err.to_string())),
        };
        let outcome = DispatchOutcome {
            handler: chain_outcome.handler,
            mode,
            record,
            snapshot,
            error,
            suppress_termination: chain_outcome.suppress_termination,
            used_fallback: chain_outcome.used_fallback,
            skipped: chain_outcome.skipped,
            final_state,
            started_at,
            finished_at,
        };

        if terminate {
            tracing::info!(
                dispatch_state = final_state.as_str(),
                grace_ms = self.policy.grace_period.as_millis() as u64,
                action = ?self.policy.action,
                "Terminating process after fatal fault"
            );
            self.terminator
                .terminate(self.policy.grace_period, self.policy.action);
            tracing::warn!("Terminator returned; process keeps running");
        } else {
            tracing::debug!(dispatch_state = final_state.as_str(), "Fault dispatch resumed");
        }
        self.set_state(DispatchState::Idle);
        outcome
    }
}

/// Serializes faults and maintenance work onto one worker thread.
pub struct DispatchCoordinator {
    sender: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    state: Arc<AtomicU8>,
    terminator: Arc<dyn Terminator>,
}

impl fmt::Debug for DispatchCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchCoordinator")
            .field("state", &self.state())
            .field("running", &self.is_running())
            .finish()
    }
}

impl DispatchCoordinator {
    /// Start the worker thread.
    pub fn spawn(parts: CoordinatorParts) -> Result<Self> {
        let (sender, receiver) = channel::unbounded();
        let state = Arc::new(AtomicU8::new(DispatchState::Idle.to_u8()));
        let terminator = Arc::clone(&parts.terminator);
        let worker = Worker {
            chain: parts.chain,
            sink: parts.sink,
            builder: parts.builder,
            snapshotter: parts.snapshotter,
            terminator: parts.terminator,
            policy: parts.policy.capped(),
            state: Arc::clone(&state),
        };
        let handle = std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || worker.run(receiver))?;
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(handle)),
            state,
            terminator,
        })
    }

    #[must_use]
    pub fn state(&self) -> DispatchState {
        DispatchState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn submit(&self, job: Job) -> Result<()> {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = guard.as_ref() else {
            return Err(Error::WorkerUnavailable("coordinator shut down".to_string()));
        };
        sender
            .send(job)
            .map_err(|_| Error::WorkerUnavailable("dispatch worker exited".to_string()))
    }

    /// Queue a fault; the receiver yields its outcome once handled.
    pub fn notify(&self, event: Arc<FaultEvent>, mode: FaultMode) -> Result<Receiver<DispatchOutcome>> {
        let (reply, outcome) = channel::bounded(1);
        self.submit(Job::Fault { event, mode, reply })?;
        Ok(outcome)
    }

    /// Queue a fault and wait for its outcome.
    ///
    /// A fatal fault that cannot be handled because the worker is gone, or
    /// died while handling it, escalates to an immediate abort through the
    /// terminator.
    pub fn dispatch_blocking(&self, event: Arc<FaultEvent>, mode: FaultMode) -> Result<DispatchOutcome> {
        if on_worker_thread() {
            return Err(Error::WorkerUnavailable(
                "cannot dispatch from the dispatch worker itself".to_string(),
            ));
        }
        let receiver = match self.notify(event, mode) {
            Ok(receiver) => receiver,
            Err(err) => {
                if mode == FaultMode::Fatal {
                    self.escalate(&err);
                }
                return Err(err);
            }
        };
        receiver.recv().map_err(|_| {
            let err = Error::WorkerUnavailable("worker dropped the fault".to_string());
            if mode == FaultMode::Fatal {
                self.escalate(&err);
            }
            err
        })
    }

    fn escalate(&self, err: &Error) {
        tracing::error!(error = %err, "Fatal fault could not be dispatched; aborting");
        self.terminator.terminate(Duration::ZERO, TerminationAction::Abort);
    }

    /// Run `task` on the worker after everything already queued.
    pub fn schedule<F>(&self, name: impl Into<String>, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Job::Maintenance {
            name: name.into(),
            task: Box::new(task),
        })
    }

    /// Stop accepting work, drain the queue and join the worker.
    pub fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(sender);
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if on_worker_thread() {
                return;
            }
            if handle.join().is_err() {
                tracing::warn!("Dispatch worker exited with a panic");
            }
        }
    }
}

impl Drop for DispatchCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FaultObject;
    use crate::handler::{FnHandler, HandlerOutcome};
    use crate::metadata::{Field, MetadataError, MetadataSource, Section};
    use crate::store::LogDirectory;
    use crate::writer::DurableWriter;

    struct NoMetadata;

    impl MetadataSource for NoMetadata {
        fn collect(&self, _section: Section) -> std::result::Result<Vec<Field>, MetadataError> {
            Err(MetadataError::Unsupported)
        }
    }

    #[derive(Default)]
    struct RecordingTerminator {
        calls: Mutex<Vec<(Duration, TerminationAction)>>,
        panic_on_exit: bool,
    }

    impl Terminator for RecordingTerminator {
        fn terminate(&self, grace: Duration, action: TerminationAction) {
            self.calls.lock().unwrap().push((grace, action));
            if self.panic_on_exit && matches!(action, TerminationAction::Exit(_)) {
                panic!("terminator failed");
            }
        }
    }

    struct Harness {
        _tmp: tempfile::TempDir,
        dir: PathBuf,
        chain: Arc<HandlerChain>,
        terminator: Arc<RecordingTerminator>,
        coordinator: Arc<DispatchCoordinator>,
    }

    fn harness_with(terminator: RecordingTerminator) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("logs");
        let chain = Arc::new(HandlerChain::with_defaults());
        let terminator = Arc::new(terminator);
        let coordinator = DispatchCoordinator::spawn(CoordinatorParts {
            chain: Arc::clone(&chain),
            sink: Arc::new(DurableWriter::new(Arc::new(LogDirectory::new(&dir)), "log")),
            builder: RecordBuilder::new(Arc::new(NoMetadata)),
            snapshotter: None,
            terminator: terminator.clone(),
            policy: TerminationPolicy {
                grace_period: Duration::from_millis(25),
                action: TerminationAction::Exit(101),
            },
        })
        .unwrap();
        Harness {
            _tmp: tmp,
            dir,
            chain,
            terminator,
            coordinator: Arc::new(coordinator),
        }
    }

    fn harness() -> Harness {
        harness_with(RecordingTerminator::default())
    }

    fn event(description: &str) -> Arc<FaultEvent> {
        Arc::new(FaultEvent::new(FaultObject::new("panic", description)))
    }

    #[test]
    fn non_fatal_dispatch_resumes() {
        let h = harness();
        let outcome = h
            .coordinator
            .dispatch_blocking(event("reported"), FaultMode::NonFatal)
            .unwrap();
        assert_eq!(outcome.final_state, DispatchState::Resumed);
        assert!(outcome.used_fallback);
        assert!(outcome.record.as_ref().unwrap().path.starts_with(&h.dir));
        assert!(h.terminator.calls.lock().unwrap().is_empty());
        assert_eq!(h.coordinator.state(), DispatchState::Idle);
    }

    #[test]
    fn fatal_dispatch_terminates_after_grace() {
        let h = harness();
        let outcome = h
            .coordinator
            .dispatch_blocking(event("fatal"), FaultMode::Fatal)
            .unwrap();
        assert!(outcome.is_terminating());
        assert!(outcome.record.is_some());
        assert_eq!(
            *h.terminator.calls.lock().unwrap(),
            vec![(Duration::from_millis(25), TerminationAction::Exit(101))]
        );
    }

    #[test]
    fn suppressing_handler_keeps_process_alive() {
        let h = harness();
        h.chain.register(
            Arc::new(
                FnHandler::new("keep", |_| true, |_, _| Ok(HandlerOutcome::Logged))
                    .suppressing(|_| true),
            ),
            0,
        );
        let outcome = h
            .coordinator
            .dispatch_blocking(event("fatal"), FaultMode::Fatal)
            .unwrap();
        assert_eq!(outcome.final_state, DispatchState::Resumed);
        assert_eq!(outcome.handler, "keep");
        assert!(h.terminator.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn jobs_run_in_fifo_order_on_worker_thread() {
        let h = harness();
        let (tx, rx) = channel::unbounded();
        for i in 0..5 {
            let tx = tx.clone();
            h.coordinator
                .schedule(format!("job-{i}"), move || {
                    let name = std::thread::current().name().map(String::from);
                    tx.send((i, name, on_worker_thread())).unwrap();
                })
                .unwrap();
        }
        drop(tx);
        let seen: Vec<_> = rx.iter().collect();
        assert_eq!(seen.len(), 5);
        for (expected, (i, name, in_worker)) in seen.into_iter().enumerate() {
            assert_eq!(i, expected);
            assert_eq!(name.as_deref(), Some(WORKER_THREAD_NAME));
            assert!(in_worker);
        }
        assert!(!on_worker_thread());
    }

    #[test]
    fn dispatch_from_worker_is_rejected() {
        let h = harness();
        let (tx, rx) = channel::bounded(1);
        let coordinator = Arc::clone(&h.coordinator);
        h.coordinator
            .schedule("reentrant", move || {
                let result = coordinator.dispatch_blocking(event("nested"), FaultMode::Fatal);
                tx.send(result.is_err()).unwrap();
            })
            .unwrap();
        assert!(rx.recv().unwrap());
        assert!(h.terminator.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn worker_panic_escalates_fatal_fault_to_abort() {
        let h = harness_with(RecordingTerminator {
            panic_on_exit: true,
            ..Default::default()
        });
        let err = h
            .coordinator
            .dispatch_blocking(event("fatal"), FaultMode::Fatal)
            .unwrap_err();
        assert!(matches!(err, Error::WorkerUnavailable(_)));
        let calls = h.terminator.calls.lock().unwrap().clone();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1], (Duration::ZERO, TerminationAction::Abort));

        // The worker survives and keeps serving.
        let outcome = h
            .coordinator
            .dispatch_blocking(event("later"), FaultMode::NonFatal)
            .unwrap();
        assert_eq!(outcome.final_state, DispatchState::Resumed);
    }

    #[test]
    fn shutdown_drains_queue_then_rejects() {
        let h = harness();
        let (tx, rx) = channel::unbounded();
        for i in 0..3 {
            let tx = tx.clone();
            h.coordinator
                .schedule("drain", move || {
                    std::thread::sleep(Duration::from_millis(5));
                    tx.send(i).unwrap();
                })
                .unwrap();
        }
        h.coordinator.shutdown();
        assert_eq!(rx.try_iter().count(), 3);
        assert!(!h.coordinator.is_running());

        let err = h.coordinator.notify(event("late"), FaultMode::NonFatal).unwrap_err();
        assert!(matches!(err, Error::WorkerUnavailable(_)));
    }

    #[test]
    fn fatal_after_shutdown_escalates() {
        let h = harness();
        h.coordinator.shutdown();
        assert!(h.coordinator.dispatch_blocking(event("late"), FaultMode::Fatal).is_err());
        assert_eq!(
            *h.terminator.calls.lock().unwrap(),
            vec![(Duration::ZERO, TerminationAction::Abort)]
        );
    }

    #[test]
    fn policy_from_config_caps_grace() {
        let mut config = DispatchConfig::default();
        config.grace_period_ms = 60_000;
        config.termination = TerminationMode::Abort;
        let policy = TerminationPolicy::from_config(&config);
        assert_eq!(policy.grace_period, Duration::from_millis(MAX_GRACE_PERIOD_MS));
        assert_eq!(policy.action, TerminationAction::Abort);
        assert_eq!(
            TerminationPolicy::default().action,
            TerminationAction::Exit(101)
        );
    }

    #[test]
    fn dispatch_state_roundtrips_through_u8() {
        for state in [
            DispatchState::Idle,
            DispatchState::Dispatching,
            DispatchState::Deciding,
            DispatchState::Terminating,
            DispatchState::Resumed,
        ] {
            assert_eq!(DispatchState::from_u8(state.to_u8()), state);
        }
    }
}
