//! The crash agent: wires configuration, the handler chain and the dispatch
//! worker together, and owns the process-wide panic hook.
//!
//! ```no_run
//! use std::sync::Arc;
//! use crashkeep_core::agent::{self, CrashAgent};
//! use crashkeep_core::config::Config;
//!
//! # fn main() -> crashkeep_core::Result<()> {
//! let agent = Arc::new(CrashAgent::builder().config(Config::load()?).build()?);
//! agent.initialize()?;
//! agent::install(agent)?;
//! # Ok(())
//! # }
//! ```

use std::panic::PanicHookInfo;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::coordinator::{
    CoordinatorParts, DispatchCoordinator, DispatchOutcome, DispatchState, FaultMode,
    ProcessTerminator, TerminationPolicy, Terminator, on_worker_thread,
};
use crate::error::{Error, Result};
use crate::fault::{FaultEvent, FaultObject};
use crate::handler::{FaultHandler, HandlerChain, HeapSnapshotter};
use crate::metadata::{MetadataSource, SystemMetadata};
use crate::record::RecordBuilder;
use crate::retention;
use crate::store::LogDirectory;
use crate::upload::{UploadScheduler, UploadTransport};
use crate::writer::{DurableWriter, RecordSink};

/// Name of the periodic maintenance thread.
pub const TICKER_THREAD_NAME: &str = "crashkeep-maintenance";

const TICK_SLICE: Duration = Duration::from_millis(50);

/// Builds a [`CrashAgent`]. Every collaborator has a production default.
#[derive(Default)]
pub struct CrashAgentBuilder {
    config: Config,
    metadata: Option<Arc<dyn MetadataSource>>,
    transport: Option<Arc<dyn UploadTransport>>,
    terminator: Option<Arc<dyn Terminator>>,
    sink: Option<Arc<dyn RecordSink>>,
    snapshotter: Option<Arc<dyn HeapSnapshotter>>,
    handlers: Vec<(Arc<dyn FaultHandler>, i32)>,
}

impl CrashAgentBuilder {
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn metadata(mut self, source: Arc<dyn MetadataSource>) -> Self {
        self.metadata = Some(source);
        self
    }

    /// Uploads are disabled unless a transport is supplied.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn UploadTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    #[must_use]
    pub fn terminator(mut self, terminator: Arc<dyn Terminator>) -> Self {
        self.terminator = Some(terminator);
        self
    }

    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn RecordSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    #[must_use]
    pub fn snapshotter(mut self, snapshotter: Arc<dyn HeapSnapshotter>) -> Self {
        self.snapshotter = Some(snapshotter);
        self
    }

    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn FaultHandler>, priority: i32) -> Self {
        self.handlers.push((handler, priority));
        self
    }

    /// Validate the configuration and start the dispatch worker.
    pub fn build(self) -> Result<CrashAgent> {
        self.config.validate()?;
        let config = self.config;
        let log_dir = config.log_dir();

        let chain = Arc::new(HandlerChain::with_defaults());
        for (handler, priority) in self.handlers {
            chain.register(handler, priority);
        }

        let metadata = self.metadata.unwrap_or_else(|| {
            Arc::new(SystemMetadata::new(
                config.general.app_name.clone(),
                config.general.app_version.clone(),
                log_dir.clone(),
            ))
        });
        let sink = self.sink.unwrap_or_else(|| {
            Arc::new(DurableWriter::new(
                Arc::new(LogDirectory::new(&log_dir)),
                config.storage.record_extension.clone(),
            ))
        });
        let terminator = self
            .terminator
            .unwrap_or_else(|| Arc::new(ProcessTerminator));

        let coordinator = DispatchCoordinator::spawn(CoordinatorParts {
            chain: Arc::clone(&chain),
            sink,
            builder: RecordBuilder::new(metadata).with_redaction(config.dispatch.redact_secrets),
            snapshotter: self.snapshotter,
            terminator,
            policy: TerminationPolicy::from_config(&config.dispatch),
        })?;

        let maintenance = Maintenance {
            dir: log_dir.clone(),
            retention: config.retention(),
            uploader: self.transport.map(|transport| {
                Arc::new(UploadScheduler::new(
                    transport,
                    config.storage.record_extension.clone(),
                ))
            }),
        };

        tracing::debug!(
            path = %log_dir.display(),
            handlers = ?chain.names(),
            "Crash agent built"
        );
        Ok(CrashAgent {
            config,
            log_dir,
            chain,
            coordinator: Arc::new(coordinator),
            maintenance,
            ticker: Mutex::new(None),
        })
    }
}

/// Upload and retention work queued onto the dispatch worker.
#[derive(Clone)]
struct Maintenance {
    dir: PathBuf,
    retention: Option<Duration>,
    uploader: Option<Arc<UploadScheduler>>,
}

impl Maintenance {
    fn schedule(&self, coordinator: &DispatchCoordinator, upload: bool) -> Result<()> {
        if upload {
            if let Some(uploader) = &self.uploader {
                let uploader = Arc::clone(uploader);
                let dir = self.dir.clone();
                coordinator.schedule("upload", move || {
                    let counts = uploader.upload_pending(&dir).counts();
                    tracing::debug!(
                        dispatched = counts.dispatched,
                        succeeded = counts.succeeded,
                        failed = counts.failed,
                        "Upload pass queued all records"
                    );
                })?;
            }
        }
        if let Some(max_age) = self.retention {
            let dir = self.dir.clone();
            coordinator.schedule("retention", move || {
                let report = retention::sweep(&dir, max_age);
                tracing::debug!(
                    scanned = report.scanned,
                    deleted = report.deleted_count(),
                    failed = report.failed.len(),
                    "Retention pass finished"
                );
            })?;
        }
        Ok(())
    }
}

/// Background thread that queues maintenance on a fixed interval.
struct MaintenanceTicker {
    shutdown: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl MaintenanceTicker {
    fn spawn(
        interval: Duration,
        maintenance: Maintenance,
        coordinator: Weak<DispatchCoordinator>,
    ) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);
        let handle = std::thread::Builder::new()
            .name(TICKER_THREAD_NAME.to_string())
            .spawn(move || {
                let mut next = Instant::now() + interval;
                loop {
                    if flag.load(Ordering::SeqCst) {
                        tracing::info!("Maintenance ticker: shutdown signal received");
                        break;
                    }
                    let now = Instant::now();
                    if now < next {
                        std::thread::sleep(TICK_SLICE.min(next - now));
                        continue;
                    }
                    next = now + interval;
                    let Some(coordinator) = coordinator.upgrade() else {
                        break;
                    };
                    if let Err(e) = maintenance.schedule(&coordinator, true) {
                        tracing::warn!(error = %e, "Maintenance ticker stopping");
                        break;
                    }
                }
            })?;
        Ok(Self { shutdown, handle })
    }

    fn signal_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn join(self) {
        self.signal_shutdown();
        if self.handle.join().is_err() {
            tracing::warn!("Maintenance ticker exited with a panic");
        }
    }
}

/// One crash agent. Independent instances can coexist; at most one is
/// installed as the process-wide panic hook at a time.
pub struct CrashAgent {
    config: Config,
    log_dir: PathBuf,
    chain: Arc<HandlerChain>,
    coordinator: Arc<DispatchCoordinator>,
    maintenance: Maintenance,
    ticker: Mutex<Option<MaintenanceTicker>>,
}

impl std::fmt::Debug for CrashAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrashAgent")
            .field("log_dir", &self.log_dir)
            .field("handlers", &self.chain.names())
            .field("state", &self.coordinator.state())
            .finish_non_exhaustive()
    }
}

impl CrashAgent {
    #[must_use]
    pub fn builder() -> CrashAgentBuilder {
        CrashAgentBuilder::default()
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    #[must_use]
    pub fn state(&self) -> DispatchState {
        self.coordinator.state()
    }

    #[must_use]
    pub fn chain(&self) -> &HandlerChain {
        &self.chain
    }

    pub fn register_handler(&self, handler: Arc<dyn FaultHandler>, priority: i32) {
        self.chain.register(handler, priority);
    }

    pub fn remove_handler(&self, name: &str) -> bool {
        self.chain.remove(name)
    }

    /// Queue the startup upload and retention passes and start the periodic
    /// ticker when configured. Returns without waiting for them.
    pub fn initialize(&self) -> Result<()> {
        self.maintenance
            .schedule(&self.coordinator, self.config.upload.on_startup)?;

        if let Some(interval) = self.config.maintenance_interval() {
            let mut ticker = self.ticker.lock().unwrap_or_else(PoisonError::into_inner);
            if ticker.is_none() {
                *ticker = Some(MaintenanceTicker::spawn(
                    interval,
                    self.maintenance.clone(),
                    Arc::downgrade(&self.coordinator),
                )?);
                tracing::info!(interval_secs = interval.as_secs(), "Maintenance ticker started");
            }
        }
        Ok(())
    }

    /// Queue an arbitrary task behind pending faults on the dispatch worker.
    pub fn schedule<F>(&self, name: impl Into<String>, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.coordinator.schedule(name, task)
    }

    /// Record a non-fatal fault and wait until it is handled.
    pub fn report(&self, fault: FaultObject) -> Result<DispatchOutcome> {
        self.dispatch(FaultEvent::new(fault), FaultMode::NonFatal)
    }

    /// Record a recoverable error with its cause chain.
    pub fn report_error(&self, err: &(dyn std::error::Error + 'static)) -> Result<DispatchOutcome> {
        let event = FaultEvent::from_error(err, self.config.dispatch.capture_backtrace);
        self.dispatch(event, FaultMode::NonFatal)
    }

    /// Dispatch `event` and wait for the outcome.
    pub fn dispatch(&self, event: FaultEvent, mode: FaultMode) -> Result<DispatchOutcome> {
        self.coordinator.dispatch_blocking(Arc::new(event), mode)
    }

    /// Handle a panic as a fatal fault. Called from the installed hook.
    pub fn handle_panic(&self, info: &PanicHookInfo<'_>) -> Option<DispatchOutcome> {
        if on_worker_thread() {
            return None;
        }
        let event = FaultEvent::from_panic(info, self.config.dispatch.capture_backtrace);
        match self.dispatch(event, FaultMode::Fatal) {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::error!(error = %e, "Panic could not be dispatched");
                None
            }
        }
    }

    /// Stop the ticker, drain queued work and join the worker.
    pub fn shutdown(&self) {
        let ticker = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(ticker) = ticker {
            ticker.join();
        }
        self.coordinator.shutdown();
    }
}

impl Drop for CrashAgent {
    fn drop(&mut self) {
        self.shutdown();
    }
}

type PreviousHook = Arc<dyn Fn(&PanicHookInfo<'_>) + Send + Sync + 'static>;

struct Installed {
    agent: Arc<CrashAgent>,
    previous: PreviousHook,
}

static INSTALLED: Mutex<Option<Installed>> = Mutex::new(None);

/// Make `agent` the process-wide panic receiver.
///
/// The hook that was in place runs after the agent has handled the panic,
/// which only happens when termination was suppressed or did not end the
/// process. Panics on the dispatch worker go straight to that hook.
pub fn install(agent: Arc<CrashAgent>) -> Result<()> {
    let mut slot = INSTALLED.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.is_some() {
        return Err(Error::AlreadyInstalled);
    }
    let previous: PreviousHook = Arc::from(std::panic::take_hook());

    let hook_agent = Arc::clone(&agent);
    let hook_previous = Arc::clone(&previous);
    std::panic::set_hook(Box::new(move |info| {
        if !on_worker_thread() {
            let _ = hook_agent.handle_panic(info);
        }
        hook_previous(info);
    }));

    tracing::info!(path = %agent.log_dir().display(), "Crash agent installed");
    *slot = Some(Installed { agent, previous });
    Ok(())
}

/// Restore the hook that was active before [`install`]. Returns the agent
/// that was installed, if any.
pub fn uninstall() -> Option<Arc<CrashAgent>> {
    let mut slot = INSTALLED.lock().unwrap_or_else(PoisonError::into_inner);
    let Installed { agent, previous } = slot.take()?;
    std::panic::set_hook(Box::new(move |info| previous(info)));
    tracing::info!("Crash agent uninstalled");
    Some(agent)
}

/// The installed agent, if any.
#[must_use]
pub fn installed() -> Option<Arc<CrashAgent>> {
    INSTALLED
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .as_ref()
        .map(|installed| Arc::clone(&installed.agent))
}
