//! crashkeep-core: in-process crash capture and durable crash records
//!
//! Intercepts panics (and explicitly reported faults), renders a diagnostic
//! record, writes it to stable storage before the process ends, and later
//! hands stored records to an upload transport.
//!
//! # Architecture
//!
//! ```text
//! panic hook ─▶ DispatchCoordinator ─▶ HandlerChain ─▶ RecordBuilder ─▶ DurableWriter
//!                 (one worker thread)        │
//!                        │                   └─▶ OutOfMemoryHandler ─▶ HeapSnapshotter
//!                        └─▶ UploadScheduler / retention sweep (same worker)
//! ```
//!
//! # Modules
//!
//! - `agent`: builder, panic hook install/uninstall, startup and periodic maintenance
//! - `coordinator`: dispatch state machine and the single worker thread
//! - `handler`: handler chain, out-of-memory and fallback handlers
//! - `fault`: fault events from panics and errors
//! - `metadata`: environment sections for the record
//! - `record`: record ids and the text renderer
//! - `writer`: durable record writes
//! - `store`: log directory and record listing
//! - `retention`: age-based cleanup
//! - `upload`: upload transport seam and scheduler
//! - `redact`: secret scrubbing
//! - `config`, `logging`, `error`
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod agent;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fault;
pub mod handler;
pub mod logging;
pub mod metadata;
pub mod record;
pub mod redact;
pub mod retention;
pub mod store;
pub mod upload;
pub mod writer;

pub use agent::CrashAgent;
pub use error::{Error, Result};

/// Version of the crashkeep-core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
