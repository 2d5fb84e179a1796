//! # Callcache - write-behind cache for sampled call-count telemetry
//!
//! Callcache sits between a tracing agent that samples call counts and an
//! observer that wants an always-consistent, hottest-first view of them.
//!
//! Callcache provides:
//! - A cooperative I/O scheduler that flushes in small time-boxed slices
//! - A persisted module registry with per-module call totals
//! - Per-module function collections kept sorted by call count
//! - Export-name reconciliation for address-derived function names
//! - SQLite-backed storage behind a single session object

pub mod config;
pub mod observer;
pub mod scheduler;
pub mod module;
pub mod function;
pub mod registry;
pub mod collection;
pub mod exports;
pub mod store;
pub mod session;
pub mod storage;
pub mod ui;

// Re-exports for convenient access
pub use collection::{FieldChange, FunctionCollection, FunctionEvent, FunctionObserver};
pub use exports::{ExportReply, ExportedFunction, MetadataProvider, StaticExports};
pub use function::{FunctionKey, FunctionRecord, Probe, ProbeId};
pub use module::{Module, ModuleId, ModuleInfo};
pub use observer::SubscriptionId;
pub use registry::{ModuleObserver, ModuleRegistry};
pub use scheduler::{Quota, Scheduler, Task};
pub use session::{FlushContext, ProcessDescriptor, Session};
pub use storage::SqliteStore;
pub use store::{FunctionIndex, FunctionStore, LogEntry, LogHandler, SampleEntry, Snapshot, SymbolRef};

/// Result type alias for Callcache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Callcache operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Function name already in use: {0}")]
    NameConflict(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Unknown function at offset {offset:#x} in module {module_id}")]
    UnknownFunction { module_id: ModuleId, offset: u64 },

    #[error("Unknown module: {0}")]
    UnknownModule(String),

    #[error("No storage session is open")]
    NotOpen,

    #[error("Session faulted on a background storage error; close and reopen it")]
    Faulted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
