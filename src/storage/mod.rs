//! Storage Layer - SQLite-backed persistence
//!
//! System of record is SQLite with tables:
//! - modules(id, name, path, base, main, calls)
//! - functions(id, name, module, offset, exported, calls, probe_script)

pub mod schema;
pub mod sqlite;

pub use sqlite::{DbStats, FunctionRow, SqliteStore, StoreTransaction};
