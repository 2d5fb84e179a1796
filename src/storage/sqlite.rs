//! SQLite storage implementation

use std::collections::BTreeSet;
use std::path::Path;
use rusqlite::{Connection, OptionalExtension, params};
use crate::{Error, Result};
use crate::function::FunctionRecord;
use crate::module::{Module, ModuleId, ModuleInfo};
use super::schema;

/// SQLite-backed storage for modules and functions
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open a database file (creates if doesn't exist)
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.initialize_schema()?;
        Ok(store)
    }

    /// Initialize the database schema
    fn initialize_schema(&self) -> Result<()> {
        for stmt in schema::all_schema_statements() {
            self.conn.execute(stmt, [])?;
        }
        Ok(())
    }

    /// Begin a transaction. Dropping it without `commit` rolls back.
    pub fn transaction(&mut self) -> Result<StoreTransaction<'_>> {
        Ok(StoreTransaction {
            tx: self.conn.transaction()?,
        })
    }

    // ========== Module Operations ==========

    /// Modules with at least one call, hottest first
    pub fn active_modules(&self) -> Result<Vec<Module>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, path, base, main, calls FROM modules WHERE calls > 0 ORDER BY calls DESC, id ASC"
        )?;

        let modules = stmt
            .query_map([], row_to_module)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(modules)
    }

    /// Get a module by id
    pub fn get_module(&self, id: ModuleId) -> Result<Option<Module>> {
        self.conn
            .query_row(
                "SELECT id, name, path, base, main, calls FROM modules WHERE id = ?1",
                [id],
                row_to_module,
            )
            .optional()
            .map_err(Into::into)
    }

    // ========== Function Operations ==========

    /// All functions of a module, hottest first
    pub fn functions_in_module(&self, module_id: ModuleId) -> Result<Vec<FunctionRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, offset, exported, calls, probe_script FROM functions WHERE module = ?1 ORDER BY calls DESC, id ASC"
        )?;

        let rows = stmt
            .query_map([module_id], row_to_function)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows)
    }

    /// Whether an export scan has already been persisted for a module
    pub fn has_exported_function(&self, module_id: ModuleId) -> Result<bool> {
        let found: Option<i64> = self.conn
            .query_row(
                "SELECT 1 FROM functions WHERE module = ?1 AND exported = 1 LIMIT 1",
                [module_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Count all modules
    pub fn count_modules(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row("SELECT COUNT(*) FROM modules", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Count all functions
    pub fn count_functions(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row("SELECT COUNT(*) FROM functions", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Count exported functions
    pub fn count_exported(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM functions WHERE exported = 1",
            [],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Sum of calls across all modules
    pub fn total_calls(&self) -> Result<u64> {
        let total: i64 = self.conn.query_row("SELECT COALESCE(SUM(calls), 0) FROM modules", [], |row| row.get(0))?;
        Ok(from_sql(total))
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats> {
        Ok(DbStats {
            modules: self.count_modules()?,
            functions: self.count_functions()?,
            exported: self.count_exported()?,
            calls: self.total_calls()?,
        })
    }
}

/// An open write transaction over the store
pub struct StoreTransaction<'a> {
    tx: rusqlite::Transaction<'a>,
}

impl StoreTransaction<'_> {
    /// Get a module by its unique name
    pub fn module_by_name(&self, name: &str) -> Result<Option<Module>> {
        self.tx
            .query_row(
                "SELECT id, name, path, base, main, calls FROM modules WHERE name = ?1",
                [name],
                row_to_module,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Insert a module, or move an existing one to its new path and base
    pub fn upsert_module(&self, info: &ModuleInfo) -> Result<()> {
        let updated = self.tx.execute(
            "UPDATE modules SET path = ?1, base = ?2 WHERE name = ?3",
            params![info.path, to_sql(info.base), info.name],
        )?;
        if updated == 0 {
            self.tx.execute(
                "INSERT INTO modules (name, path, base, main) VALUES (?1, ?2, ?3, ?4)",
                params![info.name, info.path, to_sql(info.base), info.main],
            )?;
        }
        Ok(())
    }

    /// Add `calls` to a module's running total
    pub fn increment_module_calls(&self, id: ModuleId, calls: u64) -> Result<()> {
        self.tx.execute(
            "UPDATE modules SET calls = calls + ?1 WHERE id = ?2",
            params![to_sql(calls), id],
        )?;
        Ok(())
    }

    /// Insert a never-persisted function and return its new row id.
    ///
    /// `loaded` lists the modules whose functions are all held in memory.
    pub fn insert_function(&self, record: &FunctionRecord, loaded: &BTreeSet<ModuleId>) -> Result<i64> {
        self.release_name(&record.name, None, loaded)?;
        self.tx.execute(
            r#"
            INSERT INTO functions (name, module, offset, exported, calls, probe_script)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.name,
                record.module_id,
                to_sql(record.offset),
                record.exported,
                to_sql(record.calls),
                record.probe.script,
            ],
        )?;
        Ok(self.tx.last_insert_rowid())
    }

    /// Overwrite every mutable column of a persisted function
    pub fn update_function(
        &self,
        id: i64,
        record: &FunctionRecord,
        loaded: &BTreeSet<ModuleId>,
    ) -> Result<()> {
        self.release_name(&record.name, Some(id), loaded)?;
        self.tx.execute(
            "UPDATE functions SET name = ?1, exported = ?2, calls = ?3, probe_script = ?4 WHERE id = ?5",
            params![
                record.name,
                record.exported,
                to_sql(record.calls),
                record.probe.script,
                id,
            ],
        )?;
        Ok(())
    }

    /// Move a stale row off `name` so a renamed record can take it.
    ///
    /// Only a row of a loaded module can be stale: its record is then dirty
    /// under a different name and restores the row when it flushes. A row of
    /// any other module still owns its name.
    fn release_name(&self, name: &str, except: Option<i64>, loaded: &BTreeSet<ModuleId>) -> Result<()> {
        let holder: Option<(i64, Option<ModuleId>)> = self
            .tx
            .query_row(
                "SELECT id, module FROM functions WHERE name = ?1 AND (?2 IS NULL OR id != ?2)",
                params![name, except],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((id, module)) = holder else {
            return Ok(());
        };
        if !module.is_some_and(|module| loaded.contains(&module)) {
            return Err(Error::NameConflict(name.to_string()));
        }

        self.tx.execute(
            "UPDATE functions SET name = printf('~displaced-%d', id) WHERE id = ?1",
            [id],
        )?;
        Ok(())
    }

    /// Commit the transaction
    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }
}

/// A function row as stored (no address, no probe id)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRow {
    pub id: i64,
    pub name: String,
    pub offset: u64,
    pub exported: bool,
    pub calls: u64,
    pub probe_script: Option<String>,
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub modules: usize,
    pub functions: usize,
    pub exported: usize,
    pub calls: u64,
}

impl std::fmt::Display for DbStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Database Statistics:")?;
        writeln!(f, "  Modules: {}", self.modules)?;
        writeln!(f, "  Functions: {} (exported: {})", self.functions, self.exported)?;
        writeln!(f, "  Calls: {}", self.calls)
    }
}

// SQLite integers are signed; addresses and counters round-trip bit-for-bit.
fn to_sql(value: u64) -> i64 {
    value as i64
}

fn from_sql(value: i64) -> u64 {
    value as u64
}

fn row_to_module(row: &rusqlite::Row) -> rusqlite::Result<Module> {
    Ok(Module {
        id: row.get(0)?,
        name: row.get(1)?,
        path: row.get(2)?,
        base: from_sql(row.get(3)?),
        is_main: row.get(4)?,
        calls: from_sql(row.get(5)?),
    })
}

fn row_to_function(row: &rusqlite::Row) -> rusqlite::Result<FunctionRow> {
    Ok(FunctionRow {
        id: row.get(0)?,
        name: row.get(1)?,
        offset: from_sql(row.get(2)?),
        exported: row.get(3)?,
        calls: from_sql(row.get(4)?),
        probe_script: row.get(5)?,
    })
}
