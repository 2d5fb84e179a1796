//! Function records and address-derived naming

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::module::{Module, ModuleId};
use crate::storage::FunctionRow;

/// Transient handle of an attached probe. Never persisted.
pub type ProbeId = u32;

/// Durable identity of a function: its module and offset within it.
///
/// Names can be rewritten at any time, so every mutation re-resolves the
/// record through this key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FunctionKey {
    pub module_id: ModuleId,
    pub offset: u64,
}

impl FunctionKey {
    pub fn new(module_id: ModuleId, offset: u64) -> Self {
        Self { module_id, offset }
    }
}

/// A user-attachable probe: the script is persisted, the id is not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    #[serde(skip)]
    pub id: Option<ProbeId>,
    pub script: String,
}

/// A function observed in a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRecord {
    /// Row id, absent until the record is first persisted
    pub id: Option<i64>,
    pub name: String,
    pub address: u64,
    pub module_id: ModuleId,
    pub offset: u64,
    pub exported: bool,
    pub calls: u64,
    pub probe: Probe,
}

impl FunctionRecord {
    /// Create a record that has never been persisted
    pub fn new(module: &Module, name: String, offset: u64, calls: u64, default_script: &str) -> Self {
        Self {
            id: None,
            name,
            address: module.address_of(offset),
            module_id: module.id,
            offset,
            exported: false,
            calls,
            probe: Probe {
                id: None,
                script: default_script.to_string(),
            },
        }
    }

    /// Rebuild a record from storage, recomputing its address from the module base
    pub fn from_row(row: FunctionRow, module: &Module, default_script: &str) -> Self {
        Self {
            id: Some(row.id),
            address: module.address_of(row.offset),
            name: row.name,
            module_id: module.id,
            offset: row.offset,
            exported: row.exported,
            calls: row.calls,
            probe: Probe {
                id: None,
                script: row
                    .probe_script
                    .unwrap_or_else(|| default_script.to_string()),
            },
        }
    }

    pub fn key(&self) -> FunctionKey {
        FunctionKey::new(self.module_id, self.offset)
    }

    /// Whether the record belongs in observer-visible lists
    pub fn is_visible(&self) -> bool {
        self.calls > 0
    }
}

static LIB_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^lib").expect("valid regex"));
static SEPARATORS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[-_]").expect("valid regex"));
static EXTENSION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\.\w+$").expect("valid regex"));

/// Name prefix for functions of `module`.
///
/// The main executable uses `sub`; libraries use their file name without a
/// leading `lib`, separators, or the final extension, lower-cased.
pub fn function_prefix(module: &Module) -> String {
    if module.is_main {
        return "sub".to_string();
    }

    // Applied in order: removing separators can expose a new extension
    let name = LIB_PREFIX.replace(&module.name, "");
    let name = SEPARATORS.replace_all(&name, "");
    EXTENSION.replace(&name, "").to_lowercase()
}

/// Name given to a function known only by its offset
pub fn synthesized_name(module: &Module, offset: u64) -> String {
    format!("{}_{:x}", function_prefix(module), offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn module(name: &str, is_main: bool) -> Module {
        Module {
            id: 1,
            name: name.to_string(),
            path: format!("/usr/lib/{}", name),
            base: 0x1000,
            is_main,
            calls: 0,
        }
    }

    #[test]
    fn test_prefix_for_main_module() {
        assert_eq!(function_prefix(&module("target", true)), "sub");
        assert_eq!(synthesized_name(&module("target", true), 0xbeef), "sub_beef");
    }

    #[test]
    fn test_prefix_sanitizes_library_names() {
        assert_eq!(function_prefix(&module("libfoo.so", false)), "foo");
        assert_eq!(function_prefix(&module("libGLX_mesa-x.so", false)), "glxmesax");
        assert_eq!(function_prefix(&module("KERNEL32.DLL", false)), "kernel32");
        assert_eq!(function_prefix(&module("libc.so.6", false)), "c.so");
        assert_eq!(function_prefix(&module("foo.s-o", false)), "foo");
        assert_eq!(function_prefix(&module("my_lib.so", false)), "mylib");
    }

    #[test]
    fn test_record_address_tracks_module_base() {
        let m = module("libfoo.so", false);
        let record = FunctionRecord::new(&m, synthesized_name(&m, 0x10), 0x10, 5, "log();");
        assert_eq!(record.name, "foo_10");
        assert_eq!(record.address, 0x1010);
        assert_eq!(record.probe.id, None);
        assert!(record.is_visible());
    }
}
