//! Module types - loaded libraries and executables being traced

use serde::{Deserialize, Serialize};

/// Surrogate key of a row in the `modules` table
pub type ModuleId = i64;

/// A module as the tracing agent reports it on load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    pub path: String,
    pub base: u64,
    #[serde(default)]
    pub main: bool,
}

impl ModuleInfo {
    pub fn new(name: impl Into<String>, path: impl Into<String>, base: u64, main: bool) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            base,
            main,
        }
    }
}

/// A persisted module with its aggregated call count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    pub id: ModuleId,
    pub name: String,
    pub path: String,
    pub base: u64,
    pub is_main: bool,
    pub calls: u64,
}

impl Module {
    /// Absolute address of `offset` at the module's current load location
    pub fn address_of(&self, offset: u64) -> u64 {
        self.base.wrapping_add(offset)
    }
}

impl std::fmt::Display for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} @ {:#x}", self.name, self.base)
    }
}
