use owo_colors::OwoColorize;
use tabled::{Table, Tabled, settings::Style};

use crate::module::Module;
use crate::storage::DbStats;
use crate::ui::{Icons, theme};

#[derive(Tabled)]
pub struct TableRow {
    #[tabled(rename = "Metric")]
    pub metric: String,
    #[tabled(rename = "Value")]
    pub value: String,
}

pub struct TableBuilder {
    rows: Vec<TableRow>,
}

impl Default for TableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TableBuilder {
    pub fn new() -> Self {
        Self { rows: Vec::new() }
    }

    pub fn add_row(&mut self, label: &str, value: &str) {
        self.rows.push(TableRow {
            metric: label.to_string(),
            value: value.to_string(),
        });
    }

    pub fn build(&self) -> String {
        if self.rows.is_empty() {
            return String::new();
        }

        Table::new(&self.rows).with(Style::rounded()).to_string()
    }
}

pub fn stats_table(stats: &DbStats) -> String {
    let mut builder = TableBuilder::new();
    builder.add_row("Modules", &stats.modules.to_string());
    builder.add_row("Functions", &stats.functions.to_string());
    builder.add_row("Exported", &stats.exported.to_string());
    builder.add_row("Calls", &stats.calls.to_string());
    builder.build()
}

#[derive(Tabled)]
struct ModuleLine {
    #[tabled(rename = "#")]
    rank: usize,
    #[tabled(rename = "Module")]
    name: String,
    #[tabled(rename = "Base")]
    base: String,
    #[tabled(rename = "Calls")]
    calls: String,
}

/// Active modules, hottest first
pub fn module_table(modules: &[Module]) -> String {
    let rows: Vec<ModuleLine> = modules
        .iter()
        .enumerate()
        .map(|(i, module)| ModuleLine {
            rank: i + 1,
            name: if module.is_main {
                format!("{} (main)", module.name)
            } else {
                module.name.clone()
            },
            base: format!("{:#x}", module.base),
            calls: module.calls.style(theme().calls.clone()).to_string(),
        })
        .collect();
    Table::new(&rows).with(Style::rounded()).to_string()
}

/// One row of a function listing
pub struct FunctionLine {
    pub name: String,
    pub address: u64,
    pub calls: u64,
    pub exported: bool,
}

#[derive(Tabled)]
struct FunctionCells {
    #[tabled(rename = "#")]
    rank: usize,
    #[tabled(rename = "Function")]
    name: String,
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "Calls")]
    calls: String,
}

pub fn function_table(functions: &[FunctionLine]) -> String {
    let rows: Vec<FunctionCells> = functions
        .iter()
        .enumerate()
        .map(|(i, function)| FunctionCells {
            rank: i + 1,
            name: if function.exported {
                format!("{} {}", function.name.style(theme().exported.clone()), Icons::EXPORT)
            } else {
                function.name.clone()
            },
            address: format!("{:#x}", function.address),
            calls: function.calls.style(theme().calls.clone()).to_string(),
        })
        .collect();
    Table::new(&rows).with(Style::rounded()).to_string()
}
