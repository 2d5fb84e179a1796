//! Terminal output for the `callcache` binary

pub mod icons;
pub mod output;
pub mod table;
pub mod theme;

pub use icons::Icons;
pub use output::{header, info, log_line, muted, section, success, summary_row, warn};
pub use table::{function_table, module_table, stats_table, FunctionLine, TableBuilder};
pub use theme::{theme, Theme};
