//! Database schema definitions

/// SQL to create the modules table
pub const CREATE_MODULES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS modules (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    path TEXT NOT NULL UNIQUE,
    base INTEGER NOT NULL,
    main INTEGER NOT NULL,
    calls INTEGER NOT NULL DEFAULT 0
)
"#;

/// SQL to create the functions table
///
/// Addresses are never stored: they are always `modules.base + offset`.
pub const CREATE_FUNCTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS functions (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    module INTEGER,
    offset INTEGER NOT NULL,
    exported INTEGER NOT NULL DEFAULT 0,
    calls INTEGER NOT NULL DEFAULT 0,
    probe_script TEXT,
    FOREIGN KEY(module) REFERENCES modules(id)
)
"#;

/// SQL to create indexes
pub const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS modules_index ON modules(name, path, calls)",
    "CREATE INDEX IF NOT EXISTS functions_index ON functions(module, calls, exported)",
];

/// All schema creation statements
pub fn all_schema_statements() -> Vec<&'static str> {
    let mut stmts = vec![CREATE_MODULES_TABLE, CREATE_FUNCTIONS_TABLE];
    stmts.extend(CREATE_INDEXES.iter().copied());
    stmts
}
