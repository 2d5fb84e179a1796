//! Callcache CLI - replay sampled call counts into a cache and inspect it

use std::io::BufRead;
use std::path::{Path, PathBuf};

use callcache::config::{self, CallcacheConfig};
use callcache::exports::StaticExports;
use callcache::storage::SqliteStore;
use callcache::ui::{self, FunctionLine, Icons};
use callcache::{FunctionRecord, LogEntry, ModuleInfo, Session, Snapshot};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "callcache")]
#[command(version = "0.0.1")]
#[command(about = "Write-behind cache for sampled call-count telemetry")]
#[command(long_about = r#"
Callcache keeps per-module function call counts sorted hottest first and
writes them back to SQLite in small time-boxed batches.

Example usage:
  callcache ingest --modules modules.json --snapshots samples.jsonl
  callcache top --limit 20
  callcache stats
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay module and snapshot files into a database
    Ingest {
        /// Path to the database file
        #[arg(short, long, default_value = "callcache.db")]
        database: PathBuf,

        /// JSON array of loaded modules
        #[arg(short, long)]
        modules: PathBuf,

        /// One snapshot or log entry per line
        #[arg(short, long)]
        snapshots: PathBuf,

        /// JSON map of module name to exported functions
        #[arg(short, long)]
        exports: Option<PathBuf>,

        /// Functions shown per module afterwards
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show the hottest modules and functions
    Top {
        /// Path to the database file
        #[arg(short, long, default_value = "callcache.db")]
        database: PathBuf,

        /// Functions shown per module
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show row counts and total calls
    Stats {
        /// Path to the database file
        #[arg(short, long, default_value = "callcache.db")]
        database: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Write a default callcache.toml
    Init {
        /// Overwrite an existing config
        #[arg(short, long)]
        force: bool,
    },
}

/// One line of an ingest stream
#[derive(Deserialize)]
#[serde(untagged)]
enum IngestLine {
    Snapshot(Snapshot),
    Log(LogEntry),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Ingest {
            database,
            modules,
            snapshots,
            exports,
            limit,
        } => {
            let config = config::load_config(cli.config.as_deref())?.unwrap_or_default();
            ingest(config, &database, &modules, &snapshots, exports.as_deref())?;
            print_top(&SqliteStore::open(&database)?, limit)?;
        }

        Commands::Top { database, limit } => {
            let store = SqliteStore::open(&database)?;
            print_top(&store, limit)?;
        }

        Commands::Stats { database, format } => {
            let store = SqliteStore::open(&database)?;
            let stats = store.stats()?;

            if format == "json" {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                ui::section(Icons::STATS, &format!("Callcache Statistics ({})", database.display()));
                println!("{}", ui::stats_table(&stats));
            }
        }

        Commands::Init { force } => {
            let path = cli.config.unwrap_or_else(config::default_config_path);
            config::write_config(&path, &CallcacheConfig::default(), force)?;
            ui::success(&format!("Wrote {}", path.display()));
        }
    }

    Ok(())
}

fn ingest(
    config: CallcacheConfig,
    database: &Path,
    modules: &Path,
    snapshots: &Path,
    exports: Option<&Path>,
) -> anyhow::Result<()> {
    config::ensure_db_dir(database)?;

    let mut session = Session::new(config);
    session.open_path(database)?;
    ui::header(&format!("Ingesting into {}", database.display()));

    if let Some(path) = exports {
        let table: StaticExports = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        session.set_metadata_provider(Some(Box::new(table)));
        ui::info("Exports", &path.display().to_string());
    }
    session.add_log_handler(Box::new(|function: Option<&FunctionRecord>, message: &str| {
        ui::log_line(function.map(|f| f.name.as_str()), message);
    }));

    let infos: Vec<ModuleInfo> = serde_json::from_str(&std::fs::read_to_string(modules)?)?;
    session.update_modules(&infos)?;
    ui::info("Modules", &infos.len().to_string());

    let reader = std::io::BufReader::new(std::fs::File::open(snapshots)?);
    let timer = crossbeam::channel::tick(session.tick_interval());
    let mut applied = 0;
    let mut logged = 0;
    for (number, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<IngestLine>(&line) {
            Ok(IngestLine::Snapshot(snapshot)) => {
                session.update(&snapshot)?;
                applied += 1;
            }
            Ok(IngestLine::Log(entry)) => {
                session.log(&entry);
                logged += 1;
            }
            Err(e) => {
                tracing::warn!("Skipping line {} of {}: {}", number + 1, snapshots.display(), e);
                continue;
            }
        }
        // Tick if the timer came due while reading
        if timer.try_recv().is_ok() {
            session.tick()?;
        }
    }

    let ticks = session.run_until_idle()?;
    tracing::debug!("Drained pending flushes in {} ticks", ticks);
    session.close();

    ui::summary_row("Snapshots:", &applied.to_string());
    ui::summary_row("Log entries:", &logged.to_string());
    ui::success("Ingest complete");
    Ok(())
}

fn print_top(store: &SqliteStore, limit: usize) -> anyhow::Result<()> {
    let modules = store.active_modules()?;
    if modules.is_empty() {
        ui::warn("No calls recorded yet");
        return Ok(());
    }

    ui::section(Icons::PACKAGE, "Modules");
    println!("{}", ui::module_table(&modules));

    for module in &modules {
        let functions: Vec<FunctionLine> = store
            .functions_in_module(module.id)?
            .into_iter()
            .filter(|row| row.calls > 0)
            .take(limit)
            .map(|row| FunctionLine {
                address: module.address_of(row.offset),
                name: row.name,
                calls: row.calls,
                exported: row.exported,
            })
            .collect();
        if functions.is_empty() {
            continue;
        }

        ui::section(Icons::FIRE, &format!("{} {}", module.name, ui::muted(&format!("({} calls)", module.calls))));
        println!("{}", ui::function_table(&functions));
    }
    Ok(())
}
