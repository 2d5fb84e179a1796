use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Probe script given to functions that have never had one set
pub const DEFAULT_PROBE_SCRIPT: &str = "log(args[0], args[1], args[2], args[3]);";
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 15;
pub const DEFAULT_QUOTA_MS: u64 = 10;
pub const DEFAULT_FLUSH_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallcacheConfig {
    /// Directory holding one database per traced process
    pub data_dir: Option<String>,
    pub tick_interval_ms: u64,
    /// Work budget of one scheduler tick
    pub quota_ms: u64,
    pub flush_batch_size: usize,
    pub default_probe_script: String,
}

impl Default for CallcacheConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            quota_ms: DEFAULT_QUOTA_MS,
            flush_batch_size: DEFAULT_FLUSH_BATCH_SIZE,
            default_probe_script: DEFAULT_PROBE_SCRIPT.to_string(),
        }
    }
}

impl CallcacheConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn quota(&self) -> Duration {
        Duration::from_millis(self.quota_ms)
    }

    /// Database file for a traced process, named after it
    pub fn database_path_for(&self, process_name: &str) -> PathBuf {
        let dir = self
            .data_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);
        let file: String = process_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        dir.join(format!("{}.db", file))
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from("callcache.toml")
}

pub fn default_data_dir() -> PathBuf {
    PathBuf::from(".callcache")
}

pub fn load_config(path: Option<&Path>) -> anyhow::Result<Option<CallcacheConfig>> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    if !path.exists() {
        return Ok(None);
    }

    let contents = std::fs::read_to_string(&path)?;
    let config: CallcacheConfig = toml::from_str(&contents)?;
    Ok(Some(config))
}

pub fn write_config(path: &Path, config: &CallcacheConfig, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("config already exists at {} (use --force to overwrite)", path.display());
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(path, contents)?;
    Ok(())
}

pub fn ensure_db_dir(db_path: &Path) -> std::io::Result<()> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
