//! Session - one open storage session for one traced process
//!
//! The session owns the database connection, the module registry, the
//! function store, the flush scheduler and the export channel. Everything runs
//! on the caller's thread; the host calls [`Session::tick`] every
//! [`Session::tick_interval`] while [`Session::is_idle`] is false, or lets
//! [`Session::run_until_idle`] pace the ticks.

use std::path::Path;
use std::time::Duration;

use crate::collection::{CollectionSettings, FlushTask, FunctionCollection, FunctionObserver};
use crate::config::{self, CallcacheConfig};
use crate::exports::{Exports, MetadataProvider};
use crate::function::{FunctionKey, FunctionRecord, ProbeId};
use crate::module::{Module, ModuleId, ModuleInfo};
use crate::observer::SubscriptionId;
use crate::registry::{ModuleObserver, ModuleRegistry};
use crate::scheduler::{Quota, Scheduler, Task};
use crate::storage::{DbStats, SqliteStore};
use crate::store::{FunctionStore, LogEntry, LogHandler, Snapshot};
use crate::{Error, Result};

/// The traced process a session stores data for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessDescriptor {
    pub name: String,
    pub pid: Option<u32>,
}

impl ProcessDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pid: None,
        }
    }
}

/// Everything a flush task touches while it runs
pub struct FlushContext<'a> {
    pub store: &'a mut SqliteStore,
    pub functions: &'a mut FunctionStore,
    pub exports: &'a mut Exports,
}

impl Task<FlushContext<'_>> for FlushTask {
    fn run(&mut self, ctx: &mut FlushContext<'_>, quota: &Quota) -> Result<bool> {
        ctx.functions
            .flush(self.module_id, ctx.store, quota, ctx.exports)
    }
}

fn writable(store: &mut Option<SqliteStore>, faulted: bool) -> Result<&mut SqliteStore> {
    if faulted {
        return Err(Error::Faulted);
    }
    store.as_mut().ok_or(Error::NotOpen)
}

/// Write-behind call-count cache bound to one database
pub struct Session {
    config: CallcacheConfig,
    store: Option<SqliteStore>,
    scheduler: Scheduler<FlushTask>,
    modules: ModuleRegistry,
    functions: FunctionStore,
    exports: Exports,
    faulted: bool,
}

impl Session {
    pub fn new(config: CallcacheConfig) -> Self {
        let settings = CollectionSettings {
            default_script: config.default_probe_script.clone(),
            batch_size: config.flush_batch_size,
        };
        Self {
            scheduler: Scheduler::new(config.tick_interval(), config.quota()),
            store: None,
            modules: ModuleRegistry::new(),
            functions: FunctionStore::new(settings),
            exports: Exports::new(),
            faulted: false,
            config,
        }
    }

    // ========== Lifecycle ==========

    /// Open (creating if needed) the database of `process` under the data dir
    pub fn open(&mut self, process: &ProcessDescriptor) -> Result<()> {
        let path = self.config.database_path_for(&process.name);
        config::ensure_db_dir(&path)?;
        tracing::info!("Opening cache for {} (pid {:?})", process.name, process.pid);
        self.open_path(&path)
    }

    pub fn open_path(&mut self, path: &Path) -> Result<()> {
        let store = SqliteStore::open(path)?;
        tracing::info!("Opened {}", path.display());
        self.attach(store)
    }

    pub fn open_in_memory(&mut self) -> Result<()> {
        let store = SqliteStore::open_in_memory()?;
        self.attach(store)
    }

    fn attach(&mut self, store: SqliteStore) -> Result<()> {
        if self.store.is_some() {
            self.close();
        }
        self.modules.attach(&store)?;
        self.functions.attach(&store)?;
        self.exports.next_generation();
        self.store = Some(store);
        self.faulted = false;
        Ok(())
    }

    /// Detach storage and drop all in-memory state.
    ///
    /// Pending flushes are abandoned; call [`Session::drain`] first to keep them.
    pub fn close(&mut self) {
        if self.store.take().is_none() {
            return;
        }

        let abandoned = self.scheduler.clear();
        if abandoned > 0 {
            tracing::warn!("Closing with {} pending flushes; unflushed calls are lost", abandoned);
        }
        self.functions.unload();
        self.modules.unload();
        self.exports.next_generation();
        self.faulted = false;
        tracing::info!("Session closed");
    }

    pub fn is_open(&self) -> bool {
        self.store.is_some()
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    pub fn config(&self) -> &CallcacheConfig {
        &self.config
    }

    pub fn set_metadata_provider(&mut self, provider: Option<Box<dyn MetadataProvider>>) {
        self.exports.set_provider(provider);
    }

    /// Storage errors poison the session until it is closed
    fn observe<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(Error::Storage(err)) = &result {
            tracing::error!("Storage fault: {}", err);
            self.faulted = true;
        }
        result
    }

    // ========== Inbound updates ==========

    /// Register loaded modules; collections follow any module that moved
    pub fn update_modules(&mut self, modules: &[ModuleInfo]) -> Result<()> {
        let store = writable(&mut self.store, self.faulted)?;
        let result = self
            .modules
            .update(store, modules)
            .and_then(|_| self.functions.modules_synced(store))
            .and_then(|_| self.functions.rebase_modules(store));
        self.observe(result)
    }

    /// Merge a snapshot of sampled calls
    pub fn update(&mut self, snapshot: &Snapshot) -> Result<()> {
        let store = writable(&mut self.store, self.faulted)?;
        let result = self
            .functions
            .update(store, &mut self.modules, &mut self.scheduler, snapshot);
        self.observe(result)
    }

    pub fn rename_function(&mut self, key: FunctionKey, new_name: &str) -> Result<()> {
        writable(&mut self.store, self.faulted)?;
        self.functions.rename(key, new_name, &mut self.scheduler)
    }

    pub fn set_probe_id(&mut self, key: FunctionKey, id: Option<ProbeId>) -> Result<()> {
        writable(&mut self.store, self.faulted)?;
        self.functions.set_probe_id(key, id)
    }

    pub fn set_probe_script(&mut self, key: FunctionKey, script: &str) -> Result<()> {
        writable(&mut self.store, self.faulted)?;
        self.functions.set_probe_script(key, script, &mut self.scheduler)
    }

    pub fn log(&mut self, entry: &LogEntry) {
        self.functions.log(entry);
    }

    // ========== Scheduling ==========

    /// One timer tick: apply export replies, then run flushes within the quota.
    ///
    /// An `Err` is fatal; the session stays faulted until closed.
    pub fn tick(&mut self) -> Result<()> {
        if self.faulted {
            return Err(Error::Faulted);
        }
        let Some(store) = self.store.as_mut() else {
            self.exports.take_replies();
            return Ok(());
        };

        for batch in self.exports.take_replies() {
            self.functions.apply_exports(&batch, &mut self.scheduler);
        }

        let mut ctx = FlushContext {
            store,
            functions: &mut self.functions,
            exports: &mut self.exports,
        };
        let result = self.scheduler.tick(&mut ctx);
        if let Err(err) = &result {
            // A task that failed would fail again on the next tick
            tracing::error!("Flush failed: {}", err);
            self.faulted = true;
        }
        result
    }

    /// Tick until every queued flush and export reply has been handled.
    ///
    /// Returns the number of ticks it took.
    pub fn drain(&mut self) -> Result<usize> {
        writable(&mut self.store, self.faulted)?;
        let mut ticks = 0;
        while !self.is_idle() {
            self.tick()?;
            ticks += 1;
        }
        Ok(ticks)
    }

    /// Tick on the timer until idle, sleeping [`Session::tick_interval`]
    /// between ticks.
    ///
    /// Returns the number of ticks it took.
    pub fn run_until_idle(&mut self) -> Result<usize> {
        writable(&mut self.store, self.faulted)?;
        let timer = crossbeam::channel::tick(self.tick_interval());
        let mut ticks = 0;
        while !self.is_idle() {
            if timer.recv().is_err() {
                break;
            }
            self.tick()?;
            ticks += 1;
        }
        Ok(ticks)
    }

    /// Nothing queued and no export reply waiting
    pub fn is_idle(&self) -> bool {
        !self.scheduler.is_running() && !self.exports.has_pending_replies()
    }

    pub fn tick_interval(&self) -> Duration {
        self.scheduler.interval()
    }

    pub fn pending_flushes(&self) -> usize {
        self.scheduler.len()
    }

    // ========== Observers & queries ==========

    pub fn subscribe_modules(&mut self, observer: Box<dyn ModuleObserver>) -> SubscriptionId {
        self.modules.subscribe(observer)
    }

    pub fn unsubscribe_modules(&mut self, id: SubscriptionId) -> bool {
        self.modules.unsubscribe(id)
    }

    /// Subscribe to one module's function list, loading it if needed
    pub fn subscribe_functions(
        &mut self,
        module_id: ModuleId,
        observer: Box<dyn FunctionObserver>,
    ) -> Result<SubscriptionId> {
        let store = writable(&mut self.store, self.faulted)?;
        let module = store
            .get_module(module_id)?
            .ok_or_else(|| Error::UnknownModule(module_id.to_string()))?;
        let result = self.functions.subscribe(&module, store, observer);
        self.observe(result)
    }

    pub fn unsubscribe_functions(&mut self, module_id: ModuleId, id: SubscriptionId) -> bool {
        self.functions.unsubscribe(module_id, id)
    }

    pub fn add_log_handler(&mut self, handler: Box<dyn LogHandler>) -> SubscriptionId {
        self.functions.add_log_handler(handler)
    }

    pub fn remove_log_handler(&mut self, id: SubscriptionId) -> bool {
        self.functions.remove_log_handler(id)
    }

    /// Modules with calls, hottest first
    pub fn active_modules(&self) -> &[Module] {
        self.modules.items()
    }

    pub fn collection(&self, module_id: ModuleId) -> Option<&FunctionCollection> {
        self.functions.collection(module_id)
    }

    pub fn function(&self, key: FunctionKey) -> Option<&FunctionRecord> {
        self.functions.get(key)
    }

    pub fn function_by_address(&self, address: u64) -> Option<&FunctionRecord> {
        self.functions.get_by_address(address)
    }

    pub fn function_by_name(&self, name: &str) -> Option<&FunctionRecord> {
        self.functions.get_by_name(name)
    }

    pub fn stats(&self) -> Result<DbStats> {
        self.store.as_ref().ok_or(Error::NotOpen)?.stats()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}
