//! Function Store - routes snapshots to per-module collections
//!
//! The store owns one [`FunctionCollection`] per module, the global name and
//! address indices shared by all of them, and the log handlers.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::collection::{CollectionSettings, FlushTask, FunctionCollection, FunctionObserver};
use crate::exports::{ExportBatch, Exports};
use crate::function::{FunctionKey, FunctionRecord, ProbeId};
use crate::module::{Module, ModuleId};
use crate::observer::{ObserverList, SubscriptionId};
use crate::registry::ModuleRegistry;
use crate::scheduler::{Quota, Scheduler};
use crate::storage::SqliteStore;
use crate::{Error, Result};

/// One batch of sampled call counts, keyed by raw address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub summary: BTreeMap<u64, SampleEntry>,
}

/// Calls sampled at one address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleEntry {
    #[serde(default)]
    pub symbol: Option<SymbolRef>,
    pub count: u64,
}

/// Module-relative identity of a sampled address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolRef {
    pub module: String,
    pub offset: u64,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `count` calls at `address`, resolved to `module` + `offset`
    pub fn with(mut self, address: u64, module: &str, offset: u64, count: u64) -> Self {
        self.summary.insert(
            address,
            SampleEntry {
                symbol: Some(SymbolRef {
                    module: module.to_string(),
                    offset,
                }),
                count,
            },
        );
        self
    }

    /// Record `count` calls at an address with no symbol information
    pub fn with_unresolved(mut self, address: u64, count: u64) -> Self {
        self.summary.insert(address, SampleEntry { symbol: None, count });
        self
    }
}

/// A message logged by a probe at a function address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub address: u64,
    pub message: String,
}

/// Receives probe log messages with the function they came from, if known
pub trait LogHandler {
    fn on_log(&mut self, function: Option<&FunctionRecord>, message: &str);
}

impl<F> LogHandler for F
where
    F: FnMut(Option<&FunctionRecord>, &str),
{
    fn on_log(&mut self, function: Option<&FunctionRecord>, message: &str) {
        self(function, message)
    }
}

/// Store-wide name and address indices
#[derive(Debug, Default)]
pub struct FunctionIndex {
    by_name: HashMap<String, FunctionKey>,
    by_address: HashMap<u64, FunctionKey>,
}

impl FunctionIndex {
    pub fn name_owner(&self, name: &str) -> Option<FunctionKey> {
        self.by_name.get(name).copied()
    }

    pub fn is_name_taken(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn address(&self, address: u64) -> Option<FunctionKey> {
        self.by_address.get(&address).copied()
    }

    pub fn insert(&mut self, record: &FunctionRecord) {
        let key = record.key();
        self.by_name.insert(record.name.clone(), key);
        self.by_address.insert(record.address, key);
    }

    /// Remove a record's entries, leaving ones another record has taken over
    pub fn remove(&mut self, record: &FunctionRecord) {
        let key = record.key();
        if self.by_name.get(&record.name) == Some(&key) {
            self.by_name.remove(&record.name);
        }
        if self.by_address.get(&record.address) == Some(&key) {
            self.by_address.remove(&record.address);
        }
    }

    pub fn rename(&mut self, old: &str, new: &str, key: FunctionKey) {
        if self.by_name.get(old) == Some(&key) {
            self.by_name.remove(old);
        }
        self.by_name.insert(new.to_string(), key);
    }

    /// `candidate` if free (or already held by `key`), else the first free
    /// `candidate_N`
    pub fn unique_name(&self, candidate: String, key: FunctionKey) -> String {
        if self.name_owner(&candidate).is_none_or(|owner| owner == key) {
            return candidate;
        }

        let mut n = 2;
        loop {
            let name = format!("{}_{}", candidate, n);
            if !self.by_name.contains_key(&name) {
                return name;
            }
            n += 1;
        }
    }

    pub fn clear(&mut self) {
        self.by_name.clear();
        self.by_address.clear();
    }
}

fn lookup<'a>(
    collections: &'a BTreeMap<ModuleId, FunctionCollection>,
    key: FunctionKey,
) -> Option<&'a FunctionRecord> {
    collections.get(&key.module_id)?.get(key.offset)
}

fn collection_for(
    collections: &mut BTreeMap<ModuleId, FunctionCollection>,
    key: FunctionKey,
) -> Result<&mut FunctionCollection> {
    collections
        .get_mut(&key.module_id)
        .ok_or(Error::UnknownFunction {
            module_id: key.module_id,
            offset: key.offset,
        })
}

/// Façade over every module's function collection
pub struct FunctionStore {
    collections: BTreeMap<ModuleId, FunctionCollection>,
    index: FunctionIndex,
    log_handlers: ObserverList<dyn LogHandler>,
    settings: CollectionSettings,
    synced: bool,
}

impl FunctionStore {
    pub fn new(settings: CollectionSettings) -> Self {
        Self {
            collections: BTreeMap::new(),
            index: FunctionIndex::default(),
            log_handlers: ObserverList::new(),
            settings,
            synced: false,
        }
    }

    // ========== Lifecycle ==========

    /// Reset for a freshly attached store and load every module with calls.
    ///
    /// Names handed out before the next module sync must not collide with
    /// persisted ones, so the index is complete from the start.
    pub fn attach(&mut self, store: &SqliteStore) -> Result<()> {
        self.collections.clear();
        self.index.clear();
        self.synced = false;
        self.load_active(store)
    }

    /// Unload every collection (observers see empty lists) and forget them
    pub fn unload(&mut self) {
        for collection in self.collections.values_mut() {
            collection.unload();
        }
        self.collections.clear();
        self.index.clear();
        self.synced = false;
    }

    /// Called once the module registry has synced.
    ///
    /// Every module with calls gets a loaded collection, so the name index
    /// covers every persisted function name before new names are handed out.
    pub fn modules_synced(&mut self, store: &SqliteStore) -> Result<()> {
        if self.synced {
            return Ok(());
        }
        self.synced = true;

        for collection in self.collections.values_mut() {
            if !collection.is_loaded() {
                collection.load(store, &mut self.index)?;
            }
        }
        self.load_active(store)
    }

    fn load_active(&mut self, store: &SqliteStore) -> Result<()> {
        for module in store.active_modules()? {
            self.ensure_collection(&module, store)?;
        }
        Ok(())
    }

    /// Follow modules that reloaded at a different base address
    pub fn rebase_modules(&mut self, store: &SqliteStore) -> Result<()> {
        for (&id, collection) in self.collections.iter_mut() {
            if let Some(module) = store.get_module(id)? {
                collection.rebase(module, &mut self.index);
            }
        }
        Ok(())
    }

    fn ensure_collection(&mut self, module: &Module, store: &SqliteStore) -> Result<()> {
        if self.collections.contains_key(&module.id) {
            return Ok(());
        }

        let mut collection = FunctionCollection::new(module.clone(), self.settings.clone());
        collection.load(store, &mut self.index)?;
        self.collections.insert(module.id, collection);
        Ok(())
    }

    // ========== Updates ==========

    /// Apply a snapshot: group samples by module, update each touched
    /// collection once, and add the module totals in the same transaction
    /// as the module lookups.
    pub fn update(
        &mut self,
        store: &mut SqliteStore,
        modules: &mut ModuleRegistry,
        scheduler: &mut Scheduler<FlushTask>,
        snapshot: &Snapshot,
    ) -> Result<()> {
        let mut batches: BTreeMap<ModuleId, (Module, Vec<(u64, u64)>)> = BTreeMap::new();
        let mut module_calls: BTreeMap<ModuleId, u64> = BTreeMap::new();
        let mut unresolved = 0u64;

        let tx = store.transaction()?;
        for (&address, entry) in &snapshot.summary {
            let Some(symbol) = &entry.symbol else {
                // No module to attribute these to
                unresolved = unresolved.saturating_add(entry.count);
                continue;
            };
            let Some(module) = modules.get_by_name(&tx, &symbol.module)? else {
                tracing::warn!(
                    "Dropping {} calls at {:#x}: unknown module {}",
                    entry.count,
                    address,
                    symbol.module
                );
                continue;
            };

            let id = module.id;
            batches
                .entry(id)
                .or_insert_with(|| (module, Vec::new()))
                .1
                .push((symbol.offset, entry.count));
            let total = module_calls.entry(id).or_default();
            *total = total.saturating_add(entry.count);
        }
        modules.apply_increments(&tx, &module_calls)?;
        tx.commit()?;

        if unresolved > 0 {
            tracing::debug!("Dropped {} calls without symbol information", unresolved);
        }

        for (module_id, (module, updates)) in &batches {
            self.ensure_collection(module, store)?;
            if let Some(collection) = self.collections.get_mut(module_id) {
                collection.update(updates, &mut self.index, scheduler);
            }
        }

        modules.reload(store)
    }

    pub fn rename(
        &mut self,
        key: FunctionKey,
        new_name: &str,
        scheduler: &mut Scheduler<FlushTask>,
    ) -> Result<()> {
        collection_for(&mut self.collections, key)?
            .rename(key.offset, new_name, &mut self.index, scheduler)
    }

    pub fn set_probe_id(&mut self, key: FunctionKey, id: Option<ProbeId>) -> Result<()> {
        collection_for(&mut self.collections, key)?.set_probe_id(key.offset, id)
    }

    pub fn set_probe_script(
        &mut self,
        key: FunctionKey,
        script: &str,
        scheduler: &mut Scheduler<FlushTask>,
    ) -> Result<()> {
        collection_for(&mut self.collections, key)?
            .set_probe_script(key.offset, script, scheduler)
    }

    /// Merge an export reply into its module's collection
    pub fn apply_exports(&mut self, batch: &ExportBatch, scheduler: &mut Scheduler<FlushTask>) {
        match self.collections.get_mut(&batch.module_id) {
            Some(collection) => collection.apply_exports(&batch.functions, &mut self.index, scheduler),
            None => tracing::debug!("Export reply for unloaded module {}", batch.module_id),
        }
    }

    /// Run one module's flush; a module without a collection has nothing to write
    pub fn flush(
        &mut self,
        module_id: ModuleId,
        store: &mut SqliteStore,
        quota: &Quota,
        exports: &mut Exports,
    ) -> Result<bool> {
        // Rows of these modules may be displaced; their records rewrite them
        let loaded: BTreeSet<ModuleId> = self
            .collections
            .iter()
            .filter(|(_, collection)| collection.is_loaded())
            .map(|(&id, _)| id)
            .collect();
        match self.collections.get_mut(&module_id) {
            Some(collection) => collection.flush(store, quota, exports, &loaded),
            None => Ok(true),
        }
    }

    // ========== Observers & lookups ==========

    /// Subscribe to a module's function list, creating its collection if needed
    pub fn subscribe(
        &mut self,
        module: &Module,
        store: &SqliteStore,
        observer: Box<dyn FunctionObserver>,
    ) -> Result<SubscriptionId> {
        self.ensure_collection(module, store)?;
        let collection = self.collections.get_mut(&module.id).ok_or_else(|| Error::UnknownModule(module.name.clone()))?;
        Ok(collection.subscribe(observer))
    }

    pub fn unsubscribe(&mut self, module_id: ModuleId, id: SubscriptionId) -> bool {
        self.collections
            .get_mut(&module_id)
            .is_some_and(|collection| collection.unsubscribe(id))
    }

    pub fn collection(&self, module_id: ModuleId) -> Option<&FunctionCollection> {
        self.collections.get(&module_id)
    }

    pub fn get(&self, key: FunctionKey) -> Option<&FunctionRecord> {
        lookup(&self.collections, key)
    }

    pub fn get_by_address(&self, address: u64) -> Option<&FunctionRecord> {
        lookup(&self.collections, self.index.address(address)?)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&FunctionRecord> {
        lookup(&self.collections, self.index.name_owner(name)?)
    }

    // ========== Logging ==========

    /// Hand a probe message to every log handler, in registration order
    pub fn log(&mut self, entry: &LogEntry) {
        let function = self
            .index
            .address(entry.address)
            .and_then(|key| lookup(&self.collections, key));
        for handler in self.log_handlers.iter_mut() {
            handler.on_log(function, &entry.message);
        }
    }

    pub fn add_log_handler(&mut self, handler: Box<dyn LogHandler>) -> SubscriptionId {
        self.log_handlers.subscribe(handler).0
    }

    pub fn remove_log_handler(&mut self, id: SubscriptionId) -> bool {
        self.log_handlers.unsubscribe(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleInfo;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    struct Fixture {
        store: SqliteStore,
        modules: ModuleRegistry,
        scheduler: Scheduler<FlushTask>,
        functions: FunctionStore,
    }

    impl Fixture {
        fn new() -> Self {
            let mut store = SqliteStore::open_in_memory().unwrap();
            let mut modules = ModuleRegistry::new();
            modules
                .update(
                    &mut store,
                    &[
                        ModuleInfo::new("target", "/bin/target", 0x400000, true),
                        ModuleInfo::new("libfoo.so", "/usr/lib/libfoo.so", 0x1000, false),
                    ],
                )
                .unwrap();
            let mut functions = FunctionStore::new(CollectionSettings::default());
            functions.modules_synced(&store).unwrap();
            Self {
                store,
                modules,
                scheduler: Scheduler::new(Duration::from_millis(15), Duration::from_millis(10)),
                functions,
            }
        }

        fn apply(&mut self, snapshot: &Snapshot) {
            self.functions
                .update(&mut self.store, &mut self.modules, &mut self.scheduler, snapshot)
                .unwrap();
        }
    }

    #[test]
    fn test_snapshot_routes_to_modules() {
        let mut fx = Fixture::new();
        fx.apply(
            &Snapshot::new()
                .with(0x1010, "libfoo.so", 0x10, 5)
                .with(0x1020, "libfoo.so", 0x20, 2)
                .with(0x400100, "target", 0x100, 9),
        );

        let foo = fx.functions.get_by_address(0x1010).unwrap();
        assert_eq!(foo.name, "foo_10");
        assert_eq!(foo.calls, 5);
        assert_eq!(fx.functions.get_by_name("sub_100").unwrap().address, 0x400100);

        let totals: Vec<_> = fx.modules.items().iter().map(|m| (m.name.as_str(), m.calls)).collect();
        assert_eq!(totals, vec![("target", 9), ("libfoo.so", 7)]);

        // One flush per touched module
        assert_eq!(fx.scheduler.len(), 2);
    }

    #[test]
    fn test_unresolved_and_unknown_samples_are_dropped() {
        let mut fx = Fixture::new();
        fx.apply(
            &Snapshot::new()
                .with_unresolved(0xdead, 100)
                .with(0x9000, "libmissing.so", 0x10, 3)
                .with(0x1010, "libfoo.so", 0x10, 1),
        );

        assert!(fx.functions.get_by_address(0xdead).is_none());
        assert!(fx.functions.get_by_address(0x9000).is_none());
        let totals: Vec<_> = fx.modules.items().iter().map(|m| m.calls).collect();
        assert_eq!(totals, vec![1]);
    }

    #[test]
    fn test_repeated_snapshots_accumulate() {
        let mut fx = Fixture::new();
        fx.apply(&Snapshot::new().with(0x1010, "libfoo.so", 0x10, 5));
        fx.apply(&Snapshot::new().with(0x1010, "libfoo.so", 0x10, 4));

        assert_eq!(fx.functions.get_by_address(0x1010).unwrap().calls, 9);
        assert_eq!(fx.modules.items()[0].calls, 9);
    }

    #[test]
    fn test_log_fans_out_in_order() {
        let mut fx = Fixture::new();
        fx.apply(&Snapshot::new().with(0x1010, "libfoo.so", 0x10, 1));

        let seen = Rc::new(RefCell::new(Vec::new()));
        let first = Rc::clone(&seen);
        let second = Rc::clone(&seen);
        fx.functions.add_log_handler(Box::new(move |function: Option<&FunctionRecord>, message: &str| {
            first.borrow_mut().push(format!(
                "1:{}:{}",
                function.map(|f| f.name.as_str()).unwrap_or("?"),
                message
            ));
        }));
        let id = fx.functions.add_log_handler(Box::new(move |function: Option<&FunctionRecord>, message: &str| {
            second.borrow_mut().push(format!("2:{}:{}", function.is_some(), message));
        }));

        fx.functions.log(&LogEntry { address: 0x1010, message: "hit".into() });
        fx.functions.log(&LogEntry { address: 0x4242, message: "stray".into() });
        assert_eq!(
            seen.borrow().as_slice(),
            &["1:foo_10:hit", "2:true:hit", "1:?:stray", "2:false:stray"]
        );

        assert!(fx.functions.remove_log_handler(id));
        fx.functions.log(&LogEntry { address: 0x1010, message: "again".into() });
        assert_eq!(seen.borrow().len(), 5);
    }

    #[test]
    fn test_unknown_function_is_an_error() {
        let mut fx = Fixture::new();
        let result = fx
            .functions
            .rename(FunctionKey::new(1, 0x77), "nope", &mut fx.scheduler);
        assert!(matches!(result, Err(Error::UnknownFunction { .. })));
    }

    #[test]
    fn test_rename_updates_name_index() {
        let mut fx = Fixture::new();
        fx.apply(&Snapshot::new().with(0x1010, "libfoo.so", 0x10, 3));
        let key = fx.functions.get_by_address(0x1010).unwrap().key();

        fx.functions.rename(key, "foo_init", &mut fx.scheduler).unwrap();
        assert_eq!(fx.functions.get_by_name("foo_init").unwrap().key(), key);
        assert!(fx.functions.get_by_name("foo_10").is_none());
    }

    #[test]
    fn test_attach_loads_persisted_names() {
        let mut fx = Fixture::new();
        fx.apply(&Snapshot::new().with(0x1010, "libfoo.so", 0x10, 3));
        let key = fx.functions.get_by_address(0x1010).unwrap().key();
        fx.functions.rename(key, "foo_init", &mut fx.scheduler).unwrap();

        let mut exports = Exports::new();
        let quota = Quota::new(Duration::from_secs(60));
        assert!(
            fx.functions
                .flush(key.module_id, &mut fx.store, &quota, &mut exports)
                .unwrap()
        );

        let mut functions = FunctionStore::new(CollectionSettings::default());
        functions.attach(&fx.store).unwrap();
        assert_eq!(functions.get_by_name("foo_init").unwrap().calls, 3);
        assert!(functions.collection(key.module_id).unwrap().is_loaded());
    }

    #[test]
    fn test_unique_name_suffixes_collisions() {
        let module = Module {
            id: 1,
            name: "libfoo.so".into(),
            path: "/usr/lib/libfoo.so".into(),
            base: 0,
            is_main: false,
            calls: 0,
        };
        let mut index = FunctionIndex::default();
        index.insert(&FunctionRecord::new(&module, "foo_10".into(), 0x10, 1, ""));
        index.insert(&FunctionRecord::new(&module, "foo_10_2".into(), 0x20, 1, ""));

        assert_eq!(index.unique_name("foo_10".into(), FunctionKey::new(1, 0x10)), "foo_10");
        assert_eq!(index.unique_name("foo_10".into(), FunctionKey::new(2, 0x10)), "foo_10_3");
        assert_eq!(index.unique_name("bar".into(), FunctionKey::new(2, 0x10)), "bar");
    }
}
