//! Function Collection - one module's functions, hottest first
//!
//! A collection keeps every known function of its module in memory, exposes
//! the ones with calls as a list sorted by descending call count, and tracks
//! which records still need to be written back. Writes happen later, a few
//! rows per transaction, from a [`FlushTask`] on the scheduler.
//!
//! Observers see every change as a [`FunctionEvent`], delivered synchronously
//! in registration order, so they can mirror the list without re-reading it.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};

use crate::exports::{ExportedFunction, Exports};
use crate::function::{FunctionKey, FunctionRecord, ProbeId, function_prefix, synthesized_name};
use crate::module::{Module, ModuleId};
use crate::observer::{ObserverList, SubscriptionId};
use crate::scheduler::{Quota, Scheduler};
use crate::storage::SqliteStore;
use crate::store::FunctionIndex;
use crate::{Error, Result};

/// A single changed field of a visible function
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldChange<'a> {
    Name(&'a str),
    Exported(bool),
    Calls(u64),
    ProbeId(Option<ProbeId>),
    ProbeScript(&'a str),
}

/// Change to a collection's visible list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionEvent<'a> {
    /// The whole list was replaced (load, unload, rebase)
    ListReplaced(&'a [&'a FunctionRecord]),
    /// A function got its first calls and was inserted at `index`
    ItemAdded {
        index: usize,
        function: &'a FunctionRecord,
    },
    /// A function moved; a `Calls` change at `to` follows
    ItemMoved { from: usize, to: usize },
    FieldChanged {
        index: usize,
        change: FieldChange<'a>,
    },
}

/// Receives [`FunctionEvent`]s from one collection
pub trait FunctionObserver {
    fn on_function_event(&mut self, event: &FunctionEvent<'_>);
}

impl<F> FunctionObserver for F
where
    F: FnMut(&FunctionEvent<'_>),
{
    fn on_function_event(&mut self, event: &FunctionEvent<'_>) {
        self(event)
    }
}

/// Per-collection knobs taken from the session config
#[derive(Debug, Clone)]
pub struct CollectionSettings {
    pub default_script: String,
    /// Rows written per flush transaction
    pub batch_size: usize,
}

impl Default for CollectionSettings {
    fn default() -> Self {
        Self {
            default_script: crate::config::DEFAULT_PROBE_SCRIPT.to_string(),
            batch_size: crate::config::DEFAULT_FLUSH_BATCH_SIZE,
        }
    }
}

/// Scheduled write-back of one module's dirty functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushTask {
    pub module_id: ModuleId,
}

fn emit(observers: &mut ObserverList<dyn FunctionObserver>, event: FunctionEvent<'_>) {
    for observer in observers.iter_mut() {
        observer.on_function_event(&event);
    }
}

/// In-memory cache of one module's functions
pub struct FunctionCollection {
    module: Module,
    settings: CollectionSettings,
    /// Arena of every known function, visible or not
    records: Vec<FunctionRecord>,
    by_offset: HashMap<u64, usize>,
    /// Visible slots, sorted by descending calls
    items: Vec<usize>,
    dirty: BTreeSet<usize>,
    loaded: bool,
    exports_scanned: bool,
    flush_scheduled: bool,
    observers: ObserverList<dyn FunctionObserver>,
}

impl FunctionCollection {
    pub fn new(module: Module, settings: CollectionSettings) -> Self {
        Self {
            module,
            settings,
            records: Vec::new(),
            by_offset: HashMap::new(),
            items: Vec::new(),
            dirty: BTreeSet::new(),
            loaded: false,
            exports_scanned: false,
            flush_scheduled: false,
            observers: ObserverList::new(),
        }
    }

    // ========== Lifecycle ==========

    /// Replace in-memory state with the module's rows from storage
    pub fn load(&mut self, store: &SqliteStore, index: &mut FunctionIndex) -> Result<()> {
        let rows = store.functions_in_module(self.module.id)?;

        for record in &self.records {
            index.remove(record);
        }

        let script = &self.settings.default_script;
        self.records = rows
            .into_iter()
            .map(|row| FunctionRecord::from_row(row, &self.module, script))
            .collect();
        self.by_offset = self
            .records
            .iter()
            .enumerate()
            .map(|(slot, record)| (record.offset, slot))
            .collect();
        for record in &self.records {
            index.insert(record);
        }

        // Rows arrive hottest first
        self.items = (0..self.records.len())
            .filter(|&slot| self.records[slot].is_visible())
            .collect();
        self.dirty.clear();
        self.loaded = true;

        tracing::debug!(
            "Loaded {} functions for {} ({} with calls)",
            self.records.len(),
            self.module.name,
            self.items.len()
        );
        self.notify_list();
        Ok(())
    }

    /// Drop all in-memory state; unpersisted changes are lost
    pub fn unload(&mut self) {
        if !self.dirty.is_empty() {
            tracing::debug!(
                "Discarding {} unflushed functions of {}",
                self.dirty.len(),
                self.module.name
            );
        }
        self.records.clear();
        self.by_offset.clear();
        self.items.clear();
        self.dirty.clear();
        self.loaded = false;
        self.exports_scanned = false;
        self.flush_scheduled = false;
        self.notify_list();
    }

    /// Follow the module to a new load address, recomputing every address
    pub fn rebase(&mut self, module: Module, index: &mut FunctionIndex) {
        let moved = module.base != self.module.base;
        self.module = module;
        if !moved {
            return;
        }

        for record in &mut self.records {
            index.remove(record);
            record.address = self.module.address_of(record.offset);
            index.insert(record);
        }
        tracing::debug!("Rebased {} functions of {}", self.records.len(), self.module);
        self.notify_list();
    }

    // ========== Updates ==========

    /// Merge `(offset, delta calls)` pairs and reposition what they touched
    pub fn update(
        &mut self,
        updates: &[(u64, u64)],
        index: &mut FunctionIndex,
        scheduler: &mut Scheduler<FlushTask>,
    ) {
        let mut touched = Vec::new();
        for &(offset, calls) in updates {
            if calls == 0 {
                continue;
            }

            let slot = match self.by_offset.get(&offset).copied() {
                Some(slot) => {
                    let record = &mut self.records[slot];
                    record.calls = record.calls.saturating_add(calls);
                    slot
                }
                None => {
                    let key = FunctionKey::new(self.module.id, offset);
                    let name = index.unique_name(synthesized_name(&self.module, offset), key);
                    let record = FunctionRecord::new(
                        &self.module,
                        name,
                        offset,
                        calls,
                        &self.settings.default_script,
                    );
                    self.insert_record(record, index)
                }
            };

            self.dirty.insert(slot);
            if !touched.contains(&slot) {
                touched.push(slot);
            }
        }

        if touched.is_empty() {
            return;
        }

        // Hottest first, ties in list order, so each placement only scans
        // past neighbours that are already settled.
        let positions: HashMap<usize, usize> = self
            .items
            .iter()
            .enumerate()
            .map(|(index, &slot)| (slot, index))
            .collect();
        touched.sort_by_key(|slot| {
            (
                Reverse(self.records[*slot].calls),
                positions.get(slot).copied().unwrap_or(usize::MAX),
            )
        });
        for slot in touched {
            self.reposition(slot);
        }

        self.request_flush(scheduler);
    }

    /// Rename a function. Fails without side effects if the name is taken.
    pub fn rename(
        &mut self,
        offset: u64,
        new_name: &str,
        index: &mut FunctionIndex,
        scheduler: &mut Scheduler<FlushTask>,
    ) -> Result<()> {
        let slot = self.slot_of(offset)?;
        if self.records[slot].name == new_name {
            return Ok(());
        }
        if index.is_name_taken(new_name) {
            return Err(Error::NameConflict(new_name.to_string()));
        }

        let key = self.records[slot].key();
        let old = std::mem::replace(&mut self.records[slot].name, new_name.to_string());
        index.rename(&old, new_name, key);

        if let Some(position) = self.visible_index(slot) {
            emit(
                &mut self.observers,
                FunctionEvent::FieldChanged {
                    index: position,
                    change: FieldChange::Name(&self.records[slot].name),
                },
            );
        }

        self.dirty.insert(slot);
        self.request_flush(scheduler);
        Ok(())
    }

    /// Set the transient probe handle; nothing is persisted
    pub fn set_probe_id(&mut self, offset: u64, id: Option<ProbeId>) -> Result<()> {
        let slot = self.slot_of(offset)?;
        self.records[slot].probe.id = id;

        if let Some(index) = self.visible_index(slot) {
            emit(
                &mut self.observers,
                FunctionEvent::FieldChanged {
                    index,
                    change: FieldChange::ProbeId(id),
                },
            );
        }
        Ok(())
    }

    /// Replace the probe script and schedule it for persistence
    pub fn set_probe_script(
        &mut self,
        offset: u64,
        script: &str,
        scheduler: &mut Scheduler<FlushTask>,
    ) -> Result<()> {
        let slot = self.slot_of(offset)?;
        self.records[slot].probe.script = script.to_string();

        if let Some(index) = self.visible_index(slot) {
            emit(
                &mut self.observers,
                FunctionEvent::FieldChanged {
                    index,
                    change: FieldChange::ProbeScript(&self.records[slot].probe.script),
                },
            );
        }

        self.dirty.insert(slot);
        self.request_flush(scheduler);
        Ok(())
    }

    // ========== Export reconciliation ==========

    /// Merge a module's exported symbol table into its records.
    ///
    /// Address-derived records are renamed in place and marked exported;
    /// unseen exports become zero-call records. Names already held by another
    /// function get the module prefix.
    pub fn apply_exports(
        &mut self,
        functions: &[ExportedFunction],
        index: &mut FunctionIndex,
        scheduler: &mut Scheduler<FlushTask>,
    ) {
        let prefix = function_prefix(&self.module);
        let mut renamed = 0;
        let mut created = 0;

        for export in functions {
            let key = FunctionKey::new(self.module.id, export.offset);
            let mut name = export.name.clone();
            if index.name_owner(&name).is_some_and(|owner| owner != key) {
                name = format!("{}_{}", prefix, name);
            }
            let name = index.unique_name(name, key);

            let slot = match self.by_offset.get(&export.offset).copied() {
                Some(slot) => {
                    if self.records[slot].exported {
                        // Alias of an export applied earlier in this scan
                        continue;
                    }
                    let old = std::mem::replace(&mut self.records[slot].name, name);
                    self.records[slot].exported = true;
                    index.rename(&old, &self.records[slot].name, key);
                    renamed += 1;

                    if let Some(position) = self.visible_index(slot) {
                        emit(
                            &mut self.observers,
                            FunctionEvent::FieldChanged {
                                index: position,
                                change: FieldChange::Name(&self.records[slot].name),
                            },
                        );
                        emit(
                            &mut self.observers,
                            FunctionEvent::FieldChanged {
                                index: position,
                                change: FieldChange::Exported(true),
                            },
                        );
                    }
                    slot
                }
                None => {
                    let mut record = FunctionRecord::new(
                        &self.module,
                        name,
                        export.offset,
                        0,
                        &self.settings.default_script,
                    );
                    record.exported = true;
                    created += 1;
                    self.insert_record(record, index)
                }
            };

            self.dirty.insert(slot);
        }

        tracing::debug!(
            "Export scan of {}: {} renamed, {} created",
            self.module.name,
            renamed,
            created
        );
        if renamed + created > 0 {
            self.request_flush(scheduler);
        }
    }

    // ========== Write-back ==========

    /// Persist dirty records, at most one batch per transaction, until done
    /// or out of quota.
    ///
    /// The first call also kicks off the export scan. `loaded` names every
    /// module held in memory. Returns `Ok(true)` once nothing is left to write.
    pub fn flush(
        &mut self,
        store: &mut SqliteStore,
        quota: &Quota,
        exports: &mut Exports,
        loaded: &BTreeSet<ModuleId>,
    ) -> Result<bool> {
        if !self.exports_scanned {
            self.exports_scanned = true;
            self.scan_exports(store, exports)?;
        }

        let batch_size = self.settings.batch_size.max(1);
        loop {
            let batch: Vec<usize> = self.dirty.iter().take(batch_size).copied().collect();
            if batch.is_empty() {
                break;
            }

            let tx = store.transaction()?;
            for &slot in &batch {
                let record = &mut self.records[slot];
                match record.id {
                    Some(id) => tx.update_function(id, record, loaded)?,
                    None => record.id = Some(tx.insert_function(record, loaded)?),
                }
            }
            tx.commit()?;

            for slot in &batch {
                self.dirty.remove(slot);
            }
            tracing::trace!("Flushed {} functions of {}", batch.len(), self.module.name);

            if self.dirty.is_empty() {
                break;
            }
            if quota.exceeded() {
                tracing::debug!(
                    "Flush of {} yielding with {} dirty functions",
                    self.module.name,
                    self.dirty.len()
                );
                return Ok(false);
            }
        }

        self.flush_scheduled = false;
        Ok(true)
    }

    fn scan_exports(&self, store: &SqliteStore, exports: &mut Exports) -> Result<()> {
        if store.has_exported_function(self.module.id)? {
            tracing::debug!("Exports of {} already reconciled", self.module.name);
            return Ok(());
        }
        if !exports.request(&self.module) {
            tracing::debug!("No metadata provider; skipping export scan of {}", self.module.name);
        }
        Ok(())
    }

    fn request_flush(&mut self, scheduler: &mut Scheduler<FlushTask>) {
        if !self.flush_scheduled {
            self.flush_scheduled = true;
            scheduler.schedule(FlushTask {
                module_id: self.module.id,
            });
        }
    }

    // ========== Observers & accessors ==========

    /// Subscribe to list changes; a loaded collection delivers its list at once
    pub fn subscribe(&mut self, observer: Box<dyn FunctionObserver>) -> SubscriptionId {
        let (id, observer) = self.observers.subscribe(observer);
        if self.loaded {
            let items: Vec<&FunctionRecord> = self.items.iter().map(|&slot| &self.records[slot]).collect();
            observer.on_function_event(&FunctionEvent::ListReplaced(&items));
        }
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Function at `offset`, visible or not
    pub fn get(&self, offset: u64) -> Option<&FunctionRecord> {
        self.by_offset.get(&offset).map(|&slot| &self.records[slot])
    }

    /// Visible functions, hottest first
    pub fn items(&self) -> impl Iterator<Item = &FunctionRecord> {
        self.items.iter().map(|&slot| &self.records[slot])
    }

    /// Number of known functions, including ones without calls
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    // ========== Internals ==========

    fn slot_of(&self, offset: u64) -> Result<usize> {
        self.by_offset
            .get(&offset)
            .copied()
            .ok_or(Error::UnknownFunction {
                module_id: self.module.id,
                offset,
            })
    }

    fn insert_record(&mut self, record: FunctionRecord, index: &mut FunctionIndex) -> usize {
        let slot = self.records.len();
        self.by_offset.insert(record.offset, slot);
        index.insert(&record);
        self.records.push(record);
        slot
    }

    fn visible_index(&self, slot: usize) -> Option<usize> {
        self.items.iter().position(|&s| s == slot)
    }

    /// First index whose function has strictly fewer calls
    fn sorted_index_of(&self, calls: u64) -> usize {
        self.items
            .iter()
            .position(|&slot| calls > self.records[slot].calls)
            .unwrap_or(self.items.len())
    }

    /// Whether `slot` at `index` still sits between a hotter-or-equal and a
    /// colder-or-equal neighbour
    fn fits_at(&self, index: usize, calls: u64) -> bool {
        let above = index
            .checked_sub(1)
            .map(|i| self.records[self.items[i]].calls >= calls)
            .unwrap_or(true);
        let below = self
            .items
            .get(index + 1)
            .map(|&slot| self.records[slot].calls <= calls)
            .unwrap_or(true);
        above && below
    }

    fn reposition(&mut self, slot: usize) {
        let calls = self.records[slot].calls;

        let Some(old_index) = self.visible_index(slot) else {
            let index = self.sorted_index_of(calls);
            self.items.insert(index, slot);
            emit(
                &mut self.observers,
                FunctionEvent::ItemAdded {
                    index,
                    function: &self.records[slot],
                },
            );
            return;
        };

        let mut index = old_index;
        if !self.fits_at(old_index, calls) {
            self.items.remove(old_index);
            index = self.sorted_index_of(calls);
            self.items.insert(index, slot);
            if index != old_index {
                emit(
                    &mut self.observers,
                    FunctionEvent::ItemMoved {
                        from: old_index,
                        to: index,
                    },
                );
            }
        }

        emit(
            &mut self.observers,
            FunctionEvent::FieldChanged {
                index,
                change: FieldChange::Calls(calls),
            },
        );
    }

    fn notify_list(&mut self) {
        let items: Vec<&FunctionRecord> = self.items.iter().map(|&slot| &self.records[slot]).collect();
        emit(&mut self.observers, FunctionEvent::ListReplaced(&items));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exports::StaticExports;
    use crate::module::ModuleInfo;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct Recorder {
        events: Rc<RefCell<Vec<String>>>,
    }

    impl Recorder {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.borrow_mut())
        }
    }

    impl FunctionObserver for Recorder {
        fn on_function_event(&mut self, event: &FunctionEvent<'_>) {
            let line = match event {
                FunctionEvent::ListReplaced(items) => format!(
                    "list [{}]",
                    items.iter().map(|f| f.name.as_str()).collect::<Vec<_>>().join(",")
                ),
                FunctionEvent::ItemAdded { index, function } => {
                    format!("add {} {}", index, function.name)
                }
                FunctionEvent::ItemMoved { from, to } => format!("move {} {}", from, to),
                FunctionEvent::FieldChanged { index, change } => {
                    format!("field {} {:?}", index, change)
                }
            };
            self.events.borrow_mut().push(line);
        }
    }

    struct Fixture {
        store: SqliteStore,
        module: Module,
        index: FunctionIndex,
        scheduler: Scheduler<FlushTask>,
        collection: FunctionCollection,
        recorder: Recorder,
    }

    impl Fixture {
        fn new(settings: CollectionSettings) -> Self {
            let mut store = SqliteStore::open_in_memory().unwrap();
            let tx = store.transaction().unwrap();
            tx.upsert_module(&ModuleInfo::new("libfoo.so", "/usr/lib/libfoo.so", 0x1000, false))
                .unwrap();
            let module = tx.module_by_name("libfoo.so").unwrap().unwrap();
            tx.commit().unwrap();

            let mut index = FunctionIndex::default();
            let mut collection = FunctionCollection::new(module.clone(), settings);
            collection.load(&store, &mut index).unwrap();

            let recorder = Recorder::default();
            collection.subscribe(Box::new(recorder.clone()));
            recorder.take();

            Self {
                store,
                module,
                index,
                scheduler: Scheduler::new(Duration::from_millis(15), Duration::from_millis(10)),
                collection,
                recorder,
            }
        }

        fn update(&mut self, updates: &[(u64, u64)]) {
            self.collection
                .update(updates, &mut self.index, &mut self.scheduler);
        }

        fn names(&self) -> Vec<String> {
            self.collection.items().map(|f| f.name.clone()).collect()
        }

        fn loaded(&self) -> BTreeSet<ModuleId> {
            BTreeSet::from([self.module.id])
        }

        fn flush_all(&mut self) {
            let mut exports = Exports::new();
            let quota = Quota::new(Duration::from_secs(60));
            let loaded = self.loaded();
            assert!(
                self.collection
                    .flush(&mut self.store, &quota, &mut exports, &loaded)
                    .unwrap()
            );
        }
    }

    #[test]
    fn test_new_functions_insert_sorted() {
        let mut fx = Fixture::new(CollectionSettings::default());
        fx.update(&[(0x10, 5)]);
        fx.update(&[(0x20, 7)]);
        assert_eq!(fx.recorder.take(), vec!["add 0 foo_10", "add 0 foo_20"]);

        fx.update(&[(0x10, 3)]);
        assert_eq!(fx.recorder.take(), vec!["move 1 0", "field 0 Calls(8)"]);
        assert_eq!(fx.names(), vec!["foo_10", "foo_20"]);
        assert_eq!(fx.collection.get(0x10).unwrap().address, 0x1010);
    }

    #[test]
    fn test_ties_keep_arrival_order() {
        let mut fx = Fixture::new(CollectionSettings::default());
        fx.update(&[(0x10, 5), (0x20, 5), (0x30, 3)]);
        assert_eq!(fx.names(), vec!["foo_10", "foo_20", "foo_30"]);
        fx.recorder.take();

        // Reaching a tie does not overtake
        fx.update(&[(0x30, 2)]);
        assert_eq!(fx.recorder.take(), vec!["field 2 Calls(5)"]);
        assert_eq!(fx.names(), vec!["foo_10", "foo_20", "foo_30"]);
    }

    #[test]
    fn test_batch_keeps_list_sorted() {
        let mut fx = Fixture::new(CollectionSettings::default());
        fx.update(&[(0x10, 9), (0x20, 8), (0x30, 7), (0x40, 6)]);

        fx.update(&[(0x40, 10), (0x30, 10)]);
        let calls: Vec<u64> = fx.collection.items().map(|f| f.calls).collect();
        assert_eq!(calls, vec![17, 16, 9, 8]);
        assert_eq!(fx.names(), vec!["foo_30", "foo_40", "foo_10", "foo_20"]);
    }

    #[test]
    fn test_zero_delta_is_ignored() {
        let mut fx = Fixture::new(CollectionSettings::default());
        fx.update(&[(0x10, 0)]);
        assert!(fx.collection.is_empty());
        assert!(fx.recorder.take().is_empty());
        assert!(fx.scheduler.is_empty());
    }

    #[test]
    fn test_flush_is_scheduled_once() {
        let mut fx = Fixture::new(CollectionSettings::default());
        fx.update(&[(0x10, 1)]);
        fx.update(&[(0x20, 1)]);
        assert_eq!(fx.scheduler.len(), 1);
        assert_eq!(fx.collection.dirty_len(), 2);
    }

    #[test]
    fn test_flush_yields_between_batches() {
        let mut fx = Fixture::new(CollectionSettings::default());
        let updates: Vec<(u64, u64)> = (1..=25).map(|i| (i * 0x10, i)).collect();
        fx.update(&updates);

        let mut exports = Exports::new();
        let spent = Quota::new(Duration::ZERO);
        let loaded = fx.loaded();
        let mut flushes = Vec::new();
        loop {
            let done = fx
                .collection
                .flush(&mut fx.store, &spent, &mut exports, &loaded)
                .unwrap();
            flushes.push(fx.collection.dirty_len());
            if done {
                break;
            }
        }
        assert_eq!(flushes, vec![15, 5, 0]);
        assert_eq!(fx.store.count_functions().unwrap(), 25);
    }

    #[test]
    fn test_rename_conflict_leaves_state_untouched() {
        let mut fx = Fixture::new(CollectionSettings::default());
        fx.update(&[(0x10, 2), (0x20, 1)]);
        fx.recorder.take();

        let result = fx
            .collection
            .rename(0x10, "foo_20", &mut fx.index, &mut fx.scheduler);
        assert!(matches!(result, Err(Error::NameConflict(name)) if name == "foo_20"));
        assert_eq!(fx.collection.get(0x10).unwrap().name, "foo_10");
        assert!(fx.recorder.take().is_empty());

        fx.collection
            .rename(0x10, "parse", &mut fx.index, &mut fx.scheduler)
            .unwrap();
        assert_eq!(fx.recorder.take(), vec![r#"field 0 Name("parse")"#]);
        assert!(!fx.index.is_name_taken("foo_10"));
        assert_eq!(fx.index.name_owner("parse"), Some(FunctionKey::new(fx.module.id, 0x10)));
    }

    #[test]
    fn test_exports_rename_in_place() {
        let mut fx = Fixture::new(CollectionSettings::default());
        fx.update(&[(0x10, 5)]);
        fx.recorder.take();

        fx.collection.apply_exports(
            &[ExportedFunction::new("foo_bar", 0x10), ExportedFunction::new("foo_baz", 0x40)],
            &mut fx.index,
            &mut fx.scheduler,
        );

        assert_eq!(
            fx.recorder.take(),
            vec![r#"field 0 Name("foo_bar")"#, "field 0 Exported(true)"]
        );
        let renamed = fx.collection.get(0x10).unwrap();
        assert_eq!((renamed.name.as_str(), renamed.calls, renamed.exported), ("foo_bar", 5, true));

        let created = fx.collection.get(0x40).unwrap();
        assert!(created.exported);
        assert!(!created.is_visible());
        assert_eq!(fx.names(), vec!["foo_bar"]);
    }

    #[test]
    fn test_colliding_export_gets_module_prefix() {
        let mut fx = Fixture::new(CollectionSettings::default());
        fx.update(&[(0x10, 1)]);
        fx.collection
            .rename(0x10, "init", &mut fx.index, &mut fx.scheduler)
            .unwrap();

        fx.collection.apply_exports(
            &[ExportedFunction::new("init", 0x20), ExportedFunction::new("init_alias", 0x20)],
            &mut fx.index,
            &mut fx.scheduler,
        );
        assert_eq!(fx.collection.get(0x20).unwrap().name, "foo_init");
        assert_eq!(fx.collection.get(0x10).unwrap().name, "init");
    }

    #[test]
    fn test_first_flush_requests_exports() {
        let mut fx = Fixture::new(CollectionSettings::default());
        fx.update(&[(0x10, 1)]);

        let mut table = StaticExports::new();
        table.insert("libfoo.so", vec![ExportedFunction::new("foo_bar", 0x10)]);
        let mut exports = Exports::new();
        exports.set_provider(Some(Box::new(table)));

        let quota = Quota::new(Duration::from_secs(60));
        let loaded = fx.loaded();
        fx.collection
            .flush(&mut fx.store, &quota, &mut exports, &loaded)
            .unwrap();
        assert_eq!(exports.take_replies().len(), 1);

        // Only the first flush of a load scans
        fx.update(&[(0x10, 1)]);
        fx.collection
            .flush(&mut fx.store, &quota, &mut exports, &loaded)
            .unwrap();
        assert!(exports.take_replies().is_empty());
    }

    #[test]
    fn test_reload_restores_order_and_resets_probe_id() {
        let mut fx = Fixture::new(CollectionSettings::default());
        fx.update(&[(0x10, 2), (0x20, 9)]);
        fx.collection.set_probe_id(0x20, Some(4)).unwrap();
        fx.collection
            .set_probe_script(0x20, "log(retval);", &mut fx.scheduler)
            .unwrap();
        fx.flush_all();

        let mut index = FunctionIndex::default();
        let mut reloaded = FunctionCollection::new(fx.module.clone(), CollectionSettings::default());
        reloaded.load(&fx.store, &mut index).unwrap();

        let names: Vec<_> = reloaded.items().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["foo_20", "foo_10"]);
        let hot = reloaded.get(0x20).unwrap();
        assert_eq!(hot.probe.id, None);
        assert_eq!(hot.probe.script, "log(retval);");
        assert_eq!(
            reloaded.get(0x10).unwrap().probe.script,
            crate::config::DEFAULT_PROBE_SCRIPT
        );
    }

    #[test]
    fn test_hidden_changes_are_silent() {
        let mut fx = Fixture::new(CollectionSettings::default());
        fx.collection.apply_exports(
            &[ExportedFunction::new("cold", 0x80)],
            &mut fx.index,
            &mut fx.scheduler,
        );
        fx.collection.set_probe_id(0x80, Some(1)).unwrap();
        fx.collection
            .rename(0x80, "still_cold", &mut fx.index, &mut fx.scheduler)
            .unwrap();
        assert!(fx.recorder.take().is_empty());

        fx.update(&[(0x80, 1)]);
        assert_eq!(fx.recorder.take(), vec!["add 0 still_cold"]);
    }

    #[test]
    fn test_unload_and_rebase_replace_list() {
        let mut fx = Fixture::new(CollectionSettings::default());
        fx.update(&[(0x10, 1)]);
        fx.recorder.take();

        let moved = Module {
            base: 0x5000,
            ..fx.module.clone()
        };
        fx.collection.rebase(moved, &mut fx.index);
        assert_eq!(fx.recorder.take(), vec!["list [foo_10]"]);
        assert_eq!(fx.collection.get(0x10).unwrap().address, 0x5010);
        assert_eq!(fx.index.address(0x5010), Some(FunctionKey::new(fx.module.id, 0x10)));
        assert_eq!(fx.index.address(0x1010), None);

        fx.collection.unload();
        assert_eq!(fx.recorder.take(), vec!["list []"]);
        assert!(!fx.collection.is_loaded());
    }
}
