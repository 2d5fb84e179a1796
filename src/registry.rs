//! Module Registry - persisted module catalog and the active-modules view

use std::collections::{BTreeMap, HashMap};

use crate::Result;
use crate::module::{Module, ModuleId, ModuleInfo};
use crate::observer::{ObserverList, SubscriptionId};
use crate::storage::{SqliteStore, StoreTransaction};

/// Receives the full active-module list on every reload
pub trait ModuleObserver {
    fn on_modules_update(&mut self, items: &[Module]);
}

impl<F> ModuleObserver for F
where
    F: FnMut(&[Module]),
{
    fn on_modules_update(&mut self, items: &[Module]) {
        self(items)
    }
}

/// Catalog of modules keyed by unique name.
///
/// The active view holds modules with calls, hottest first.
#[derive(Default)]
pub struct ModuleRegistry {
    items: Vec<Module>,
    synced: bool,
    /// Per-name lookups; dropped on every mutation and on attachment
    cache: HashMap<String, Module>,
    observers: ObserverList<dyn ModuleObserver>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset state for a freshly attached store and load its active view
    pub fn attach(&mut self, store: &SqliteStore) -> Result<()> {
        self.synced = false;
        self.cache.clear();
        self.reload(store)
    }

    /// Upsert modules by name and reload the active view
    pub fn update(&mut self, store: &mut SqliteStore, modules: &[ModuleInfo]) -> Result<()> {
        let tx = store.transaction()?;
        for module in modules {
            tx.upsert_module(module)?;
        }
        tx.commit()?;

        tracing::debug!("Registered {} modules", modules.len());
        self.synced = true;
        self.cache.clear();
        self.reload(store)
    }

    /// Add per-module call deltas in one transaction and reload the active view
    pub fn increment_calls(
        &mut self,
        store: &mut SqliteStore,
        totals: &BTreeMap<ModuleId, u64>,
    ) -> Result<()> {
        let tx = store.transaction()?;
        self.apply_increments(&tx, totals)?;
        tx.commit()?;
        self.reload(store)
    }

    /// Add call deltas inside a caller-owned transaction.
    ///
    /// The caller reloads once the transaction commits.
    pub fn apply_increments(
        &mut self,
        tx: &StoreTransaction<'_>,
        totals: &BTreeMap<ModuleId, u64>,
    ) -> Result<()> {
        for (&id, &calls) in totals {
            tx.increment_module_calls(id, calls)?;
        }
        self.cache.clear();
        Ok(())
    }

    /// Look up a module by name, caching the row for the rest of the transaction
    pub fn get_by_name(&mut self, tx: &StoreTransaction<'_>, name: &str) -> Result<Option<Module>> {
        if let Some(module) = self.cache.get(name) {
            return Ok(Some(module.clone()));
        }

        let module = tx.module_by_name(name)?;
        if let Some(module) = &module {
            self.cache.insert(name.to_string(), module.clone());
        }
        Ok(module)
    }

    /// Re-read the active view from storage and notify observers
    pub fn reload(&mut self, store: &SqliteStore) -> Result<()> {
        self.items = store.active_modules()?;
        self.notify();
        Ok(())
    }

    /// Drop all state when the store detaches
    pub fn unload(&mut self) {
        self.items.clear();
        self.synced = false;
        self.cache.clear();
        self.notify();
    }

    /// Subscribe to the active view.
    ///
    /// The observer gets the current list right away once the view has synced.
    pub fn subscribe(&mut self, observer: Box<dyn ModuleObserver>) -> SubscriptionId {
        let (id, observer) = self.observers.subscribe(observer);
        if self.synced {
            observer.on_modules_update(&self.items);
        }
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.observers.unsubscribe(id)
    }

    /// Active modules, hottest first
    pub fn items(&self) -> &[Module] {
        &self.items
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    fn notify(&mut self) {
        for observer in self.observers.iter_mut() {
            observer.on_modules_update(&self.items);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn recorder() -> (Rc<RefCell<Vec<Vec<String>>>>, Box<dyn ModuleObserver>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let observer = Box::new(move |items: &[Module]| {
            sink.borrow_mut()
                .push(items.iter().map(|m| m.name.clone()).collect::<Vec<_>>());
        });
        (seen, observer)
    }

    fn modules() -> Vec<ModuleInfo> {
        vec![
            ModuleInfo::new("target", "/bin/target", 0x400000, true),
            ModuleInfo::new("libfoo.so", "/usr/lib/libfoo.so", 0x1000, false),
        ]
    }

    #[test]
    fn test_update_syncs_and_notifies() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let mut registry = ModuleRegistry::new();
        let (seen, observer) = recorder();

        registry.subscribe(observer);
        assert!(seen.borrow().is_empty());

        registry.update(&mut store, &modules()).unwrap();
        assert!(registry.is_synced());
        // No calls yet, so the active view is empty
        assert_eq!(seen.borrow().as_slice(), &[Vec::<String>::new()]);
    }

    #[test]
    fn test_late_subscriber_gets_current_items() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let mut registry = ModuleRegistry::new();
        registry.update(&mut store, &modules()).unwrap();

        let tx = store.transaction().unwrap();
        let foo = registry.get_by_name(&tx, "libfoo.so").unwrap().unwrap();
        drop(tx);

        let mut totals = BTreeMap::new();
        totals.insert(foo.id, 12);
        registry.increment_calls(&mut store, &totals).unwrap();

        let (seen, observer) = recorder();
        registry.subscribe(observer);
        assert_eq!(seen.borrow().as_slice(), &[vec!["libfoo.so".to_string()]]);
        assert_eq!(registry.items()[0].calls, 12);
    }

    #[test]
    fn test_active_view_sorted_descending() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let mut registry = ModuleRegistry::new();
        registry.update(&mut store, &modules()).unwrap();

        let tx = store.transaction().unwrap();
        let main = registry.get_by_name(&tx, "target").unwrap().unwrap();
        let foo = registry.get_by_name(&tx, "libfoo.so").unwrap().unwrap();
        drop(tx);

        registry
            .increment_calls(&mut store, &BTreeMap::from([(main.id, 2), (foo.id, 5)]))
            .unwrap();
        registry
            .increment_calls(&mut store, &BTreeMap::from([(main.id, 4)]))
            .unwrap();

        let calls: Vec<_> = registry.items().iter().map(|m| (m.name.as_str(), m.calls)).collect();
        assert_eq!(calls, vec![("target", 6), ("libfoo.so", 5)]);
    }

    #[test]
    fn test_reload_moves_module() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let mut registry = ModuleRegistry::new();
        registry.update(&mut store, &modules()).unwrap();
        registry
            .update(&mut store, &[ModuleInfo::new("libfoo.so", "/opt/libfoo.so", 0x9000, false)])
            .unwrap();

        let tx = store.transaction().unwrap();
        let foo = registry.get_by_name(&tx, "libfoo.so").unwrap().unwrap();
        assert_eq!(foo.base, 0x9000);
        assert_eq!(foo.path, "/opt/libfoo.so");
    }

    #[test]
    fn test_unload_notifies_empty_list() {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let mut registry = ModuleRegistry::new();
        let (seen, observer) = recorder();
        let id = registry.subscribe(observer);
        registry.update(&mut store, &modules()).unwrap();

        registry.unload();
        assert!(!registry.is_synced());
        assert_eq!(seen.borrow().len(), 2);

        assert!(registry.unsubscribe(id));
        registry.unload();
        assert_eq!(seen.borrow().len(), 2);
    }
}
