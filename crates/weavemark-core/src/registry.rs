//! Registry: the owned map from analyzed unit to its per-unit store.
//!
//! A registry is constructed explicitly and passed to its collaborators. It
//! lazily materializes a store for any unit it is asked about, fires a
//! payload-free change notification after every structural mutation, and
//! loads/saves its state through a [`StateStore`] at start and shutdown.
//!
//! ## Locking
//!
//! - The unit map sits behind a reader/writer lock held only long enough to
//!   look up, insert, or remove an `Arc` to a store. Store reads never wait on
//!   the map lock of another unit.
//! - Structural operations (`get_or_create` insertion, `remove`, `retire`,
//!   `clear`, state restore) additionally serialize on a structural mutex,
//!   which also guards the set of retired units.
//! - Listeners are invoked after every lock is released, in registration
//!   order, each isolated so a panicking listener cannot stop the rest.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::index::{ReferenceIndex, UnitStore};
use crate::persistence::{RegistryState, StateStore, UnitState};
use crate::reference::Reference;
use crate::types::{ArtifactPath, Member, UnitId};

// ============================================================================
// Listeners
// ============================================================================

/// Receives a notification whenever a registry changes.
///
/// There is no payload; listeners re-query the registry.
pub trait ModelListener: Send + Sync {
    fn changed(&self);
}

impl<F> ModelListener for F
where
    F: Fn() + Send + Sync,
{
    fn changed(&self) {
        self()
    }
}

/// Handle returned by [`Registry::add_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

// ============================================================================
// Registry
// ============================================================================

/// Map from unit to store, with listeners and persistence.
pub struct Registry<S: UnitStore> {
    name: String,
    units: RwLock<IndexMap<UnitId, Arc<S>>>,
    /// Units removed by the workspace; rebuilds must not bring them back.
    /// Doubles as the structural lock.
    retired: Mutex<HashSet<UnitId>>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn ModelListener>)>>,
    next_listener: AtomicU64,
    store: Box<dyn StateStore<S::Snapshot>>,
}

/// The advice reference registry.
pub type ReferenceRegistry = Registry<ReferenceIndex>;

impl<S: UnitStore> Registry<S> {
    /// Create an empty registry named `name` (used in logs).
    pub fn new(name: impl Into<String>, store: Box<dyn StateStore<S::Snapshot>>) -> Self {
        Registry {
            name: name.into(),
            units: RwLock::new(IndexMap::new()),
            retired: Mutex::new(HashSet::new()),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            store,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The store for `unit`, creating and registering an empty one if needed.
    pub fn get_or_create(&self, unit: &UnitId) -> Arc<S> {
        if let Some(existing) = self.units.read().get(unit) {
            return Arc::clone(existing);
        }

        let created = {
            let _structural = self.retired.lock();
            let mut units = self.units.write();
            if let Some(existing) = units.get(unit) {
                return Arc::clone(existing);
            }
            let store = Arc::new(S::create(unit.clone()));
            units.insert(unit.clone(), Arc::clone(&store));
            store
        };
        debug!(registry = %self.name, unit = %unit, "unit created");
        self.notify_changed();
        created
    }

    /// Like [`get_or_create`](Self::get_or_create), but `None` for a retired
    /// unit instead of resurrecting it.
    pub fn get_or_create_active(&self, unit: &UnitId) -> Option<Arc<S>> {
        if let Some(existing) = self.units.read().get(unit) {
            return Some(Arc::clone(existing));
        }

        let created = {
            let retired = self.retired.lock();
            if retired.contains(unit) {
                return None;
            }
            let mut units = self.units.write();
            if let Some(existing) = units.get(unit) {
                return Some(Arc::clone(existing));
            }
            let store = Arc::new(S::create(unit.clone()));
            units.insert(unit.clone(), Arc::clone(&store));
            store
        };
        debug!(registry = %self.name, unit = %unit, "unit created");
        self.notify_changed();
        Some(created)
    }

    /// The store a rebuild should write into.
    ///
    /// `seen` is what [`get`](Self::get) returned when the rebuild began. A
    /// store that has since been replaced or removed yields `None`, as does a
    /// retired unit.
    pub fn commit_target(&self, unit: &UnitId, seen: Option<&Arc<S>>) -> Option<Arc<S>> {
        match seen {
            Some(store) => self.is_current(unit, store).then(|| Arc::clone(store)),
            None => self.get_or_create_active(unit),
        }
    }

    /// The store for `unit` if it exists; never creates.
    pub fn get(&self, unit: &UnitId) -> Option<Arc<S>> {
        self.units.read().get(unit).cloned()
    }

    /// Remove `unit`. Returns `false` (and notifies nobody) if it was absent.
    pub fn remove(&self, unit: &UnitId) -> bool {
        let removed = {
            let _structural = self.retired.lock();
            self.units.write().shift_remove(unit).is_some()
        };
        if removed {
            debug!(registry = %self.name, unit = %unit, "unit removed");
            self.notify_changed();
        }
        removed
    }

    /// Remove `unit` and refuse to recreate it through
    /// [`get_or_create_active`](Self::get_or_create_active) until
    /// [`revive`](Self::revive). Returns whether a store was removed.
    pub fn retire(&self, unit: &UnitId) -> bool {
        let removed = {
            let mut retired = self.retired.lock();
            retired.insert(unit.clone());
            self.units.write().shift_remove(unit).is_some()
        };
        debug!(registry = %self.name, unit = %unit, removed, "unit retired");
        if removed {
            self.notify_changed();
        }
        removed
    }

    /// Allow a retired unit to be materialized again.
    pub fn revive(&self, unit: &UnitId) -> bool {
        self.retired.lock().remove(unit)
    }

    pub fn is_retired(&self, unit: &UnitId) -> bool {
        self.retired.lock().contains(unit)
    }

    /// Remove every unit and forget retirements, notifying once if anything
    /// was removed.
    pub fn clear(&self) {
        let removed = {
            let mut retired = self.retired.lock();
            retired.clear();
            let mut units = self.units.write();
            let n = units.len();
            units.clear();
            n
        };
        if removed > 0 {
            debug!(registry = %self.name, units = removed, "registry cleared");
            self.notify_changed();
        }
    }

    pub fn contains(&self, unit: &UnitId) -> bool {
        self.units.read().contains_key(unit)
    }

    /// Registered units in creation order.
    pub fn units(&self) -> Vec<UnitId> {
        self.units.read().keys().cloned().collect()
    }

    /// All stores in creation order.
    pub fn stores(&self) -> Vec<Arc<S>> {
        self.units.read().values().cloned().collect()
    }

    /// `store` is still the registered store of `unit`.
    ///
    /// Rebuilds use this to drop results for units removed mid-flight.
    pub fn is_current(&self, unit: &UnitId, store: &Arc<S>) -> bool {
        self.units
            .read()
            .get(unit)
            .is_some_and(|current| Arc::ptr_eq(current, store))
    }

    /// Drop everything `unit` derived from `artifact`; notifies if anything went.
    pub fn invalidate(&self, unit: &UnitId, artifact: &ArtifactPath) -> usize {
        let Some(store) = self.get(unit) else {
            return 0;
        };
        let removed = store.invalidate(artifact);
        if removed > 0 {
            debug!(registry = %self.name, unit = %unit, artifact = %artifact, removed, "artifact invalidated");
            self.notify_changed();
        }
        removed
    }

    // ------------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------------

    pub fn add_listener(&self, listener: Arc<dyn ModelListener>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Invoke every listener in registration order.
    pub fn notify_changed(&self) {
        let listeners: Vec<_> = self
            .listeners
            .read()
            .iter()
            .map(|(id, l)| (*id, Arc::clone(l)))
            .collect();
        for (id, listener) in listeners {
            if panic::catch_unwind(AssertUnwindSafe(|| listener.changed())).is_err() {
                error!(registry = %self.name, listener = id.0, "model listener panicked");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Load persisted state, replacing whatever is registered.
    pub fn start(&self) {
        let state = self.store.load();
        let loaded = state.units.len();
        self.restore_state(state);
        info!(registry = %self.name, units = loaded, "registry started");
    }

    /// Persist state and clear all units. Save failures are logged only.
    pub fn shutdown(&self) {
        let state = self.snapshot_state();
        if let Err(e) = self.store.save(&state) {
            warn!(registry = %self.name, error = %e, "failed to persist registry state");
        }
        self.clear();
        info!(registry = %self.name, "registry shut down");
    }

    pub fn snapshot_state(&self) -> RegistryState<S::Snapshot> {
        RegistryState {
            units: self
                .stores()
                .iter()
                .map(|store| UnitState {
                    unit: store.unit().clone(),
                    contents: store.snapshot(),
                })
                .collect(),
        }
    }

    /// Replace the registered units with `state`; notifies once if non-empty.
    pub fn restore_state(&self, state: RegistryState<S::Snapshot>) {
        let restored: IndexMap<UnitId, Arc<S>> = state
            .units
            .into_iter()
            .map(|u| {
                let store = Arc::new(S::restore(u.unit.clone(), u.contents));
                (u.unit, store)
            })
            .collect();
        let changed = !restored.is_empty();
        {
            let mut retired = self.retired.lock();
            retired.clear();
            *self.units.write() = restored;
        }
        if changed {
            self.notify_changed();
        }
    }
}

// ============================================================================
// Reference Queries
// ============================================================================

impl Registry<ReferenceIndex> {
    /// Every reference of every unit.
    pub fn all_references_in_workspace(&self) -> Vec<Reference> {
        self.stores()
            .iter()
            .flat_map(|index| index.all_references())
            .collect()
    }

    /// References affecting `artifact` as the aspect, target, bean, or advice
    /// file.
    pub fn references_touching_file(&self, artifact: &ArtifactPath) -> Vec<Reference> {
        self.stores()
            .iter()
            .flat_map(|index| index.all_references())
            .filter(|r| r.touches_any(artifact))
            .collect()
    }

    pub fn is_advised(&self, member: &Member) -> bool {
        self.stores().iter().any(|index| index.is_advised(member))
    }

    pub fn is_advice(&self, member: &Member) -> bool {
        self.stores().iter().any(|index| index.is_advice(member))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{Advice, Definition, DefinitionOrigin};
    use crate::persistence::MemoryStateStore;
    use crate::reference::BeanResolver;
    use crate::types::BeanRef;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn registry() -> ReferenceRegistry {
        Registry::new("test", Box::new(MemoryStateStore::new()))
    }

    fn counter(registry: &ReferenceRegistry) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        registry.add_listener(Arc::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        count
    }

    fn reference(def_file: &str, target_file: &str, bean: &str) -> Reference {
        let def = Arc::new(
            Definition::new(DefinitionOrigin::Xml, "com.acme.LoggingAspect", "log", def_file, Advice::Around)
                .with_aspect_name("LoggingAspect")
                .with_lines(10, 12),
        );
        Reference::new(def, Member::method("com.acme.Service", "doWork", target_file), target_file)
            .with_source(Member::method("com.acme.LoggingAspect", "log", "src/LoggingAspect.java"))
            .with_target_bean(bean, "beans.xml", 3)
    }

    mod structure_tests {
        use super::*;

        #[test]
        fn get_or_create_materializes_empty_unit_once() {
            let reg = registry();
            let count = counter(&reg);
            let unit = UnitId::new("fresh");

            let first = reg.get_or_create(&unit);
            assert!(first.is_empty());
            let second = reg.get_or_create(&unit);
            assert!(Arc::ptr_eq(&first, &second));
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }

        #[test]
        fn remove_absent_unit_is_silent() {
            let reg = registry();
            let count = counter(&reg);
            assert!(!reg.remove(&UnitId::new("ghost")));
            assert_eq!(count.load(Ordering::SeqCst), 0);

            reg.get_or_create(&UnitId::new("p"));
            assert!(reg.remove(&UnitId::new("p")));
            assert_eq!(count.load(Ordering::SeqCst), 2);
            assert!(!reg.contains(&UnitId::new("p")));
        }

        #[test]
        fn clear_notifies_once() {
            let reg = registry();
            reg.get_or_create(&UnitId::new("a"));
            reg.get_or_create(&UnitId::new("b"));
            let count = counter(&reg);
            reg.clear();
            reg.clear();
            assert_eq!(count.load(Ordering::SeqCst), 1);
            assert!(reg.units().is_empty());
        }

        #[test]
        fn removed_store_is_no_longer_current() {
            let reg = registry();
            let unit = UnitId::new("p");
            let store = reg.get_or_create(&unit);
            assert!(reg.is_current(&unit, &store));
            reg.remove(&unit);
            assert!(!reg.is_current(&unit, &store));
            let recreated = reg.get_or_create(&unit);
            assert!(!reg.is_current(&unit, &store));
            assert!(reg.is_current(&unit, &recreated));
        }

        #[test]
        fn retired_unit_stays_gone_until_revived() {
            let reg = registry();
            let unit = UnitId::new("closed");
            reg.get_or_create(&unit);
            assert!(reg.retire(&unit));
            assert!(reg.is_retired(&unit));
            assert!(reg.get_or_create_active(&unit).is_none());
            assert!(reg.commit_target(&unit, None).is_none());
            assert!(!reg.contains(&unit));

            assert!(reg.revive(&unit));
            let store = reg.get_or_create_active(&unit).unwrap();
            assert!(reg.is_current(&unit, &store));
        }

        #[test]
        fn commit_target_rejects_replaced_store() {
            let reg = registry();
            let unit = UnitId::new("p");
            let seen = reg.get_or_create(&unit);
            assert!(reg.commit_target(&unit, Some(&seen)).is_some());
            reg.remove(&unit);
            reg.get_or_create(&unit);
            assert!(reg.commit_target(&unit, Some(&seen)).is_none());
        }

        #[test]
        fn clear_forgets_retirements() {
            let reg = registry();
            let unit = UnitId::new("closed");
            reg.retire(&unit);
            reg.clear();
            assert!(!reg.is_retired(&unit));
        }

        #[test]
        fn concurrent_get_or_create_yields_one_store() {
            let reg = Arc::new(registry());
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let reg = Arc::clone(&reg);
                    thread::spawn(move || reg.get_or_create(&UnitId::new("shared")))
                })
                .collect();
            let stores: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            assert!(stores.iter().all(|s| Arc::ptr_eq(s, &stores[0])));
            assert_eq!(reg.units().len(), 1);
        }
    }

    mod listener_tests {
        use super::*;

        #[test]
        fn listeners_run_in_registration_order() {
            let reg = registry();
            let order = Arc::new(Mutex::new(Vec::new()));
            for i in 0..3 {
                let order = Arc::clone(&order);
                reg.add_listener(Arc::new(move || order.lock().push(i)));
            }
            reg.notify_changed();
            assert_eq!(*order.lock(), vec![0, 1, 2]);
        }

        #[test]
        fn panicking_listener_does_not_stop_siblings() {
            fn explode() {
                panic!("listener failure");
            }

            let reg = registry();
            reg.add_listener(Arc::new(explode));
            let count = counter(&reg);
            reg.notify_changed();
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }

        #[test]
        fn removed_listener_is_not_called() {
            let reg = registry();
            let count = Arc::new(AtomicUsize::new(0));
            let c = Arc::clone(&count);
            let id = reg.add_listener(Arc::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }));
            assert!(reg.remove_listener(id));
            assert!(!reg.remove_listener(id));
            reg.notify_changed();
            assert_eq!(count.load(Ordering::SeqCst), 0);
        }

        #[test]
        fn listener_may_query_registry() {
            let reg = Arc::new(registry());
            let seen = Arc::new(AtomicUsize::new(0));
            {
                let weak = Arc::downgrade(&reg);
                let seen = Arc::clone(&seen);
                reg.add_listener(Arc::new(move || {
                    if let Some(reg) = weak.upgrade() {
                        seen.store(reg.all_references_in_workspace().len(), Ordering::SeqCst);
                    }
                }));
            }
            reg.get_or_create(&UnitId::new("p"))
                .add(reference("aspects.xml", "src/Service.java", "serviceBean"));
            reg.notify_changed();
            assert_eq!(seen.load(Ordering::SeqCst), 1);
        }
    }

    mod query_tests {
        use super::*;

        struct Beans;

        impl BeanResolver for Beans {
            fn resolve(&self, bean_id: &str) -> Option<BeanRef> {
                Some(BeanRef::new(bean_id, "beans.xml", 3))
            }
        }

        #[test]
        fn touching_file_matches_four_criteria() {
            let reg = registry();
            let r = reference("aspects.xml", "src/Service.java", "serviceBean");
            r.resolve_bean(&Beans);
            reg.get_or_create(&UnitId::new("p")).add(r);

            for file in ["aspects.xml", "src/Service.java", "beans.xml", "src/LoggingAspect.java"] {
                assert_eq!(
                    reg.references_touching_file(&ArtifactPath::from(file)).len(),
                    1,
                    "expected a match for {file}"
                );
            }
            assert!(reg
                .references_touching_file(&ArtifactPath::from("other.xml"))
                .is_empty());
        }

        #[test]
        fn workspace_queries_span_units() {
            let reg = registry();
            reg.get_or_create(&UnitId::new("a"))
                .add(reference("a.xml", "src/Service.java", "serviceBean"));
            reg.get_or_create(&UnitId::new("b"))
                .add(reference("b.xml", "src/Service.java", "serviceBean"));

            assert_eq!(reg.all_references_in_workspace().len(), 2);
            let target = Member::method("com.acme.Service", "doWork", "src/Service.java");
            assert!(reg.is_advised(&target));
            assert!(reg.is_advice(&Member::method(
                "com.acme.LoggingAspect",
                "log",
                "src/LoggingAspect.java"
            )));
            assert!(!reg.is_advice(&target));
        }

        #[test]
        fn invalidate_notifies_only_when_something_changed() {
            let reg = registry();
            let unit = UnitId::new("p");
            reg.get_or_create(&unit)
                .add(reference("aspects.xml", "src/Service.java", "serviceBean"));
            let count = counter(&reg);

            assert_eq!(reg.invalidate(&unit, &ArtifactPath::from("other.xml")), 0);
            assert_eq!(reg.invalidate(&UnitId::new("ghost"), &ArtifactPath::from("aspects.xml")), 0);
            assert_eq!(count.load(Ordering::SeqCst), 0);

            assert_eq!(reg.invalidate(&unit, &ArtifactPath::from("aspects.xml")), 1);
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }
    }

    mod lifecycle_tests {
        use super::*;

        #[test]
        fn shutdown_saves_and_start_restores() {
            let store = Arc::new(MemoryStateStore::new());
            let reg: ReferenceRegistry = Registry::new("refs", Box::new(SharedStore(Arc::clone(&store))));
            reg.get_or_create(&UnitId::new("p"))
                .add(reference("aspects.xml", "src/Service.java", "serviceBean"));
            let before = reg.all_references_in_workspace();

            reg.shutdown();
            assert!(reg.units().is_empty());
            assert_eq!(store.saved().map(|s| s.units.len()), Some(1));

            reg.start();
            assert_eq!(reg.all_references_in_workspace(), before);
        }

        struct SharedStore<T>(Arc<MemoryStateStore<T>>);

        impl<T: Clone + Send> StateStore<T> for SharedStore<T> {
            fn load(&self) -> RegistryState<T> {
                self.0.load()
            }

            fn save(&self, state: &RegistryState<T>) -> crate::persistence::PersistResult<()> {
                self.0.save(state)
            }
        }
    }
}
