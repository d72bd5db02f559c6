//! Keyed in-memory stores with event fan-out.
//!
//! A [`Store`] holds the current known set of entities behind a read-write
//! lock and notifies registered handlers on every add, update, and delete.
//! Handlers run synchronously on the mutating task and must not block on
//! remote I/O; they hand keys to downstream fetcher queues instead.

pub mod reflector;

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use forage_model::JobRun;
use parking_lot::RwLock;

pub use reflector::{MissingAction, Reflector, ReflectorConfig};

/// An entity with a stable identity and a change clock.
pub trait Keyed: Send + Sync + 'static {
    type Key: Eq + Hash + Ord + Clone + Debug + Send + Sync + 'static;

    fn key(&self) -> Self::Key;

    /// The authoritative change timestamp used for watch ordering.
    fn last_changed(&self) -> DateTime<Utc>;

    /// Creation time when the source reports one; used to distinguish
    /// adds from modifications in watch streams.
    fn created(&self) -> Option<DateTime<Utc>> {
        None
    }
}

impl Keyed for forage_model::Bug {
    type Key = u32;

    fn key(&self) -> u32 {
        self.id
    }

    fn last_changed(&self) -> DateTime<Utc> {
        self.last_changed_at
    }

    fn created(&self) -> Option<DateTime<Utc>> {
        Some(self.created_at)
    }
}

impl Keyed for forage_model::JobRun {
    type Key = forage_model::JobKey;

    fn key(&self) -> forage_model::JobKey {
        JobRun::key(self)
    }

    fn last_changed(&self) -> DateTime<Utc> {
        self.completion_time
            .or(self.start_time)
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}

/// A store mutation visible to handlers. Entities are shared immutable
/// snapshots; handlers may keep the `Arc`s beyond the call.
#[derive(Debug, Clone)]
pub enum StoreEvent<V> {
    Added(Arc<V>),
    Updated { old: Arc<V>, new: Arc<V> },
    Deleted(Arc<V>),
}

type Handler<V> = Box<dyn Fn(&StoreEvent<V>) + Send + Sync>;

/// Keyed entity store with synchronous event fan-out.
pub struct Store<V: Keyed> {
    entries: RwLock<HashMap<V::Key, Arc<V>>>,
    handlers: RwLock<Vec<Handler<V>>>,
    synced: AtomicBool,
}

impl<V: Keyed> Debug for Store<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("len", &self.entries.read().len())
            .field("synced", &self.synced.load(Ordering::Relaxed))
            .finish()
    }
}

impl<V: Keyed> Default for Store<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Keyed> Store<V> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            handlers: RwLock::new(Vec::new()),
            synced: AtomicBool::new(false),
        }
    }

    pub fn get(&self, key: &V::Key) -> Option<Arc<V>> {
        self.entries.read().get(key).cloned()
    }

    pub fn list<F: Fn(&V) -> bool>(&self, predicate: F) -> Vec<Arc<V>> {
        self.entries
            .read()
            .values()
            .filter(|v| predicate(v))
            .cloned()
            .collect()
    }

    pub fn keys(&self) -> Vec<V::Key> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// True once the initial relist has been applied.
    pub fn has_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub fn add_handler<F: Fn(&StoreEvent<V>) + Send + Sync + 'static>(&self, handler: F) {
        self.handlers.write().push(Box::new(handler));
    }

    fn dispatch(&self, event: StoreEvent<V>) {
        let handlers = self.handlers.read();
        for handler in handlers.iter() {
            handler(&event);
        }
    }

    /// Unconditionally insert, replacing any existing entry.
    pub fn insert(&self, value: V) {
        let key = value.key();
        let new = Arc::new(value);
        let old = self.entries.write().insert(key, Arc::clone(&new));
        match old {
            Some(old) => self.dispatch(StoreEvent::Updated { old, new }),
            None => self.dispatch(StoreEvent::Added(new)),
        }
    }

    /// Conditionally replace the entry for `key`. The closure observes the
    /// current value under the write lock and returns the replacement, or
    /// `None` to refuse the update. Returns whether a swap happened.
    pub fn merge<F>(&self, key: &V::Key, f: F) -> bool
    where
        F: FnOnce(Option<&V>) -> Option<V>,
    {
        let event;
        {
            let mut entries = self.entries.write();
            let current = entries.get(key).map(Arc::clone);
            match f(current.as_deref()) {
                Some(next) => {
                    let new = Arc::new(next);
                    entries.insert(new.key(), Arc::clone(&new));
                    event = match current {
                        Some(old) => StoreEvent::Updated { old, new },
                        None => StoreEvent::Added(new),
                    };
                }
                None => return false,
            }
        }
        self.dispatch(event);
        true
    }

    pub fn remove(&self, key: &V::Key) -> Option<Arc<V>> {
        let removed = self.entries.write().remove(key);
        if let Some(old) = &removed {
            self.dispatch(StoreEvent::Deleted(Arc::clone(old)));
        }
        removed
    }

    /// Record that the initial relist has been applied.
    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }

    /// Re-emit `Updated(existing, existing)` for every entity so
    /// downstream consumers reconcile idempotently.
    pub fn resync(&self) {
        let snapshot: Vec<Arc<V>> = self.entries.read().values().cloned().collect();
        for entry in snapshot {
            self.dispatch(StoreEvent::Updated {
                old: Arc::clone(&entry),
                new: entry,
            });
        }
    }
}
