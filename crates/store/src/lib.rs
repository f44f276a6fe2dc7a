//! Annowatch store: the local cache mirroring watched objects, plus the
//! "initial listing done" sync state that gates workers.

#![forbid(unsafe_code)]

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use annowatch_core::{CachedObject, Delta, DeltaKind, ObjectLister, ResourceKey, SelectionPredicate};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::watch;
use tracing::debug;

mod sync;

pub use sync::{SyncState, SyncStatus, SyncWaiter};

type ObjectMap = FxHashMap<ResourceKey, Arc<CachedObject>>;

/// Outcome of applying one delta.
#[derive(Debug, Clone)]
pub enum Applied {
    Added(Arc<CachedObject>),
    Updated { old: Arc<CachedObject>, new: Arc<CachedObject> },
    Deleted(Arc<CachedObject>),
    /// Older version of a cached object, or a delete for a replaced one; ignored.
    Stale,
    /// Delete for a key the cache never held.
    Absent,
}

impl Applied {
    pub fn is_change(&self) -> bool { !matches!(self, Applied::Stale | Applied::Absent) }
}

/// Indexed, eventually-consistent mirror of server objects keyed by namespace/name.
///
/// The event source is the only writer; any number of workers read concurrently.
pub struct Cache {
    objects: RwLock<ObjectMap>,
    epoch_tx: watch::Sender<u64>,
}

impl Default for Cache {
    fn default() -> Self { Self::new() }
}

impl Cache {
    pub fn new() -> Self {
        let (epoch_tx, _) = watch::channel(0u64);
        Self { objects: RwLock::new(FxHashMap::default()), epoch_tx }
    }

    fn read(&self) -> RwLockReadGuard<'_, ObjectMap> { self.objects.read().unwrap_or_else(PoisonError::into_inner) }
    fn write(&self) -> RwLockWriteGuard<'_, ObjectMap> { self.objects.write().unwrap_or_else(PoisonError::into_inner) }

    pub fn get(&self, key: &ResourceKey) -> Option<Arc<CachedObject>> { self.read().get(key).cloned() }

    pub fn contains(&self, key: &ResourceKey) -> bool { self.read().contains_key(key) }

    pub fn len(&self) -> usize { self.read().len() }
    pub fn is_empty(&self) -> bool { self.read().is_empty() }

    pub fn keys(&self) -> Vec<ResourceKey> { self.read().keys().cloned().collect() }

    /// Objects matching `pred`, in no particular order, as of the call.
    pub fn list<P: SelectionPredicate + ?Sized>(&self, pred: &P) -> Vec<Arc<CachedObject>> {
        self.read().values().filter(|o| pred.matches(o)).cloned().collect()
    }

    /// Apply a single add/update/delete. Sole mutation path for watch events.
    pub fn apply(&self, delta: Delta) -> Applied {
        let (applied, len) = {
            let mut map = self.write();
            let applied = apply_locked(&mut map, delta);
            (applied, map.len())
        };
        if applied.is_change() {
            self.bump(len);
        }
        applied
    }

    /// Apply a full listing: upsert every listed object and drop every cached
    /// key the listing no longer contains.
    pub fn replace(&self, listing: Vec<CachedObject>) -> Vec<Applied> {
        let (changes, len) = {
            let mut map = self.write();
            let listed: FxHashSet<ResourceKey> = listing.iter().map(|o| o.key.clone()).collect();
            let mut changes: Vec<Applied> = listing
                .into_iter()
                .map(|o| apply_locked(&mut map, Delta::applied(o)))
                .filter(Applied::is_change)
                .collect();
            let gone: Vec<ResourceKey> = map.keys().filter(|k| !listed.contains(*k)).cloned().collect();
            for key in gone {
                if let Some(old) = map.remove(&key) {
                    changes.push(Applied::Deleted(old));
                }
            }
            (changes, map.len())
        };
        if !changes.is_empty() {
            self.bump(len);
        }
        changes
    }

    /// Monotonic mutation counter.
    pub fn epoch(&self) -> u64 { *self.epoch_tx.borrow() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }

    fn bump(&self, len: usize) {
        self.epoch_tx.send_modify(|e| *e = e.saturating_add(1));
        metrics::gauge!("cache_objects", len as f64);
    }
}

fn apply_locked(map: &mut ObjectMap, delta: Delta) -> Applied {
    let key = delta.object.key.clone();
    let current = map.get(&key).cloned();
    match delta.kind {
        DeltaKind::Applied => match current {
            Some(cur) if delta.object.is_older_than(&cur) => {
                debug!(key = %key, rv = ?delta.object.resource_version, cached_rv = ?cur.resource_version, "ignoring stale object");
                metrics::counter!("cache_stale_total", 1u64);
                Applied::Stale
            }
            Some(old) => {
                let new = Arc::new(delta.object);
                map.insert(key, Arc::clone(&new));
                Applied::Updated { old, new }
            }
            None => {
                let new = Arc::new(delta.object);
                map.insert(key, Arc::clone(&new));
                Applied::Added(new)
            }
        },
        DeltaKind::Deleted => match current {
            // a late delete for an object that has since been recreated under the same name
            Some(cur) if delta.object.uid.is_some() && cur.uid.is_some() && delta.object.uid != cur.uid => {
                debug!(key = %key, "ignoring delete for replaced object");
                Applied::Stale
            }
            Some(_) => match map.remove(&key) {
                Some(old) => Applied::Deleted(old),
                None => Applied::Absent,
            },
            None => Applied::Absent,
        },
    }
}

impl ObjectLister for Cache {
    fn get(&self, namespace: Option<&str>, name: &str) -> Option<Arc<CachedObject>> {
        Cache::get(self, &ResourceKey::new(namespace, name))
    }

    fn list(&self, namespace: Option<&str>) -> Vec<Arc<CachedObject>> {
        let pred = |o: &CachedObject| namespace.map(|ns| o.namespace() == Some(ns)).unwrap_or(true);
        Cache::list(self, &pred)
    }
}
