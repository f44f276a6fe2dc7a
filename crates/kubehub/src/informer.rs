//! Informer: applies watch events to the local cache, then tells the
//! registered handlers what changed.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use annowatch_core::{CachedObject, Delta, ResourceEventHandler};
use annowatch_store::{Applied, Cache, SyncState, SyncWaiter};
use futures::{Stream, StreamExt};
use kube::core::DynamicObject;
use kube::runtime::watcher::{self, Event};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cached_from;

pub struct Informer {
    name: String,
    cache: Arc<Cache>,
    sync: SyncState,
    handlers: Vec<Arc<dyn ResourceEventHandler>>,
    resync: Option<Duration>,
}

impl Informer {
    /// `name` only labels log lines (usually the GVK key).
    pub fn new(name: impl Into<String>, cache: Arc<Cache>) -> Self {
        Self { name: name.into(), cache, sync: SyncState::new(), handlers: Vec::new(), resync: None }
    }

    /// Re-deliver every cached object as an update each `period`. Zero disables.
    pub fn with_resync(mut self, period: Duration) -> Self {
        self.resync = if period.is_zero() { None } else { Some(period) };
        self
    }

    pub fn add_event_handler(&mut self, handler: Arc<dyn ResourceEventHandler>) { self.handlers.push(handler); }

    pub fn cache(&self) -> Arc<Cache> { Arc::clone(&self.cache) }

    pub fn sync_waiter(&self) -> SyncWaiter { self.sync.waiter() }

    pub fn has_synced(&self) -> bool { self.sync.status().synced }

    /// Consume the watch stream until it ends or `stop` fires. Errors never
    /// leave this loop: they are logged and the stream keeps going.
    pub async fn run<S>(self, stream: S, stop: CancellationToken)
    where
        S: Stream<Item = Result<Event<DynamicObject>, watcher::Error>> + Send,
    {
        futures::pin_mut!(stream);
        let mut resync = self.resync.map(|p| {
            let mut iv = tokio::time::interval_at(Instant::now() + p, p);
            iv.set_missed_tick_behavior(MissedTickBehavior::Delay);
            iv
        });
        info!(resource = %self.name, resync_secs = ?self.resync.map(|p| p.as_secs()), "informer started");
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    info!(resource = %self.name, "informer stopping");
                    break;
                }
                next = stream.next() => match next {
                    Some(Ok(ev)) => self.handle_event(ev),
                    Some(Err(e)) => {
                        metrics::counter!("informer_watch_errors_total", 1u64);
                        warn!(resource = %self.name, error = %e, "watch error; stream will retry");
                    }
                    None => {
                        warn!(resource = %self.name, "watch stream ended");
                        break;
                    }
                },
                _ = tick(&mut resync) => self.resync_all(),
            }
        }
    }

    pub fn handle_event(&self, ev: Event<DynamicObject>) {
        match ev {
            Event::Applied(o) => match cached_from(&o) {
                Ok(obj) => {
                    let applied = self.cache.apply(Delta::applied(obj));
                    self.dispatch(applied);
                }
                Err(e) => warn!(resource = %self.name, error = ?e, "skipping unreadable object"),
            },
            Event::Deleted(o) => match cached_from(&o) {
                Ok(obj) => {
                    let applied = self.cache.apply(Delta::deleted(obj));
                    self.dispatch(applied);
                }
                Err(e) => warn!(resource = %self.name, error = ?e, "skipping unreadable delete"),
            },
            Event::Restarted(list) => {
                let listed = list.len();
                let objs: Vec<CachedObject> = list
                    .iter()
                    .filter_map(|o| match cached_from(o) {
                        Ok(obj) => Some(obj),
                        Err(e) => {
                            warn!(resource = %self.name, error = ?e, "skipping unreadable object in listing");
                            None
                        }
                    })
                    .collect();
                let changes = self.cache.replace(objs);
                let changed = changes.len();
                for c in changes {
                    self.dispatch(c);
                }
                let status = self.sync.mark_synced();
                info!(resource = %self.name, listed, changed, cached = self.cache.len(), generation = status.generation, "full listing applied");
            }
        }
    }

    fn dispatch(&self, applied: Applied) {
        match applied {
            Applied::Added(obj) => {
                info!(resource = %self.name, key = %obj.key, "object added");
                metrics::counter!("informer_events_total", 1u64, "type" => "add");
                self.each_handler("add", |h| h.on_add(&obj));
            }
            Applied::Updated { old, new } => {
                info!(resource = %self.name, key = %new.key, rv = ?new.resource_version, "object updated");
                metrics::counter!("informer_events_total", 1u64, "type" => "update");
                self.each_handler("update", |h| h.on_update(&old, &new));
            }
            Applied::Deleted(obj) => {
                info!(resource = %self.name, key = %obj.key, "object deleted");
                metrics::counter!("informer_events_total", 1u64, "type" => "delete");
                self.each_handler("delete", |h| h.on_delete(&obj));
            }
            Applied::Stale => {
                metrics::counter!("informer_stale_total", 1u64);
            }
            Applied::Absent => debug!(resource = %self.name, "delete for unknown object"),
        }
    }

    fn each_handler(&self, what: &'static str, f: impl Fn(&dyn ResourceEventHandler)) {
        for h in &self.handlers {
            if catch_unwind(AssertUnwindSafe(|| f(h.as_ref()))).is_err() {
                error!(resource = %self.name, event = what, "event handler panicked; continuing");
            }
        }
    }

    fn resync_all(&self) {
        let all = self.cache.list(&|_: &CachedObject| true);
        debug!(resource = %self.name, objects = all.len(), "periodic resync");
        for obj in all {
            self.each_handler("resync", |h| h.on_update(&obj, &obj));
        }
    }
}

async fn tick(iv: &mut Option<Interval>) {
    match iv {
        Some(iv) => {
            iv.tick().await;
        }
        None => futures::future::pending::<()>().await,
    }
}
