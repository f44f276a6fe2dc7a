use std::sync::Arc;

use annowatch_core::{CachedObject, InNamespace, ResourceEventHandler, ResourceKey, SelectionPredicate};
use annowatch_queue::WorkQueue;
use tracing::debug;

/// Turns add/update notifications into queue keys. Deletes are terminal and
/// only logged.
pub struct EnqueueHandler {
    queue: WorkQueue<ResourceKey>,
    scope: InNamespace,
}

impl EnqueueHandler {
    pub fn new(queue: WorkQueue<ResourceKey>, scope: InNamespace) -> Self { Self { queue, scope } }

    fn enqueue(&self, obj: &CachedObject) {
        if self.scope.matches(obj) {
            self.queue.add(obj.key.clone());
        }
    }
}

impl ResourceEventHandler for EnqueueHandler {
    fn on_add(&self, obj: &Arc<CachedObject>) { self.enqueue(obj); }

    fn on_update(&self, _old: &Arc<CachedObject>, new: &Arc<CachedObject>) { self.enqueue(new); }

    fn on_delete(&self, obj: &Arc<CachedObject>) {
        debug!(key = %obj.key, "delete needs no reconciliation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use annowatch_queue::ItemExponentialFailureRateLimiter;
    use std::time::Duration;

    fn handler() -> (EnqueueHandler, WorkQueue<ResourceKey>) {
        let q = WorkQueue::new("t", ItemExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_secs(1)));
        (EnqueueHandler::new(q.clone(), InNamespace(Some("default".into()))), q)
    }

    fn obj(ns: &str, name: &str) -> Arc<CachedObject> { Arc::new(CachedObject::new(ResourceKey::namespaced(ns, name))) }

    #[test]
    fn add_and_update_enqueue_one_key() {
        let (h, q) = handler();
        let foo = obj("default", "foo");
        h.on_add(&foo);
        h.on_update(&foo, &foo);
        h.on_update(&foo, &foo);
        assert_eq!(q.len(), 1);
        assert!(q.is_queued(&ResourceKey::namespaced("default", "foo")));
    }

    #[test]
    fn delete_and_foreign_namespaces_enqueue_nothing() {
        let (h, q) = handler();
        h.on_delete(&obj("default", "foo"));
        h.on_add(&obj("prod", "bar"));
        assert!(q.is_empty());
    }
}
