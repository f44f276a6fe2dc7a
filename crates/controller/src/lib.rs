//! Annowatch controller: re-reads objects from the local cache for every
//! queued key, applies the selection predicate and runs the reconciler.

#![forbid(unsafe_code)]

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use annowatch_core::{CachedObject, HasAnnotation, InNamespace, ObjectLister, ResourceEventHandler, ResourceKey, SelectionPredicate};
use annowatch_queue::WorkQueue;
use annowatch_store::{Cache, SyncWaiter};
use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

mod config;
mod handler;
pub mod lifecycle;
mod reconciler;

pub use config::{ControllerConfig, DEFAULT_ANNOTATION, DEFAULT_NAMESPACE};
pub use handler::EnqueueHandler;
pub use lifecycle::{run_with_source, wait_for_cache_sync, WorkerPool};
pub use reconciler::{LogMatch, ReconcileError, Reconciler};

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("stopped before the cache synced")]
    SyncAborted,
    #[error("cache did not sync within {0:?}")]
    SyncTimeout(Duration),
    #[error("event source went away before the cache synced")]
    SourceClosed,
}

pub struct Controller {
    config: ControllerConfig,
    cache: Arc<Cache>,
    sync: SyncWaiter,
    queue: WorkQueue<ResourceKey>,
    predicate: Arc<dyn SelectionPredicate>,
    reconciler: Arc<dyn Reconciler>,
}

impl Controller {
    pub fn new(config: ControllerConfig, cache: Arc<Cache>, sync: SyncWaiter, reconciler: Arc<dyn Reconciler>) -> Self {
        let queue = WorkQueue::new(config.queue_name.clone(), config.rate_limiter());
        let predicate: Arc<dyn SelectionPredicate> = Arc::new(HasAnnotation::new(config.annotation_key.clone()));
        Self { config, cache, sync, queue, predicate, reconciler }
    }

    /// Replace the default "annotation present" predicate.
    pub fn with_predicate(mut self, predicate: Arc<dyn SelectionPredicate>) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn config(&self) -> &ControllerConfig { &self.config }
    pub fn queue(&self) -> &WorkQueue<ResourceKey> { &self.queue }

    fn scope(&self) -> InNamespace { InNamespace(self.config.namespace.clone()) }

    /// Handler to register with the event source.
    pub fn event_handler(&self) -> Arc<dyn ResourceEventHandler> {
        Arc::new(EnqueueHandler::new(self.queue.clone(), self.scope()))
    }

    /// Cached objects in scope that the predicate currently selects.
    pub fn selected(&self) -> Vec<Arc<CachedObject>> {
        ObjectLister::list(self.cache.as_ref(), self.config.namespace.as_deref())
            .into_iter()
            .filter(|o| self.predicate.matches(o))
            .collect()
    }

    fn worker(&self, id: usize) -> Worker {
        Worker {
            id,
            queue: self.queue.clone(),
            cache: Arc::clone(&self.cache),
            scope: self.scope(),
            predicate: Arc::clone(&self.predicate),
            reconciler: Arc::clone(&self.reconciler),
            max_retries: self.config.max_retries,
        }
    }

    /// Wait for the cache, serve keys with the worker pool until `stop` fires,
    /// then shut the queue down and wait for every worker to exit.
    pub async fn run(&self, stop: CancellationToken) -> Result<(), ControllerError> {
        info!(ns = ?self.config.namespace, annotation = %self.config.annotation_key, "waiting for cache sync");
        if let Err(e) = wait_for_cache_sync(self.sync.clone(), &stop, self.config.sync_timeout).await {
            warn!(error = %e, "not starting workers");
            self.queue.shut_down();
            return Err(e);
        }
        info!(cached = self.cache.len(), "caches are synced");

        let workers = self.config.workers.max(1);
        let mut pool = WorkerPool::new();
        for id in 0..workers {
            pool.spawn(id, self.worker(id).run());
        }
        info!(workers, "waiting for stop signal");
        stop.cancelled().await;
        info!("received stop signal");

        self.queue.shut_down();
        info!("shutting down workers");
        pool.drain().await;
        info!("workers are all done");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Gone,
    OutOfScope,
    NotSelected,
    Reconciled,
}

impl Outcome {
    fn label(self) -> &'static str {
        match self {
            Outcome::Gone => "gone",
            Outcome::OutOfScope => "out_of_scope",
            Outcome::NotSelected => "not_selected",
            Outcome::Reconciled => "reconciled",
        }
    }
}

struct Worker {
    id: usize,
    queue: WorkQueue<ResourceKey>,
    cache: Arc<Cache>,
    scope: InNamespace,
    predicate: Arc<dyn SelectionPredicate>,
    reconciler: Arc<dyn Reconciler>,
    max_retries: u32,
}

impl Worker {
    async fn run(self) {
        debug!(worker = self.id, "worker started");
        while let Some(key) = self.queue.get().await {
            self.process(key).await;
        }
        debug!(worker = self.id, "queue shut down; worker exiting");
    }

    async fn process(&self, key: ResourceKey) {
        let started = Instant::now();
        match self.reconcile_key(&key).await {
            Ok(outcome) => {
                debug!(worker = self.id, key = %key, outcome = outcome.label(), "processed");
                metrics::counter!("controller_reconciles_total", 1u64, "outcome" => outcome.label());
                self.queue.forget(&key);
            }
            Err(e) => {
                metrics::counter!("controller_reconciles_total", 1u64, "outcome" => "error");
                self.retry_or_drop(&key, e);
            }
        }
        metrics::histogram!("controller_reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);
        self.queue.done(&key);
    }

    /// Current state comes from the cache, never from the event that queued the key.
    async fn reconcile_key(&self, key: &ResourceKey) -> Result<Outcome, ReconcileError> {
        let Some(obj) = self.cache.get(key) else {
            return Ok(Outcome::Gone);
        };
        if !self.scope.matches(&obj) {
            return Ok(Outcome::OutOfScope);
        }
        if !self.predicate.matches(&obj) {
            return Ok(Outcome::NotSelected);
        }
        match AssertUnwindSafe(self.reconciler.reconcile(obj)).catch_unwind().await {
            Ok(Ok(())) => Ok(Outcome::Reconciled),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(ReconcileError::Panicked),
        }
    }

    fn retry_or_drop(&self, key: &ResourceKey, err: ReconcileError) {
        let retries = self.queue.num_requeues(key);
        if retries < self.max_retries {
            warn!(worker = self.id, key = %key, attempt = retries + 1, error = %err, "reconcile failed; retrying");
            self.queue.add_rate_limited(key.clone());
        } else {
            error!(worker = self.id, key = %key, retries, error = %err, "reconcile kept failing; dropping key");
            metrics::counter!("controller_dropped_total", 1u64);
            self.queue.forget(key);
        }
    }
}
