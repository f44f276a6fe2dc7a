//! Startup and shutdown coordination: wait for the cache, run a fixed pool of
//! workers, drain them, and keep the event source running alongside.

use std::future::Future;
use std::time::Duration;

use annowatch_kubehub::Informer;
use annowatch_store::SyncWaiter;
use futures::Stream;
use kube::core::DynamicObject;
use kube::runtime::watcher;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{Controller, ControllerError};

/// Block until the cache has completed its first listing, `stop` fires, or
/// `timeout` (if any) elapses.
pub async fn wait_for_cache_sync(
    mut waiter: SyncWaiter,
    stop: &CancellationToken,
    timeout: Option<Duration>,
) -> Result<(), ControllerError> {
    let synced = match timeout {
        Some(t) => match tokio::time::timeout(t, waiter.wait(stop)).await {
            Ok(synced) => synced,
            Err(_) => return Err(ControllerError::SyncTimeout(t)),
        },
        None => waiter.wait(stop).await,
    };
    match (synced, stop.is_cancelled()) {
        (true, _) => Ok(()),
        (false, true) => Err(ControllerError::SyncAborted),
        (false, false) => Err(ControllerError::SourceClosed),
    }
}

/// Fixed set of worker tasks that are only ever drained as a whole.
#[derive(Default)]
pub struct WorkerPool {
    set: JoinSet<usize>,
}

impl WorkerPool {
    pub fn new() -> Self { Self::default() }

    pub fn spawn<F>(&mut self, id: usize, worker: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.set.spawn(async move {
            worker.await;
            id
        });
    }

    pub fn len(&self) -> usize { self.set.len() }
    pub fn is_empty(&self) -> bool { self.set.is_empty() }

    /// Wait for every worker to exit. A panicking worker is logged, not propagated.
    pub async fn drain(mut self) {
        while let Some(res) = self.set.join_next().await {
            match res {
                Ok(id) => debug!(worker = id, "worker exited"),
                Err(e) if e.is_panic() => error!(error = %e, "worker panicked"),
                Err(e) => warn!(error = %e, "worker cancelled"),
            }
        }
    }
}

/// Run the informer on `stream` as a background task and the controller in
/// the foreground until `stop` fires; then stop the informer and wait for it.
pub async fn run_with_source<S>(
    informer: Informer,
    stream: S,
    controller: &Controller,
    stop: CancellationToken,
) -> Result<(), ControllerError>
where
    S: Stream<Item = Result<watcher::Event<DynamicObject>, watcher::Error>> + Send + 'static,
{
    let source_stop = stop.child_token();
    let source = tokio::spawn(informer.run(stream, source_stop.clone()));
    let result = controller.run(stop).await;
    source_stop.cancel();
    if let Err(e) = source.await {
        error!(error = %e, "event source task failed");
    }
    info!("event source stopped");
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use annowatch_store::SyncState;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn sync_wait_reports_stop() {
        let state = SyncState::new();
        let stop = CancellationToken::new();
        stop.cancel();
        let res = wait_for_cache_sync(state.waiter(), &stop, None).await;
        assert!(matches!(res, Err(ControllerError::SyncAborted)));
    }

    #[tokio::test(start_paused = true)]
    async fn sync_wait_times_out() {
        let state = SyncState::new();
        let res = wait_for_cache_sync(state.waiter(), &CancellationToken::new(), Some(Duration::from_secs(3))).await;
        assert!(matches!(res, Err(ControllerError::SyncTimeout(_))));
    }

    #[tokio::test]
    async fn sync_wait_reports_closed_source() {
        let state = SyncState::new();
        let waiter = state.waiter();
        drop(state);
        let res = wait_for_cache_sync(waiter, &CancellationToken::new(), None).await;
        assert!(matches!(res, Err(ControllerError::SourceClosed)));
    }

    #[tokio::test]
    async fn sync_wait_passes_once_synced() {
        let state = SyncState::new();
        state.mark_synced();
        assert!(wait_for_cache_sync(state.waiter(), &CancellationToken::new(), None).await.is_ok());
    }

    #[tokio::test]
    async fn pool_drains_all_workers_even_if_one_panics() {
        let finished = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new();
        for id in 0..3 {
            let finished = Arc::clone(&finished);
            pool.spawn(id, async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.spawn(3, async { panic!("worker blew up") });
        assert_eq!(pool.len(), 4);
        pool.drain().await;
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }
}
