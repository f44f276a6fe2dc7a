//! Sync state: whether the cache has seen at least one complete listing.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStatus {
    /// Flips to true after the first full listing and never reverts.
    pub synced: bool,
    /// Number of full listings applied so far (initial + relists).
    pub generation: u64,
}

/// Writer side, held by the event source.
pub struct SyncState {
    tx: watch::Sender<SyncStatus>,
}

impl Default for SyncState {
    fn default() -> Self { Self::new() }
}

impl SyncState {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(SyncStatus::default());
        Self { tx }
    }

    /// Record a completed full listing.
    pub fn mark_synced(&self) -> SyncStatus {
        self.tx.send_modify(|s| {
            if !s.synced {
                info!("initial listing complete; cache synced");
            }
            s.synced = true;
            s.generation = s.generation.saturating_add(1);
        });
        *self.tx.borrow()
    }

    pub fn status(&self) -> SyncStatus { *self.tx.borrow() }

    pub fn waiter(&self) -> SyncWaiter { SyncWaiter { rx: self.tx.subscribe() } }
}

/// Reader side, handed to whoever must wait for the cache.
#[derive(Clone)]
pub struct SyncWaiter {
    rx: watch::Receiver<SyncStatus>,
}

impl SyncWaiter {
    pub fn has_synced(&self) -> bool { self.rx.borrow().synced }
    pub fn status(&self) -> SyncStatus { *self.rx.borrow() }

    /// Resolve once the cache is synced. Returns false if `stop` fires first or
    /// the writer went away without ever syncing.
    pub async fn wait(&mut self, stop: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = stop.cancelled() => false,
            res = self.rx.wait_for(|s| s.synced) => res.is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn synced_never_reverts_and_counts_generations() {
        let state = SyncState::new();
        assert_eq!(state.status(), SyncStatus { synced: false, generation: 0 });
        assert_eq!(state.mark_synced(), SyncStatus { synced: true, generation: 1 });
        assert_eq!(state.mark_synced(), SyncStatus { synced: true, generation: 2 });
        assert!(state.waiter().has_synced());
    }

    #[tokio::test]
    async fn wait_resolves_after_mark() {
        let state = SyncState::new();
        let mut waiter = state.waiter();
        let stop = CancellationToken::new();
        let handle = tokio::spawn(async move { waiter.wait(&stop).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        state.mark_synced();
        assert!(tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn wait_aborts_on_stop() {
        let state = SyncState::new();
        let mut waiter = state.waiter();
        let stop = CancellationToken::new();
        stop.cancel();
        assert!(!waiter.wait(&stop).await);
    }

    #[tokio::test]
    async fn wait_fails_when_writer_dropped_unsynced() {
        let state = SyncState::new();
        let mut waiter = state.waiter();
        drop(state);
        assert!(!waiter.wait(&CancellationToken::new()).await);
    }
}
