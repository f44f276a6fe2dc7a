//! Annowatch work queue: a deduplicating FIFO of keys with per-key retry
//! backoff and cooperative shutdown.
//!
//! A key is in at most one of three places: queued, processing, or nowhere.
//! Adding a key that is already queued is a no-op. Adding a key that is being
//! processed marks it dirty, and `done` puts it back in the queue, so a change
//! that lands mid-processing is never lost and never processed concurrently.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

mod rate_limit;

pub use rate_limit::{
    default_controller_rate_limiter, exponential_backoff, BucketRateLimiter, ItemExponentialFailureRateLimiter,
    MaxOfRateLimiter, RateLimiter,
};

/// Anything usable as a queue key.
pub trait QueueKey: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static {}

impl<T> QueueKey for T where T: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static {}

struct State<K> {
    queue: VecDeque<K>,
    /// Keys that need processing: everything queued plus keys re-added while processing.
    dirty: FxHashSet<K>,
    /// Keys handed out by `get` and not yet `done`, with the time they were handed out.
    processing: FxHashMap<K, Instant>,
    added_at: FxHashMap<K, Instant>,
    shutting_down: bool,
}

struct Inner<K> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
    shutdown: CancellationToken,
    limiter: Box<dyn RateLimiter<K>>,
}

/// Cheap to clone; all clones share one queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self { Self { inner: Arc::clone(&self.inner) } }
}

impl<K: QueueKey> WorkQueue<K> {
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<K> + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: FxHashSet::default(),
                    processing: FxHashMap::default(),
                    added_at: FxHashMap::default(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                shutdown: CancellationToken::new(),
                limiter: Box::new(limiter),
            }),
        }
    }

    pub fn with_default_rate_limiter(name: impl Into<String>) -> Self {
        Self::new(name, default_controller_rate_limiter())
    }

    pub fn name(&self) -> &str { &self.inner.name }

    fn lock(&self) -> MutexGuard<'_, State<K>> { self.inner.state.lock().unwrap_or_else(PoisonError::into_inner) }

    fn record_depth(&self, depth: usize) {
        metrics::gauge!("workqueue_depth", depth as f64, "queue" => self.inner.name.clone());
    }

    /// Mark `key` as needing processing.
    pub fn add(&self, key: K) {
        let mut st = self.lock();
        if st.shutting_down {
            debug!(queue = %self.inner.name, key = %key, "queue shutting down; add ignored");
            return;
        }
        if !st.dirty.insert(key.clone()) {
            return;
        }
        metrics::counter!("workqueue_adds_total", 1u64, "queue" => self.inner.name.clone());
        if st.processing.contains_key(&key) {
            debug!(queue = %self.inner.name, key = %key, "key busy; will re-queue when done");
            return;
        }
        st.added_at.insert(key.clone(), Instant::now());
        st.queue.push_back(key);
        let depth = st.queue.len();
        drop(st);
        self.record_depth(depth);
        self.inner.notify.notify_one();
    }

    /// Wait for the next key. `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut st = self.lock();
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    let now = Instant::now();
                    st.processing.insert(key.clone(), now);
                    if let Some(added) = st.added_at.remove(&key) {
                        metrics::histogram!("workqueue_queue_duration_ms", now.saturating_duration_since(added).as_secs_f64() * 1000.0, "queue" => self.inner.name.clone());
                    }
                    let depth = st.queue.len();
                    drop(st);
                    self.record_depth(depth);
                    if depth > 0 {
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
                if st.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Finish processing `key`; re-queues it if it was added meanwhile.
    pub fn done(&self, key: &K) {
        let mut st = self.lock();
        if let Some(started) = st.processing.remove(key) {
            metrics::histogram!("workqueue_work_duration_ms", started.elapsed().as_secs_f64() * 1000.0, "queue" => self.inner.name.clone());
        }
        if st.dirty.contains(key) {
            st.added_at.insert(key.clone(), Instant::now());
            st.queue.push_back(key.clone());
            let depth = st.queue.len();
            drop(st);
            self.record_depth(depth);
            self.inner.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has elapsed. Needs a tokio runtime; pending
    /// timers are dropped on shutdown.
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let queue = self.clone();
        let stop = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(key),
            }
        });
    }

    /// Re-queue `key` after the rate limiter's backoff for it.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.inner.limiter.when(&key);
        metrics::counter!("workqueue_retries_total", 1u64, "queue" => self.inner.name.clone());
        debug!(queue = %self.inner.name, key = %key, delay_ms = delay.as_millis() as u64, "requeue with backoff");
        self.add_after(key, delay);
    }

    /// Clear the failure history of `key`.
    pub fn forget(&self, key: &K) { self.inner.limiter.forget(key); }

    pub fn num_requeues(&self, key: &K) -> u32 { self.inner.limiter.num_requeues(key) }

    /// Stop accepting keys and wake every waiting `get`. Keys already queued
    /// are still handed out. Idempotent.
    pub fn shut_down(&self) {
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        st.shutting_down = true;
        let remaining = st.queue.len();
        drop(st);
        info!(queue = %self.inner.name, remaining, "shutting down queue");
        self.inner.shutdown.cancel();
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    /// Number of queued keys (excludes keys being processed).
    pub fn len(&self) -> usize { self.lock().queue.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn is_processing(&self, key: &K) -> bool { self.lock().processing.contains_key(key) }

    pub fn is_queued(&self, key: &K) -> bool { self.lock().queue.contains(key) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> WorkQueue<String> {
        WorkQueue::new("test", ItemExponentialFailureRateLimiter::new(Duration::from_millis(10), Duration::from_secs(1)))
    }

    #[tokio::test]
    async fn repeated_adds_collapse() {
        let q = queue();
        for _ in 0..5 {
            q.add("default/foo".to_string());
        }
        q.add("default/bar".to_string());
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await.as_deref(), Some("default/foo"));
        assert_eq!(q.get().await.as_deref(), Some("default/bar"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn add_while_processing_is_deferred_until_done() {
        let q = queue();
        let key = "default/foo".to_string();
        q.add(key.clone());
        let got = q.get().await.unwrap();
        assert!(q.is_processing(&got));

        q.add(key.clone());
        q.add(key.clone());
        assert!(!q.is_queued(&key), "queued and processing must stay disjoint");
        assert_eq!(q.len(), 0);

        q.done(&got);
        assert!(!q.is_processing(&key));
        assert!(q.is_queued(&key));
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn done_without_readd_leaves_queue_empty() {
        let q = queue();
        q.add("k".to_string());
        let k = q.get().await.unwrap();
        q.done(&k);
        assert!(q.is_empty());
        assert!(!q.is_processing(&k));
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_getters() {
        let q = queue();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let q = q.clone();
            handles.push(tokio::spawn(async move { q.get().await }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.shut_down();
        q.shut_down();
        for h in handles {
            let got = tokio::time::timeout(Duration::from_secs(1), h).await.unwrap().unwrap();
            assert_eq!(got, None);
        }
    }

    #[tokio::test]
    async fn shutdown_drains_queued_keys_then_ends() {
        let q = queue();
        q.add("a".to_string());
        q.add("b".to_string());
        q.shut_down();
        q.add("c".to_string());
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
        assert_eq!(q.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_add_waits_for_backoff() {
        let q = queue();
        let key = "default/foo".to_string();
        let start = Instant::now();
        q.add_rate_limited(key.clone());
        assert!(q.is_empty());
        assert_eq!(q.get().await.as_deref(), Some("default/foo"));
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert_eq!(q.num_requeues(&key), 1);
        q.forget(&key);
        assert_eq!(q.num_requeues(&key), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_backoff_is_dropped_on_shutdown() {
        let q = queue();
        q.add_after("late".to_string(), Duration::from_secs(5));
        q.shut_down();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(q.is_empty());
        assert_eq!(q.get().await, None);
    }
}
