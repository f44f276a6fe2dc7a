//! Rate limiters deciding how long a failed key waits before it is re-queued.

use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::Instant;

pub trait RateLimiter<K>: Send + Sync {
    /// Delay before `key` may be processed again. Records one more failure.
    fn when(&self, key: &K) -> Duration;
    /// Stop tracking `key` (it succeeded or was given up on).
    fn forget(&self, key: &K);
    /// Failures recorded for `key` since the last `forget`.
    fn num_requeues(&self, key: &K) -> u32;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(PoisonError::into_inner) }

/// `base * 2^failures`, capped at `max`.
pub fn exponential_backoff(base: Duration, max: Duration, failures: u32) -> Duration {
    let nanos = base.as_nanos() as f64 * 2f64.powi(failures.min(1024) as i32);
    if !nanos.is_finite() || nanos >= max.as_nanos() as f64 {
        max
    } else {
        Duration::from_nanos(nanos as u64)
    }
}

/// Per-key exponential backoff on consecutive failures.
pub struct ItemExponentialFailureRateLimiter<K> {
    base: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<K, u32>>,
}

impl<K> ItemExponentialFailureRateLimiter<K> {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max: max.max(base), failures: Mutex::new(FxHashMap::default()) }
    }
}

impl<K: Clone + Eq + Hash + Send> RateLimiter<K> for ItemExponentialFailureRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        let mut failures = lock(&self.failures);
        let n = failures.entry(key.clone()).or_insert(0);
        let exp = *n;
        *n = n.saturating_add(1);
        exponential_backoff(self.base, self.max, exp)
    }

    fn forget(&self, key: &K) { lock(&self.failures).remove(key); }

    fn num_requeues(&self, key: &K) -> u32 { lock(&self.failures).get(key).copied().unwrap_or(0) }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token bucket shared by every key: bounds the overall retry rate.
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self { qps: qps.max(f64::MIN_POSITIVE), burst, bucket: Mutex::new(Bucket { tokens: burst, last: Instant::now() }) }
    }
}

impl<K> RateLimiter<K> for BucketRateLimiter {
    fn when(&self, _key: &K) -> Duration {
        let mut b = lock(&self.bucket);
        let now = Instant::now();
        let refill = now.saturating_duration_since(b.last).as_secs_f64() * self.qps;
        b.tokens = (b.tokens + refill).min(self.burst) - 1.0;
        b.last = now;
        if b.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-b.tokens / self.qps)
        }
    }

    fn forget(&self, _key: &K) {}

    fn num_requeues(&self, _key: &K) -> u32 { 0 }
}

/// Longest delay among its members.
pub struct MaxOfRateLimiter<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOfRateLimiter<K> {
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self { Self { limiters } }
}

impl<K> RateLimiter<K> for MaxOfRateLimiter<K> {
    fn when(&self, key: &K) -> Duration {
        self.limiters.iter().map(|l| l.when(key)).max().unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &K) {
        for l in &self.limiters {
            l.forget(key);
        }
    }

    fn num_requeues(&self, key: &K) -> u32 { self.limiters.iter().map(|l| l.num_requeues(key)).max().unwrap_or(0) }
}

/// Per-key exponential backoff (5ms .. 1000s) combined with an overall
/// 10 qps / burst 100 bucket.
pub fn default_controller_rate_limiter<K>() -> MaxOfRateLimiter<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialFailureRateLimiter::new(Duration::from_millis(5), Duration::from_secs(1000))),
        Box::new(BucketRateLimiter::new(10.0, 100)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_then_caps() {
        let rl = ItemExponentialFailureRateLimiter::<String>::new(Duration::from_millis(10), Duration::from_millis(50));
        let key = "default/foo".to_string();
        let delays: Vec<u128> = (0..5).map(|_| rl.when(&key).as_millis()).collect();
        assert_eq!(delays, vec![10, 20, 40, 50, 50]);
        assert_eq!(rl.num_requeues(&key), 5);
    }

    #[test]
    fn forget_resets_failures() {
        let rl = ItemExponentialFailureRateLimiter::<String>::new(Duration::from_millis(10), Duration::from_secs(1));
        let key = "default/foo".to_string();
        rl.when(&key);
        rl.when(&key);
        rl.forget(&key);
        assert_eq!(rl.num_requeues(&key), 0);
        assert_eq!(rl.when(&key), Duration::from_millis(10));
    }

    #[test]
    fn keys_back_off_independently() {
        let rl = ItemExponentialFailureRateLimiter::<String>::new(Duration::from_millis(1), Duration::from_secs(1));
        let a = "a".to_string();
        let b = "b".to_string();
        rl.when(&a);
        rl.when(&a);
        assert_eq!(rl.when(&b), Duration::from_millis(1));
        assert_eq!(rl.num_requeues(&a), 2);
    }

    #[test]
    fn huge_failure_counts_saturate_at_max() {
        assert_eq!(exponential_backoff(Duration::from_millis(5), Duration::from_secs(1000), 5000), Duration::from_secs(1000));
        assert_eq!(exponential_backoff(Duration::from_millis(5), Duration::from_secs(1000), 0), Duration::from_millis(5));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_allows_burst_then_spaces_out() {
        let rl = BucketRateLimiter::new(10.0, 2);
        let key = ();
        assert_eq!(RateLimiter::<()>::when(&rl, &key), Duration::ZERO);
        assert_eq!(RateLimiter::<()>::when(&rl, &key), Duration::ZERO);
        let third = RateLimiter::<()>::when(&rl, &key);
        assert!(third > Duration::from_millis(99) && third <= Duration::from_millis(101), "got {:?}", third);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(RateLimiter::<()>::when(&rl, &key), Duration::ZERO);
    }

    #[test]
    fn max_of_takes_longest_and_forgets_all() {
        let rl: MaxOfRateLimiter<String> = MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(Duration::from_millis(1), Duration::from_secs(1))),
            Box::new(ItemExponentialFailureRateLimiter::new(Duration::from_millis(3), Duration::from_secs(1))),
        ]);
        let key = "k".to_string();
        assert_eq!(rl.when(&key), Duration::from_millis(3));
        assert_eq!(rl.when(&key), Duration::from_millis(6));
        assert_eq!(rl.num_requeues(&key), 2);
        rl.forget(&key);
        assert_eq!(rl.num_requeues(&key), 0);
    }
}
