use std::time::Duration;

use annowatch_core::ResourceKey;
use annowatch_queue::{BucketRateLimiter, ItemExponentialFailureRateLimiter, MaxOfRateLimiter};

pub const DEFAULT_ANNOTATION: &str = "controller-example/myannotation";
pub const DEFAULT_NAMESPACE: &str = "default";

/// Everything the controller needs to know that is not a collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Labels queue metrics and logs.
    pub queue_name: String,
    /// Only objects in this namespace are reconciled; `None` means all.
    pub namespace: Option<String>,
    /// Objects carrying this annotation key are selected.
    pub annotation_key: String,
    pub workers: usize,
    /// Retries after the first failure before a key is dropped.
    pub max_retries: u32,
    /// Give up waiting for the initial listing after this long.
    pub sync_timeout: Option<Duration>,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Overall retry budget shared by all keys.
    pub retry_qps: f64,
    pub retry_burst: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            queue_name: "deploymentlister".to_string(),
            namespace: Some(DEFAULT_NAMESPACE.to_string()),
            annotation_key: DEFAULT_ANNOTATION.to_string(),
            workers: 2,
            max_retries: 5,
            sync_timeout: None,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
            retry_qps: 10.0,
            retry_burst: 100,
        }
    }
}

impl ControllerConfig {
    pub(crate) fn rate_limiter(&self) -> MaxOfRateLimiter<ResourceKey> {
        MaxOfRateLimiter::new(vec![
            Box::new(ItemExponentialFailureRateLimiter::new(self.backoff_base, self.backoff_max)),
            Box::new(BucketRateLimiter::new(self.retry_qps, self.retry_burst)),
        ])
    }
}
