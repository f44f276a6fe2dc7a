//! Side effects run for selected objects.

use std::sync::Arc;

use annowatch_core::CachedObject;
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Recoverable; the key is retried with backoff.
    #[error("transient: {0}")]
    Transient(String),
    #[error("reconciler panicked")]
    Panicked,
}

/// Follow-up action for an object the predicate selected. Must be idempotent:
/// the same object may be handed over again after retries, resyncs or relists.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, obj: Arc<CachedObject>) -> Result<(), ReconcileError>;
}

/// Logs every selected object.
pub struct LogMatch {
    annotation_key: String,
}

impl LogMatch {
    pub fn new(annotation_key: impl Into<String>) -> Self { Self { annotation_key: annotation_key.into() } }
}

#[async_trait::async_trait]
impl Reconciler for LogMatch {
    async fn reconcile(&self, obj: Arc<CachedObject>) -> Result<(), ReconcileError> {
        info!(
            key = %obj.key,
            annotation = %self.annotation_key,
            value = ?obj.annotation(&self.annotation_key),
            rv = ?obj.resource_version,
            "seen annotation"
        );
        Ok(())
    }
}
