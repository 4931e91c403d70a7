//! Memoized backend readiness.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use super::{QueueBackend, QueueName};

/// Decides whether the queue backend may be used for a call.
///
/// Initialization succeeds at most once; after a failure it is not retried
/// until `retry_interval` has passed.
pub struct BackendGate {
    backend: Option<Arc<dyn QueueBackend>>,
    retry_interval: Duration,
    last_attempt: Mutex<Option<Instant>>,
    ready: AtomicBool,
}

impl BackendGate {
    pub fn new(backend: Arc<dyn QueueBackend>, retry_interval: Duration) -> Self {
        Self {
            backend: Some(backend),
            retry_interval,
            last_attempt: Mutex::new(None),
            ready: AtomicBool::new(false),
        }
    }

    /// A gate with no backend; every call takes the direct path.
    pub fn disabled() -> Self {
        Self {
            backend: None,
            retry_interval: Duration::ZERO,
            last_attempt: Mutex::new(None),
            ready: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Whether initialization has succeeded. Never triggers initialization.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn backend(&self) -> Option<&Arc<dyn QueueBackend>> {
        self.backend.as_ref()
    }

    /// Initialize the backend if needed, respecting the retry interval.
    pub async fn ensure_ready(&self) -> bool {
        let Some(backend) = &self.backend else {
            return false;
        };
        if self.is_ready() {
            return true;
        }

        let mut last_attempt = self.last_attempt.lock().await;
        if self.is_ready() {
            return true;
        }
        let now = Instant::now();
        if let Some(at) = *last_attempt
            && now.duration_since(at) < self.retry_interval
        {
            return false;
        }
        *last_attempt = Some(now);

        match backend.ensure_ready().await {
            Ok(()) => {
                self.ready.store(true, Ordering::Release);
                info!(backend = backend.name(), "queue_backend_ready");
                true
            }
            Err(e) => {
                warn!(
                    backend = backend.name(),
                    error = %e,
                    retry_in_ms = self.retry_interval.as_millis() as u64,
                    "queue_backend_init_failed"
                );
                false
            }
        }
    }

    /// The backend, if it is ready and `queue` has at least one live consumer.
    pub async fn available(&self, queue: QueueName) -> Option<Arc<dyn QueueBackend>> {
        if !self.ensure_ready().await {
            return None;
        }
        let backend = self.backend.as_ref()?;
        match backend.consumer_count(queue).await {
            Ok(count) if count > 0 => Some(Arc::clone(backend)),
            Ok(_) => None,
            Err(e) => {
                warn!(queue = %queue, error = %e, "queue_consumer_probe_failed");
                None
            }
        }
    }
}
