//! In-process queue backend.
//!
//! `LocalQueue` runs the `agent` and `notify` queues inside the relay
//! process. Consumers are tokio tasks; failed jobs are retried with
//! exponential backoff and parked as dead letters once attempts run out.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{Notify, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{BackendJob, JobCounts, QueueBackend, QueueName, QueuedResult};
use crate::agent::AgentRunner;
use crate::delivery::DirectSender;
use crate::error::{FailureClass, QueueError};

/// Largest backoff exponent; keeps the delay computation from overflowing.
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Processes jobs pulled from one queue.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: BackendJob) -> anyhow::Result<serde_json::Value>;
}

/// A job that exhausted its attempts.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub job_id: String,
    pub queue: QueueName,
    pub name: &'static str,
    pub attempts_made: u32,
    pub failed_reason: String,
    pub failure_class: &'static str,
    pub failed_at: DateTime<Utc>,
    pub job: BackendJob,
}

struct QueuedJob {
    id: String,
    job: BackendJob,
    attempts_made: u32,
}

type Waiter = oneshot::Sender<Result<serde_json::Value, String>>;

struct QueueState {
    jobs: Mutex<VecDeque<QueuedJob>>,
    counts: Mutex<JobCounts>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    waiters: Mutex<HashMap<String, Waiter>>,
    consumers: AtomicUsize,
    available: Notify,
}

impl QueueState {
    fn new() -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            counts: Mutex::new(JobCounts::default()),
            dead_letters: Mutex::new(Vec::new()),
            waiters: Mutex::new(HashMap::new()),
            consumers: AtomicUsize::new(0),
            available: Notify::new(),
        }
    }

    fn counts(&self) -> MutexGuard<'_, JobCounts> {
        self.counts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, job: QueuedJob) {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(job);
        self.available.notify_one();
    }

    /// Pop the next job and mark it active.
    fn pop(&self) -> Option<QueuedJob> {
        let job = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()?;
        let mut counts = self.counts();
        counts.waiting = counts.waiting.saturating_sub(1);
        counts.active += 1;
        Some(job)
    }

    fn resolve(&self, job_id: &str, result: Result<serde_json::Value, String>) {
        let waiter = self
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(job_id);
        if let Some(waiter) = waiter {
            // The waiter may already have timed out.
            let _ = waiter.send(result);
        }
    }
}

struct Inner {
    job_attempts: u32,
    job_backoff: Duration,
    agent: QueueState,
    notify: QueueState,
    next_id: AtomicU64,
    closed: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl Inner {
    fn queue(&self, name: QueueName) -> &QueueState {
        match name {
            QueueName::Agent => &self.agent,
            QueueName::Notify => &self.notify,
        }
    }

    fn backoff_for(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        self.job_backoff
            .checked_mul(2u32.pow(exponent))
            .unwrap_or(Duration::MAX)
    }

    fn submit(&self, job: BackendJob) -> Result<String, QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        let queue = job.queue();
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let id = format!("{queue}-{seq}");
        let state = self.queue(queue);
        state.counts().waiting += 1;
        state.push(QueuedJob {
            id: id.clone(),
            job,
            attempts_made: 0,
        });
        Ok(id)
    }

    async fn process(self: &Arc<Self>, name: QueueName, mut job: QueuedJob, handler: &dyn JobHandler) {
        let state = self.queue(name);
        let outcome = AssertUnwindSafe(handler.handle(job.job.clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("job handler panicked")));
        job.attempts_made += 1;

        match outcome {
            Ok(value) => {
                {
                    let mut counts = state.counts();
                    counts.active = counts.active.saturating_sub(1);
                    counts.completed += 1;
                }
                debug!(queue = %name, job_id = %job.id, name = job.job.name(), "queue_job_completed");
                state.resolve(&job.id, Ok(value));
            }
            Err(e) if job.attempts_made < self.job_attempts => {
                let delay = self.backoff_for(job.attempts_made);
                {
                    let mut counts = state.counts();
                    counts.active = counts.active.saturating_sub(1);
                    counts.delayed += 1;
                }
                warn!(
                    queue = %name,
                    job_id = %job.id,
                    attempt = job.attempts_made,
                    delay_ms = delay.as_millis() as u64,
                    error = %format!("{e:#}"),
                    "queue_job_retry_scheduled"
                );
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let state = inner.queue(name);
                    {
                        let mut counts = state.counts();
                        counts.delayed = counts.delayed.saturating_sub(1);
                        counts.waiting += 1;
                    }
                    state.push(job);
                });
            }
            Err(e) => {
                let reason = format!("{e:#}");
                let class = FailureClass::classify(&reason);
                {
                    let mut counts = state.counts();
                    counts.active = counts.active.saturating_sub(1);
                    counts.failed += 1;
                    counts.dead_lettered += 1;
                }
                error!(
                    queue = %name,
                    job_id = %job.id,
                    attempts = job.attempts_made,
                    failure_class = class.code(),
                    error = %reason,
                    "queue_job_dead_lettered"
                );
                state
                    .dead_letters
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(DeadLetter {
                        job_id: job.id.clone(),
                        queue: name,
                        name: job.job.name(),
                        attempts_made: job.attempts_made,
                        failed_reason: reason.clone(),
                        failure_class: class.code(),
                        failed_at: Utc::now(),
                        job: job.job,
                    });
                state.resolve(&job.id, Err(reason));
            }
        }
    }
}

/// Keeps a queue's live-consumer count raised while held.
pub struct ConsumerGuard {
    inner: Arc<Inner>,
    queue: QueueName,
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        self.inner
            .queue(self.queue)
            .consumers
            .fetch_sub(1, Ordering::AcqRel);
    }
}

/// In-process queue backend with `agent` and `notify` queues.
#[derive(Clone)]
pub struct LocalQueue {
    inner: Arc<Inner>,
}

impl LocalQueue {
    pub fn new(job_attempts: u32, job_backoff: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                job_attempts: job_attempts.max(1),
                job_backoff,
                agent: QueueState::new(),
                notify: QueueState::new(),
                next_id: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    /// Count a consumer on `queue` for as long as the guard lives.
    pub fn register_consumer(&self, queue: QueueName) -> ConsumerGuard {
        self.inner
            .queue(queue)
            .consumers
            .fetch_add(1, Ordering::AcqRel);
        ConsumerGuard {
            inner: Arc::clone(&self.inner),
            queue,
        }
    }

    /// Spawn a consumer task that processes `queue` until `close()`.
    pub fn spawn_consumer(&self, queue: QueueName, handler: Arc<dyn JobHandler>) -> JoinHandle<()> {
        let guard = self.register_consumer(queue);
        let inner = Arc::clone(&self.inner);
        let mut shutdown = inner.shutdown.subscribe();
        tokio::spawn(async move {
            let _guard = guard;
            loop {
                if *shutdown.borrow() {
                    break;
                }
                match inner.queue(queue).pop() {
                    Some(job) => inner.process(queue, job, handler.as_ref()).await,
                    None => {
                        tokio::select! {
                            _ = inner.queue(queue).available.notified() => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                }
            }
            debug!(queue = %queue, "queue_consumer_stopped");
        })
    }

    /// Spawn `concurrency` consumers for `queue`.
    pub fn spawn_consumers(
        &self,
        queue: QueueName,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) -> Vec<JoinHandle<()>> {
        info!(queue = %queue, concurrency, "queue_consumers_started");
        (0..concurrency.max(1))
            .map(|_| self.spawn_consumer(queue, Arc::clone(&handler)))
            .collect()
    }

    /// Stop consumers and reject new jobs. Pending waiters see `Closed`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let _ = self.inner.shutdown.send(true);
        for queue in QueueName::ALL {
            self.inner
                .queue(queue)
                .waiters
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clear();
        }
    }

    pub fn dead_letters(&self, queue: QueueName) -> Vec<DeadLetter> {
        self.inner
            .queue(queue)
            .dead_letters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl QueueBackend for LocalQueue {
    fn name(&self) -> &str {
        "local"
    }

    async fn ensure_ready(&self) -> Result<(), QueueError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        Ok(())
    }

    async fn consumer_count(&self, queue: QueueName) -> Result<usize, QueueError> {
        Ok(self.inner.queue(queue).consumers.load(Ordering::Acquire))
    }

    async fn enqueue(&self, job: BackendJob) -> Result<String, QueueError> {
        self.inner.submit(job)
    }

    async fn enqueue_and_wait(
        &self,
        job: BackendJob,
        wait: Duration,
    ) -> Result<QueuedResult, QueueError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        let queue = self.inner.queue(job.queue());
        let (tx, rx) = oneshot::channel();
        // Register the waiter under the id the job is about to get, before
        // any consumer can finish it.
        let seq = self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let job_id = format!("{}-{seq}", job.queue());
        queue
            .waiters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job_id.clone(), tx);
        queue.counts().waiting += 1;
        queue.push(QueuedJob {
            id: job_id.clone(),
            job,
            attempts_made: 0,
        });

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(Ok(value))) => Ok(QueuedResult { job_id, value }),
            Ok(Ok(Err(reason))) => Err(QueueError::JobFailed(reason)),
            Ok(Err(_)) => Err(QueueError::Closed),
            Err(_) => {
                queue
                    .waiters
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&job_id);
                Err(QueueError::WaitTimeout(wait))
            }
        }
    }

    async fn job_counts(&self, queue: QueueName) -> Result<JobCounts, QueueError> {
        Ok(*self.inner.queue(queue).counts())
    }
}

/// Runs `agent.run` jobs through an `AgentRunner`.
pub struct AgentJobHandler {
    runner: Arc<dyn AgentRunner>,
}

impl AgentJobHandler {
    pub fn new(runner: Arc<dyn AgentRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl JobHandler for AgentJobHandler {
    async fn handle(&self, job: BackendJob) -> anyhow::Result<serde_json::Value> {
        let BackendJob::AgentRun(request) = job else {
            anyhow::bail!("agent queue cannot run {}", job.name());
        };
        let request_id = request.request_id.clone().unwrap_or_default();
        debug!(request_id = %request_id, conversation = %request.conversation_id, "agent_job_start");
        let run = self.runner.run(request).await?;
        debug!(request_id = %request_id, "agent_job_done");
        Ok(serde_json::to_value(run)?)
    }
}

/// Delivers `notify.send` jobs with a direct, retrying send.
pub struct NotifyJobHandler {
    direct: Arc<DirectSender>,
}

impl NotifyJobHandler {
    pub fn new(direct: Arc<DirectSender>) -> Self {
        Self { direct }
    }
}

#[async_trait]
impl JobHandler for NotifyJobHandler {
    async fn handle(&self, job: BackendJob) -> anyhow::Result<serde_json::Value> {
        let BackendJob::NotifySend(notify) = job else {
            anyhow::bail!("notify queue cannot run {}", job.name());
        };
        let conversation = notify.conversation_id.trim();
        let text = notify.text.trim();
        if conversation.is_empty() || text.is_empty() {
            anyhow::bail!("Missing conversation or text");
        }
        self.direct.send_text_with_retry(conversation, text).await?;
        if let Some(request_id) = notify.request_id.as_deref() {
            info!(request_id, conversation, "notify_delivered");
        }
        Ok(serde_json::json!({ "ok": true }))
    }
}
