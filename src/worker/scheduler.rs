//! Worker dispatch and the overflow queue pump.
//!
//! `dispatch_request` answers immediately: either a worker was locked and
//! the task runs detached, or the request joined the overflow queue. Every
//! lock release pumps the queue, so freed workers pick up queued requests
//! in arrival order without a dedicated scheduler loop.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::agent::AgentKind;
use crate::agent::cli::NO_TEXT_OUTPUT;
use crate::bridge::{BackendGate, ExecutionBridge};
use crate::config::DispatchConfig;
use crate::delivery::ReplySender;
use crate::diagnostics::{self, DiagnosticsScope, DiagnosticsSnapshot};
use crate::error::{DispatchError, FailureClass, TaskError};
use crate::store::SessionStore;
use crate::worker::events::TaskEvent;
use crate::worker::executor::{Executor, TaskOptions, TaskSuccess};
use crate::worker::registry::{Admission, Coordinator, PendingDispatchItem};
use crate::worker::state::{TaskId, TaskRecord};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A caller's request to run `goal` for a conversation.
#[derive(Debug, Clone, Default)]
pub struct DispatchRequest {
    pub conversation_id: String,
    /// Falls back to the configured default agent.
    pub agent: Option<String>,
    pub model: Option<String>,
    pub goal: String,
    pub request_id: Option<String>,
}

/// Immediate answer to a dispatch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Dispatched { worker_id: u32, task_id: TaskId },
    /// `position` is 1-based among requests queued for the same
    /// (conversation, agent).
    Queued { position: usize },
    Rejected(DispatchError),
}

impl DispatchOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Dispatched { .. } => "dispatched",
            Self::Queued { .. } => "queued",
            Self::Rejected(_) => "rejected",
        }
    }

    /// Short text suitable for acknowledging the request to a user.
    pub fn acknowledgement(&self) -> String {
        match self {
            Self::Dispatched { worker_id, .. } => format!("dispatched to worker-{worker_id}"),
            Self::Queued { position } => format!("all workers busy, queued at position {position}"),
            Self::Rejected(e) => format!("rejected: {e}"),
        }
    }
}

/// `worker-<id> [<agent>]` followed by the reply on its own line.
pub fn format_completion(worker_id: u32, agent: &str, reply: &str) -> String {
    let reply = reply.trim();
    let reply = if reply.is_empty() { NO_TEXT_OUTPUT } else { reply };
    format!("worker-{worker_id} [{agent}]\n{reply}")
}

pub fn format_failure(worker_id: u32, agent: &str, message: &str) -> String {
    format!("worker-{worker_id} [{agent}] failed: {message}")
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct DispatcherInner {
    config: DispatchConfig,
    coordinator: Arc<Coordinator>,
    executor: Executor,
    replies: Arc<ReplySender>,
    gate: Arc<BackendGate>,
    events: broadcast::Sender<TaskEvent>,
    pumping: AtomicBool,
    started_at: DateTime<Utc>,
}

/// Releases the worker lock when the task body exits, however it exits,
/// then pumps the overflow queue.
struct ReleaseOnDrop {
    inner: Arc<DispatcherInner>,
    record: TaskRecord,
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        // A body that unwound or was cancelled never reached a terminal
        // state; fail the record before its lock disappears.
        let reason = if std::thread::panicking() {
            TaskError::Panicked("task body unwound".to_string()).to_string()
        } else {
            "task body exited before completion".to_string()
        };
        self.inner.abandon(&self.record, &reason);
        self.inner.release(&self.record);
        self.inner.pump();
    }
}

impl DispatcherInner {
    /// Fail the record if it is still pending or running.
    fn abandon(&self, record: &TaskRecord, reason: &str) {
        match self.coordinator.fail_task(&record.task_id, reason) {
            Ok(Some(failed)) => {
                if let Some(last) = failed.transitions.last() {
                    let _ = self.events.send(TaskEvent::StateChanged {
                        task_id: failed.task_id.clone(),
                        from: last.from,
                        to: last.to,
                        attempt: failed.attempt,
                    });
                }
                warn!(
                    task_id = %record.task_id,
                    worker_id = record.worker_id,
                    error = reason,
                    "single_worker_task_abandoned"
                );
            }
            Ok(None) => {}
            Err(e) => warn!(task_id = %record.task_id, error = %e, "single_worker_task_abandon_failed"),
        }
    }

    /// Drop the worker lock if this task still owns it.
    fn release(&self, record: &TaskRecord) -> bool {
        let released = self.coordinator.release_lock(&record.key(), &record.task_id);
        if released {
            debug!(
                task_id = %record.task_id,
                worker_id = record.worker_id,
                "single_worker_lock_released"
            );
            let _ = self.events.send(TaskEvent::Released {
                task_id: record.task_id.clone(),
                worker_id: record.worker_id,
            });
        }
        released
    }

    /// Allocate freed workers to queued requests until a full pass makes no
    /// progress. Concurrent callers return immediately while a pump runs.
    fn pump(self: &Arc<Self>) {
        loop {
            if self.pumping.swap(true, Ordering::AcqRel) {
                return;
            }
            loop {
                let allocated = self.coordinator.allocate_pending_pass();
                if allocated.is_empty() {
                    break;
                }
                for (record, item) in allocated {
                    debug!(
                        task_id = %record.task_id,
                        worker_id = record.worker_id,
                        waited_ms = (Utc::now() - item.enqueued_at).num_milliseconds(),
                        "dispatch_queue_allocated"
                    );
                    self.spawn_task(
                        record,
                        TaskOptions {
                            model: item.model,
                            request_id: item.request_id,
                        },
                    );
                }
            }
            self.pumping.store(false, Ordering::Release);
            // A release that raced the end of the pass skipped its own pump.
            if !self.coordinator.can_allocate() {
                return;
            }
        }
    }

    fn spawn_task(self: &Arc<Self>, record: TaskRecord, options: TaskOptions) {
        let _ = self.events.send(TaskEvent::Dispatched {
            task_id: record.task_id.clone(),
            conversation_id: record.conversation_id.clone(),
            agent: record.agent.clone(),
            worker_id: record.worker_id,
        });
        info!(
            conversation = %record.conversation_id,
            agent = %record.agent,
            worker_id = record.worker_id,
            task_id = %record.task_id,
            "single_worker_dispatch_start"
        );

        let handle = tokio::spawn(Arc::clone(self).run_task(record.clone(), options.clone()));
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let Err(join_error) = handle.await else {
                return;
            };
            let message = if join_error.is_panic() {
                TaskError::Panicked(panic_message(join_error.into_panic())).to_string()
            } else {
                join_error.to_string()
            };
            error!(
                task_id = %record.task_id,
                worker_id = record.worker_id,
                error = %message,
                "single_worker_dispatch_panicked"
            );
            // Covers a task cancelled before its first poll, when no
            // release guard existed yet.
            inner.abandon(&record, &message);
            if inner.release(&record) {
                inner.pump();
            }
            let _ = inner.events.send(TaskEvent::Failed {
                task_id: record.task_id.clone(),
                error: message.clone(),
            });
            let text = format_failure(record.worker_id, &record.agent, &message);
            inner
                .notify(&record, &text, options.request_id.as_deref())
                .await;
        });
    }

    async fn run_task(self: Arc<Self>, record: TaskRecord, options: TaskOptions) {
        let result = {
            let _release = ReleaseOnDrop {
                inner: Arc::clone(&self),
                record: record.clone(),
            };
            self.executor.execute(&record, &options).await
        };

        let text = match &result {
            Ok(TaskSuccess { run, .. }) => format_completion(record.worker_id, &record.agent, &run.reply),
            Err(e) => {
                let message = e.to_string();
                warn!(
                    task_id = %record.task_id,
                    worker_id = record.worker_id,
                    failure_class = FailureClass::classify(&message).code(),
                    error = %message,
                    "single_worker_dispatch_failed"
                );
                format_failure(record.worker_id, &record.agent, &message)
            }
        };
        self.notify(&record, &text, options.request_id.as_deref()).await;
    }

    async fn notify(&self, record: &TaskRecord, text: &str, request_id: Option<&str>) {
        match self
            .replies
            .send_reply(&record.conversation_id, text, request_id)
            .await
        {
            Ok(route) => debug!(task_id = %record.task_id, route = ?route, "single_worker_dispatch_notified"),
            Err(e) => {
                warn!(
                    task_id = %record.task_id,
                    conversation = %record.conversation_id,
                    error = %e,
                    "single_worker_dispatch_notify_failed"
                );
                let _ = self.events.send(TaskEvent::NotifyFailed {
                    task_id: record.task_id.clone(),
                    error: e.to_string(),
                });
            }
        }
    }
}

/// Entry point for running agent tasks on the worker pool.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(
        config: DispatchConfig,
        coordinator: Arc<Coordinator>,
        bridge: Arc<ExecutionBridge>,
        sessions: Arc<dyn SessionStore>,
        replies: Arc<ReplySender>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let gate = Arc::clone(bridge.gate());
        let executor = Executor::new(
            Arc::clone(&coordinator),
            bridge,
            sessions,
            events.clone(),
            config.heartbeat_interval,
            config.reuse_sessions,
        );
        Self {
            inner: Arc::new(DispatcherInner {
                config,
                coordinator,
                executor,
                replies,
                gate,
                events,
                pumping: AtomicBool::new(false),
                started_at: Utc::now(),
            }),
        }
    }

    /// Admit the request onto an idle worker or queue it. Never blocks on
    /// the task itself; the result is delivered as a reply later.
    pub fn dispatch_request(&self, request: DispatchRequest) -> DispatchOutcome {
        let goal = request.goal.trim();
        if goal.is_empty() {
            warn!(conversation = %request.conversation_id, "single_worker_dispatch_rejected_empty_goal");
            return DispatchOutcome::Rejected(DispatchError::EmptyGoal);
        }
        let agent = request
            .agent
            .as_deref()
            .filter(|a| !a.trim().is_empty())
            .map(AgentKind::resolve)
            .unwrap_or_else(|| AgentKind::resolve(&self.inner.config.default_agent));

        let item = PendingDispatchItem {
            conversation_id: request.conversation_id.clone(),
            agent: agent.to_string(),
            model: request.model.clone(),
            goal: goal.to_string(),
            request_id: request.request_id.clone(),
            enqueued_at: Utc::now(),
        };

        match self.inner.coordinator.admit_or_enqueue(item) {
            Admission::Admitted(record) => {
                let outcome = DispatchOutcome::Dispatched {
                    worker_id: record.worker_id,
                    task_id: record.task_id.clone(),
                };
                self.inner.spawn_task(
                    record,
                    TaskOptions {
                        model: request.model,
                        request_id: request.request_id,
                    },
                );
                outcome
            }
            Admission::Queued { position } => {
                info!(
                    conversation = %request.conversation_id,
                    agent = %agent,
                    position,
                    pending_total = self.inner.coordinator.pending_len(),
                    "single_worker_dispatch_queued"
                );
                let _ = self.inner.events.send(TaskEvent::Queued {
                    conversation_id: request.conversation_id,
                    agent: agent.to_string(),
                    position,
                });
                DispatchOutcome::Queued { position }
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.inner.coordinator
    }

    pub fn gate(&self) -> &Arc<BackendGate> {
        &self.inner.gate
    }

    pub fn replies(&self) -> &Arc<ReplySender> {
        &self.inner.replies
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.inner.config
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    /// Read-only snapshot of workers, locks and queue health.
    pub async fn diagnostics(&self, scope: &DiagnosticsScope) -> DiagnosticsSnapshot {
        diagnostics::collect(self, scope).await
    }
}
