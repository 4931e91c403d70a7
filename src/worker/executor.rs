//! Retrying executor: runs one admitted task through its attempts.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::agent::{AgentRequest, AgentRun};
use crate::bridge::ExecutionBridge;
use crate::error::{FailureClass, TaskError};
use crate::store::SessionStore;
use crate::worker::events::TaskEvent;
use crate::worker::registry::{Coordinator, FailureOutcome};
use crate::worker::state::{TaskId, TaskRecord, WorkerKey};

/// Per-request options that ride along with the task text.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub model: Option<String>,
    pub request_id: Option<String>,
}

/// A task that finished successfully.
#[derive(Debug, Clone)]
pub struct TaskSuccess {
    pub record: TaskRecord,
    pub run: AgentRun,
}

const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);

/// Refreshes a task's heartbeat until dropped.
struct Heartbeat(JoinHandle<()>);

impl Heartbeat {
    fn start(coordinator: Arc<Coordinator>, task_id: TaskId, interval: Duration) -> Self {
        // `interval` panics on a zero period.
        let interval = interval.max(MIN_HEARTBEAT_INTERVAL);
        Self(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                coordinator.touch_heartbeat(&task_id);
            }
        }))
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Drives `pending → running → {done | failed}` with immediate retries.
///
/// Attempts are not spaced out here; backoff belongs to the queue backend.
pub struct Executor {
    coordinator: Arc<Coordinator>,
    bridge: Arc<ExecutionBridge>,
    sessions: Arc<dyn SessionStore>,
    events: broadcast::Sender<TaskEvent>,
    heartbeat_interval: Duration,
    reuse_sessions: bool,
}

impl Executor {
    pub fn new(
        coordinator: Arc<Coordinator>,
        bridge: Arc<ExecutionBridge>,
        sessions: Arc<dyn SessionStore>,
        events: broadcast::Sender<TaskEvent>,
        heartbeat_interval: Duration,
        reuse_sessions: bool,
    ) -> Self {
        Self {
            coordinator,
            bridge,
            sessions,
            events,
            heartbeat_interval,
            reuse_sessions,
        }
    }

    /// Run `record` until it succeeds or exhausts its attempts.
    ///
    /// Does not release the worker lock; the caller owns that.
    pub async fn execute(
        &self,
        record: &TaskRecord,
        options: &TaskOptions,
    ) -> Result<TaskSuccess, TaskError> {
        let task_id = &record.task_id;
        loop {
            let running = self.coordinator.begin_attempt(task_id)?;
            self.emit_transition(&running);
            info!(
                conversation = %running.conversation_id,
                agent = %running.agent,
                worker_id = running.worker_id,
                task_id = %task_id,
                attempt = running.attempt,
                attempts_max = running.attempts_max,
                "single_worker_attempt_start"
            );

            match self.run_attempt(&running, options).await {
                Ok(run) => {
                    let done = self.coordinator.complete(task_id)?;
                    self.emit_transition(&done);
                    let _ = self.events.send(TaskEvent::Completed {
                        task_id: task_id.clone(),
                        reply_chars: run.reply.chars().count(),
                    });
                    info!(
                        task_id = %task_id,
                        attempt = done.attempt,
                        "single_worker_attempt_succeeded"
                    );
                    return Ok(TaskSuccess { record: done, run });
                }
                Err(err) => {
                    let message = err.to_string();
                    let (outcome, failed) = self.coordinator.record_failure(task_id, &message)?;
                    self.emit_transition(&failed);
                    warn!(
                        task_id = %task_id,
                        attempt = failed.attempt,
                        attempts_max = failed.attempts_max,
                        failure_class = FailureClass::classify(&message).code(),
                        error = %message,
                        will_retry = outcome == FailureOutcome::Retry,
                        "single_worker_attempt_failed"
                    );
                    if outcome == FailureOutcome::Exhausted {
                        let _ = self.events.send(TaskEvent::Failed {
                            task_id: task_id.clone(),
                            error: message,
                        });
                        return Err(err);
                    }
                }
            }
        }
    }

    async fn run_attempt(
        &self,
        record: &TaskRecord,
        options: &TaskOptions,
    ) -> Result<AgentRun, TaskError> {
        let _heartbeat = Heartbeat::start(
            Arc::clone(&self.coordinator),
            record.task_id.clone(),
            self.heartbeat_interval,
        );
        let key = record.key();
        let session_id = self.load_session(&key).await;

        let request = AgentRequest {
            agent: record.agent.clone(),
            conversation_id: record.conversation_id.clone(),
            session_id: session_id.clone(),
            prompt: record.task.clone(),
            model: options.model.clone(),
            request_id: options.request_id.clone(),
        };
        let bridged = tokio::time::timeout(record.timeout, self.bridge.run(request))
            .await
            .map_err(|_| TaskError::Timeout {
                task_id: record.task_id.to_string(),
                timeout: record.timeout,
            })??;

        if let Some(job_id) = &bridged.job_id {
            self.coordinator.record_job_id(&record.task_id, job_id);
        }
        if let Some(new_session) = &bridged.run.session_id
            && session_id.as_ref() != Some(new_session)
        {
            self.store_session(&key, new_session).await;
        }
        Ok(bridged.run)
    }

    async fn load_session(&self, key: &WorkerKey) -> Option<String> {
        if !self.reuse_sessions {
            return None;
        }
        match self.sessions.get_worker_session(key).await {
            Ok(session) => session,
            Err(e) => {
                warn!(worker = %key, error = %e, "worker_session_load_failed");
                None
            }
        }
    }

    async fn store_session(&self, key: &WorkerKey, session_id: &str) {
        if !self.reuse_sessions {
            return;
        }
        match self.sessions.set_worker_session(key, session_id).await {
            Ok(()) => debug!(worker = %key, session_id, "worker_session_saved"),
            Err(e) => warn!(worker = %key, error = %e, "worker_session_save_failed"),
        }
    }

    fn emit_transition(&self, record: &TaskRecord) {
        if let Some(last) = record.transitions.last() {
            let _ = self.events.send(TaskEvent::StateChanged {
                task_id: record.task_id.clone(),
                from: last.from,
                to: last.to,
                attempt: record.attempt,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::agent::AgentRunner;
    use crate::bridge::BackendGate;
    use crate::bridge::execution::testing::FixedRunner;
    use crate::config::DispatchConfig;
    use crate::error::{AgentError, ErrorKind};
    use crate::store::MemorySessionStore;
    use crate::worker::registry::{Admission, PendingDispatchItem};
    use crate::worker::state::TaskState;

    fn coordinator(attempts: u32, timeout: Duration) -> Arc<Coordinator> {
        Arc::new(Coordinator::new(&DispatchConfig {
            max_workers: 3,
            attempts_per_task: attempts,
            task_timeout: timeout,
            ..DispatchConfig::default()
        }))
    }

    fn admit(coord: &Coordinator, goal: &str) -> TaskRecord {
        let item = PendingDispatchItem {
            conversation_id: "chat".into(),
            agent: "codex".into(),
            model: None,
            goal: goal.into(),
            request_id: None,
            enqueued_at: chrono::Utc::now(),
        };
        match coord.admit_or_enqueue(item) {
            Admission::Admitted(record) => record,
            Admission::Queued { .. } => panic!("expected a free worker"),
        }
    }

    fn executor(
        coord: Arc<Coordinator>,
        runner: Arc<dyn AgentRunner>,
        sessions: Arc<dyn SessionStore>,
    ) -> (Executor, broadcast::Receiver<TaskEvent>) {
        let (tx, rx) = broadcast::channel(64);
        let bridge = Arc::new(ExecutionBridge::new(
            Arc::new(BackendGate::disabled()),
            runner,
            Duration::from_secs(1),
        ));
        (
            Executor::new(coord, bridge, sessions, tx, Duration::from_secs(1), true),
            rx,
        )
    }

    #[tokio::test]
    async fn always_failing_task_walks_retry_path() {
        let coord = coordinator(2, Duration::from_secs(5));
        let runner = Arc::new(FixedRunner::failing("codex exited with code 1"));
        let (exec, mut rx) = executor(coord.clone(), runner.clone(), Arc::new(MemorySessionStore::new()));
        let record = admit(&coord, "fix the build");

        let err = exec.execute(&record, &TaskOptions::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "codex exited with code 1");
        assert_eq!(runner.calls(), 2);

        let final_record = coord.task(&record.task_id).unwrap();
        assert_eq!(
            final_record.state_path(),
            vec![
                TaskState::Pending,
                TaskState::Running,
                TaskState::Pending,
                TaskState::Running,
                TaskState::Failed
            ]
        );
        assert_eq!(final_record.attempt, 2);
        assert_eq!(final_record.last_error.as_deref(), Some("codex exited with code 1"));

        let mut saw_failed = false;
        while let Ok(event) = rx.try_recv() {
            if let TaskEvent::Failed { task_id, .. } = event {
                assert_eq!(task_id, record.task_id);
                saw_failed = true;
            }
        }
        assert!(saw_failed);
    }

    #[tokio::test]
    async fn zero_heartbeat_interval_still_ticks() {
        let coord = coordinator(1, Duration::from_secs(5));
        let record = admit(&coord, "tick");
        let heartbeat = Heartbeat::start(coord.clone(), record.task_id.clone(), Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!heartbeat.0.is_finished());
        assert!(coord.task(&record.task_id).unwrap().updated_at > record.updated_at);
    }

    #[tokio::test]
    async fn success_completes_and_stores_session() {
        let coord = coordinator(2, Duration::from_secs(5));
        let sessions = Arc::new(MemorySessionStore::new());
        let (exec, _rx) = executor(
            coord.clone(),
            Arc::new(FixedRunner::replying("all green")),
            sessions.clone(),
        );
        let record = admit(&coord, "run tests");

        let success = exec.execute(&record, &TaskOptions::default()).await.unwrap();
        assert_eq!(success.run.reply, "all green");
        assert_eq!(success.record.state, TaskState::Done);
        assert_eq!(
            sessions.get_worker_session(&record.key()).await.unwrap().as_deref(),
            Some("session-chat")
        );
    }

    /// Sleeps past the deadline on the first call, then answers.
    struct SlowThenFast {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AgentRunner for SlowThenFast {
        async fn run(&self, request: AgentRequest) -> Result<AgentRun, AgentError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Ok(AgentRun {
                session_id: request.session_id,
                reply: "late but done".into(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_consumes_an_attempt() {
        let coord = coordinator(2, Duration::from_secs(2));
        let (exec, _rx) = executor(
            coord.clone(),
            Arc::new(SlowThenFast {
                calls: AtomicUsize::new(0),
            }),
            Arc::new(MemorySessionStore::new()),
        );
        let record = admit(&coord, "slow thing");

        let success = exec.execute(&record, &TaskOptions::default()).await.unwrap();
        assert_eq!(success.record.attempt, 2);
        let reasons: Vec<_> = success
            .record
            .transitions
            .iter()
            .filter_map(|t| t.reason.clone())
            .collect();
        assert!(reasons.iter().any(|r| r.contains("timed out after 2000ms")));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_error_kind_on_exhaustion() {
        let coord = coordinator(1, Duration::from_secs(1));
        let (exec, _rx) = executor(
            coord.clone(),
            Arc::new(SlowThenFast {
                calls: AtomicUsize::new(0),
            }),
            Arc::new(MemorySessionStore::new()),
        );
        let record = admit(&coord, "slow thing");
        let err = exec.execute(&record, &TaskOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::TaskTimeout));
    }
}
