//! Task state machine, task records and worker locks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskError;

/// Cap on transition history per task.
const MAX_TRANSITIONS: usize = 200;

/// Process-wide sequence so ids stay unique even if the wall clock steps back.
static TASK_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// State of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting for its next attempt.
    Pending,
    /// An attempt is in flight.
    Running,
    /// Finished successfully.
    Done,
    /// Exhausted its attempts.
    Failed,
}

impl TaskState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskState) -> bool {
        use TaskState::*;

        matches!(
            (self, target),
            (Pending, Running) | (Running, Done) | (Running, Failed) | (Running, Pending)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Globally unique task identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a new id for a task bound to `key`.
    pub fn generate(key: &WorkerKey) -> Self {
        let seq = TASK_SEQUENCE.fetch_add(1, Ordering::Relaxed) + 1;
        let nonce = Uuid::new_v4().simple().to_string();
        Self(format!(
            "task-{}-{}-{}-{}-{}-{}",
            Utc::now().timestamp_millis(),
            seq,
            key.conversation_id,
            key.agent,
            key.worker_id,
            &nonce[..8]
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identity of one worker slot for one (conversation, agent) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerKey {
    pub conversation_id: String,
    pub agent: String,
    pub worker_id: u32,
}

impl WorkerKey {
    pub fn new(conversation_id: impl Into<String>, agent: impl Into<String>, worker_id: u32) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            agent: agent.into(),
            worker_id,
        }
    }
}

impl std::fmt::Display for WorkerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.conversation_id, self.agent, self.worker_id)
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: TaskState,
    pub to: TaskState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Lifecycle record for one task bound to one worker.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub conversation_id: String,
    pub agent: String,
    pub worker_id: u32,
    /// Goal text the task executes.
    pub task: String,
    pub state: TaskState,
    /// Attempts started so far.
    pub attempt: u32,
    pub attempts_max: u32,
    /// Timeout raced against each attempt.
    pub timeout: Duration,
    pub created_at: DateTime<Utc>,
    /// Last transition or heartbeat.
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Backend job id when the attempt ran through a queue.
    pub job_id: Option<String>,
    pub transitions: Vec<StateTransition>,
}

impl TaskRecord {
    /// Create a pending record for `key`.
    pub fn new(key: &WorkerKey, task: impl Into<String>, attempts_max: u32, timeout: Duration) -> Self {
        let now = Utc::now();
        Self {
            task_id: TaskId::generate(key),
            conversation_id: key.conversation_id.clone(),
            agent: key.agent.clone(),
            worker_id: key.worker_id,
            task: task.into(),
            state: TaskState::Pending,
            attempt: 0,
            attempts_max: attempts_max.max(1),
            timeout,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            last_error: None,
            job_id: None,
            transitions: Vec::new(),
        }
    }

    pub fn key(&self) -> WorkerKey {
        WorkerKey::new(&self.conversation_id, &self.agent, self.worker_id)
    }

    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_state: TaskState,
        reason: Option<String>,
    ) -> Result<(), TaskError> {
        if !self.state.can_transition_to(new_state) {
            return Err(TaskError::InvalidTransition {
                task_id: self.task_id.to_string(),
                from: self.state.to_string(),
                to: new_state.to_string(),
            });
        }

        self.apply(new_state, reason);
        Ok(())
    }

    /// Force a non-terminal record to `failed` when its task body died
    /// without reaching a terminal state. Returns `false` if already terminal.
    pub fn abandon(&mut self, error: &str) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.last_error = Some(error.to_string());
        self.apply(TaskState::Failed, Some(error.to_string()));
        true
    }

    fn apply(&mut self, new_state: TaskState, reason: Option<String>) {
        let now = Utc::now();
        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: now,
            reason,
        });
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.state = new_state;
        self.updated_at = now;
        match new_state {
            TaskState::Running if self.started_at.is_none() => self.started_at = Some(now),
            TaskState::Done | TaskState::Failed => self.finished_at = Some(now),
            _ => {}
        }
    }

    /// Whether another attempt may start.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt < self.attempts_max
    }

    /// State path this task has walked, starting from `pending`.
    pub fn state_path(&self) -> Vec<TaskState> {
        let mut path = vec![TaskState::Pending];
        path.extend(self.transitions.iter().map(|t| t.to));
        path
    }
}

/// Mutual-exclusion record for one worker slot.
///
/// Mirrors the owning task's state, attempt and last error so diagnostics
/// never need to look the task up.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerLock {
    pub task_id: TaskId,
    pub key: WorkerKey,
    pub state: TaskState,
    pub attempt: u32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl WorkerLock {
    pub fn for_record(record: &TaskRecord) -> Self {
        Self {
            task_id: record.task_id.clone(),
            key: record.key(),
            state: record.state,
            attempt: record.attempt,
            last_error: record.last_error.clone(),
            updated_at: record.updated_at,
        }
    }

    /// Copy the record's diagnostic fields onto this lock.
    pub fn mirror(&mut self, record: &TaskRecord) {
        self.state = record.state;
        self.attempt = record.attempt;
        self.last_error = record.last_error.clone();
        self.updated_at = record.updated_at;
    }

    /// A terminal lock no longer occupies its worker.
    pub fn is_free(&self) -> bool {
        self.state.is_terminal()
    }
}
