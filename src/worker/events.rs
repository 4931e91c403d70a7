//! Task lifecycle events.
//!
//! Broadcast by the dispatcher and executor so observers (the operator
//! console, tests, future streaming endpoints) can follow work in real time.

use serde::{Deserialize, Serialize};

use crate::worker::state::{TaskId, TaskState};

/// Lifecycle events emitted while requests are dispatched and executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// Request joined the overflow queue.
    Queued {
        conversation_id: String,
        agent: String,
        position: usize,
    },
    /// A worker was locked for the request.
    Dispatched {
        task_id: TaskId,
        conversation_id: String,
        agent: String,
        worker_id: u32,
    },
    /// The task moved between lifecycle states.
    StateChanged {
        task_id: TaskId,
        from: TaskState,
        to: TaskState,
        attempt: u32,
    },
    /// Task finished successfully.
    Completed { task_id: TaskId, reply_chars: usize },
    /// Task exhausted its attempts.
    Failed { task_id: TaskId, error: String },
    /// Worker lock released.
    Released { task_id: TaskId, worker_id: u32 },
    /// The reply or failure notice could not be delivered.
    NotifyFailed { task_id: TaskId, error: String },
}

impl TaskEvent {
    /// Task id, for every event that concerns an admitted task.
    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            Self::Queued { .. } => None,
            Self::Dispatched { task_id, .. }
            | Self::StateChanged { task_id, .. }
            | Self::Completed { task_id, .. }
            | Self::Failed { task_id, .. }
            | Self::Released { task_id, .. }
            | Self::NotifyFailed { task_id, .. } => Some(task_id),
        }
    }

    /// Whether the task reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }

    /// Event name, matching the serde tag.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Queued { .. } => "queued",
            Self::Dispatched { .. } => "dispatched",
            Self::StateChanged { .. } => "state_changed",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::Released { .. } => "released",
            Self::NotifyFailed { .. } => "notify_failed",
        }
    }
}
