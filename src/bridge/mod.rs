//! Optional job-queue backend.
//!
//! Agent runs and reply notifications can be offloaded to a queue with
//! separate consumers. The backend is never required: `BackendGate` decides
//! per call whether it is usable, and every caller keeps a direct path.

pub mod execution;
pub mod gate;
pub mod local;

pub use execution::{BridgeRun, ExecutionBridge, ExecutionRoute};
pub use gate::BackendGate;
pub use local::LocalQueue;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::AgentRequest;
use crate::error::QueueError;

/// Queues a backend exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
    Agent,
    Notify,
}

impl QueueName {
    pub const ALL: [QueueName; 2] = [QueueName::Agent, QueueName::Notify];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Notify => "notify",
        }
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Text notification payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyJob {
    pub conversation_id: String,
    pub text: String,
    pub request_id: Option<String>,
}

/// A job as it travels through a backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum BackendJob {
    #[serde(rename = "agent.run")]
    AgentRun(AgentRequest),
    #[serde(rename = "notify.send")]
    NotifySend(NotifyJob),
}

impl BackendJob {
    pub fn queue(&self) -> QueueName {
        match self {
            Self::AgentRun(_) => QueueName::Agent,
            Self::NotifySend(_) => QueueName::Notify,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::AgentRun(_) => "agent.run",
            Self::NotifySend(_) => "notify.send",
        }
    }
}

/// Result of a job awaited through `enqueue_and_wait`.
#[derive(Debug, Clone)]
pub struct QueuedResult {
    pub job_id: String,
    pub value: serde_json::Value,
}

/// Job counts for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead_lettered: u64,
}

/// A job-queue backend.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Short backend name for logs and diagnostics.
    fn name(&self) -> &str;

    /// Connect or otherwise prepare the backend.
    async fn ensure_ready(&self) -> Result<(), QueueError>;

    /// Live consumers currently attached to `queue`.
    async fn consumer_count(&self, queue: QueueName) -> Result<usize, QueueError>;

    /// Enqueue without waiting; returns the job id.
    async fn enqueue(&self, job: BackendJob) -> Result<String, QueueError>;

    /// Enqueue and wait up to `wait` for the job's result.
    async fn enqueue_and_wait(
        &self,
        job: BackendJob,
        wait: Duration,
    ) -> Result<QueuedResult, QueueError>;

    async fn job_counts(&self, queue: QueueName) -> Result<JobCounts, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_serialize_with_name_and_data() {
        let job = BackendJob::NotifySend(NotifyJob {
            conversation_id: "42".into(),
            text: "hi".into(),
            request_id: None,
        });
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["name"], "notify.send");
        assert_eq!(json["data"]["conversationId"], "42");
        assert_eq!(job.queue(), QueueName::Notify);

        let parsed: BackendJob = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, job);
    }
}
