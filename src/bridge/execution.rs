//! Agent execution through the queue backend, with direct fallback.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::gate::BackendGate;
use super::{BackendJob, QueueName};
use crate::agent::{AgentRequest, AgentRun, AgentRunner};
use crate::error::{AgentError, QueueError};

/// Where an agent run executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionRoute {
    Queued,
    Direct,
}

/// Outcome of one bridged run.
#[derive(Debug, Clone)]
pub struct BridgeRun {
    pub run: AgentRun,
    pub route: ExecutionRoute,
    /// Backend job id when the run went through the queue.
    pub job_id: Option<String>,
}

/// Runs agents on the backend when it has consumers, else in-process.
///
/// Backend problems never surface to the caller: any queue error or an
/// unusable queued result falls back to a direct run.
pub struct ExecutionBridge {
    gate: Arc<BackendGate>,
    runner: Arc<dyn AgentRunner>,
    wait_for_result: Duration,
}

impl ExecutionBridge {
    pub fn new(gate: Arc<BackendGate>, runner: Arc<dyn AgentRunner>, wait_for_result: Duration) -> Self {
        Self {
            gate,
            runner,
            wait_for_result,
        }
    }

    pub fn gate(&self) -> &Arc<BackendGate> {
        &self.gate
    }

    pub async fn run(&self, request: AgentRequest) -> Result<BridgeRun, AgentError> {
        match self.run_queued(&request).await {
            Ok(Some(bridged)) => return Ok(bridged),
            Ok(None) => {}
            Err(e) => warn!(
                conversation = %request.conversation_id,
                agent = %request.agent,
                request_id = request.request_id.as_deref().unwrap_or(""),
                error = %e,
                "queue_dispatch_failed_fallback_direct"
            ),
        }

        let run = self.runner.run(request).await?;
        Ok(BridgeRun {
            run,
            route: ExecutionRoute::Direct,
            job_id: None,
        })
    }

    /// `Ok(None)` when the backend is not usable for this call.
    async fn run_queued(&self, request: &AgentRequest) -> Result<Option<BridgeRun>, QueueError> {
        let Some(backend) = self.gate.available(QueueName::Agent).await else {
            return Ok(None);
        };
        let result = backend
            .enqueue_and_wait(BackendJob::AgentRun(request.clone()), self.wait_for_result)
            .await?;
        if result.value.is_null() {
            return Err(QueueError::EmptyResult);
        }
        let run: AgentRun = serde_json::from_value(result.value)?;
        debug!(
            conversation = %request.conversation_id,
            job_id = %result.job_id,
            "queue_dispatch_completed"
        );
        Ok(Some(BridgeRun {
            run,
            route: ExecutionRoute::Queued,
            job_id: Some(result.job_id),
        }))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FixedRunner;
    use super::*;
    use crate::bridge::gate::testing::ScriptedBackend;

    fn request() -> AgentRequest {
        AgentRequest {
            agent: "codex".into(),
            conversation_id: "chat".into(),
            session_id: None,
            prompt: "summarize".into(),
            model: None,
            request_id: Some("req-1".into()),
        }
    }

    #[tokio::test]
    async fn runs_directly_without_backend() {
        let runner = Arc::new(FixedRunner::replying("direct"));
        let bridge = ExecutionBridge::new(
            Arc::new(BackendGate::disabled()),
            runner.clone(),
            Duration::from_secs(1),
        );
        let out = bridge.run(request()).await.unwrap();
        assert_eq!(out.route, ExecutionRoute::Direct);
        assert_eq!(out.run.reply, "direct");
        assert_eq!(runner.calls(), 1);
    }

    #[tokio::test]
    async fn prefers_backend_with_consumers() {
        let backend = Arc::new(
            ScriptedBackend::new(true, 1)
                .answering(Ok(serde_json::json!({"sessionId": "s-9", "reply": "queued"}))),
        );
        let runner = Arc::new(FixedRunner::replying("direct"));
        let bridge = ExecutionBridge::new(
            Arc::new(BackendGate::new(backend.clone(), Duration::from_secs(5))),
            runner.clone(),
            Duration::from_secs(1),
        );
        let out = bridge.run(request()).await.unwrap();
        assert_eq!(out.route, ExecutionRoute::Queued);
        assert_eq!(out.run.reply, "queued");
        assert_eq!(out.run.session_id.as_deref(), Some("s-9"));
        assert_eq!(out.job_id.as_deref(), Some("job-1"));
        assert_eq!(runner.calls(), 0);
    }

    #[tokio::test]
    async fn empty_or_failed_queue_result_falls_back() {
        for answer in [
            Ok(serde_json::Value::Null),
            Ok(serde_json::json!({"unexpected": true})),
            Err("worker crashed".to_string()),
        ] {
            let backend = Arc::new(ScriptedBackend::new(true, 1).answering(answer));
            let runner = Arc::new(FixedRunner::replying("direct"));
            let bridge = ExecutionBridge::new(
                Arc::new(BackendGate::new(backend, Duration::from_secs(5))),
                runner.clone(),
                Duration::from_secs(1),
            );
            let out = bridge.run(request()).await.unwrap();
            assert_eq!(out.route, ExecutionRoute::Direct);
            assert_eq!(runner.calls(), 1);
        }
    }

    #[tokio::test]
    async fn direct_errors_propagate() {
        let bridge = ExecutionBridge::new(
            Arc::new(BackendGate::disabled()),
            Arc::new(FixedRunner::failing("codex exited with code 1")),
            Duration::from_secs(1),
        );
        let err = bridge.run(request()).await.unwrap_err();
        assert_eq!(err.to_string(), "codex exited with code 1");
    }
}
