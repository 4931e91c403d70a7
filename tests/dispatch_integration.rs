//! End-to-end tests for dispatch, reply delivery and the diagnostics API.
//!
//! Each test starts a mock Telegram Bot API on a random port, wires a real
//! `Dispatcher` against it with a stub agent, and observes what gets sent.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use agent_relay::agent::{AgentRequest, AgentRun, AgentRunner};
use agent_relay::bridge::{BackendGate, ExecutionBridge};
use agent_relay::config::{DeliveryConfig, DispatchConfig};
use agent_relay::delivery::{DirectSender, ReplySender, TelegramTransport};
use agent_relay::error::AgentError;
use agent_relay::http::diagnostics_routes;
use agent_relay::store::MemorySessionStore;
use agent_relay::worker::{Coordinator, DispatchOutcome, DispatchRequest, Dispatcher};

/// Maximum time any test is allowed to wait before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const BOT_TOKEN: &str = "123:test-token";

/// Records every `sendMessage` call as `(chat_id, text)`.
#[derive(Clone, Default)]
struct MockTelegram {
    messages: Arc<Mutex<Vec<(String, String)>>>,
}

impl MockTelegram {
    fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().unwrap().clone()
    }

    async fn wait_for(&self, count: usize) -> Vec<(String, String)> {
        tokio::time::timeout(TEST_TIMEOUT, async {
            loop {
                let messages = self.messages();
                if messages.len() >= count {
                    return messages;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("expected {count} telegram messages, got {:?}", self.messages()))
    }
}

async fn send_message(State(mock): State<MockTelegram>, Json(body): Json<Value>) -> Json<Value> {
    let chat_id = match &body["chat_id"] {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let text = body["text"].as_str().unwrap_or_default().to_string();
    mock.messages.lock().unwrap().push((chat_id, text));
    Json(json!({"ok": true, "result": {"message_id": 1}}))
}

/// Serve `router` on an ephemeral port and return its base URL.
async fn serve(router: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

async fn start_mock_telegram() -> (MockTelegram, String) {
    let mock = MockTelegram::default();
    let router = Router::new()
        .route(&format!("/bot{BOT_TOKEN}/sendMessage"), post(send_message))
        .with_state(mock.clone());
    let base = serve(router).await;
    (mock, base)
}

/// Echoes the prompt once a permit is available.
struct GatedAgent {
    permits: Semaphore,
    fail_with: Option<String>,
}

impl GatedAgent {
    fn open() -> Arc<Self> {
        Arc::new(Self {
            permits: Semaphore::new(Semaphore::MAX_PERMITS),
            fail_with: None,
        })
    }

    fn closed() -> Arc<Self> {
        Arc::new(Self {
            permits: Semaphore::new(0),
            fail_with: None,
        })
    }

    fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            permits: Semaphore::new(Semaphore::MAX_PERMITS),
            fail_with: Some(message.to_string()),
        })
    }

    fn release(&self, n: usize) {
        self.permits.add_permits(n);
    }
}

#[async_trait]
impl AgentRunner for GatedAgent {
    async fn run(&self, request: AgentRequest) -> Result<AgentRun, AgentError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| AgentError::Failed(e.to_string()))?;
        permit.forget();
        if let Some(message) = &self.fail_with {
            return Err(AgentError::Failed(message.clone()));
        }
        Ok(AgentRun {
            session_id: Some(format!("session-{}", request.conversation_id)),
            reply: format!("echo: {}", request.prompt),
        })
    }
}

async fn relay(max_workers: u32, agent: Arc<GatedAgent>) -> (Dispatcher, MockTelegram) {
    let (mock, base) = start_mock_telegram().await;
    let transport = Arc::new(
        TelegramTransport::new(SecretString::from(BOT_TOKEN.to_string())).with_api_base(base),
    );
    let direct = Arc::new(DirectSender::new(
        transport,
        DeliveryConfig {
            min_send_interval: Duration::ZERO,
            send_max_attempts: 1,
            retry_base: Duration::from_millis(10),
        },
    ));
    let gate = Arc::new(BackendGate::disabled());
    let config = DispatchConfig {
        max_workers,
        attempts_per_task: 2,
        task_timeout: Duration::from_secs(10),
        ..DispatchConfig::default()
    };
    let coordinator = Arc::new(Coordinator::new(&config));
    let bridge = Arc::new(ExecutionBridge::new(
        Arc::clone(&gate),
        agent,
        Duration::from_secs(1),
    ));
    let replies = Arc::new(ReplySender::new(direct, gate));
    let dispatcher = Dispatcher::new(
        config,
        coordinator,
        bridge,
        Arc::new(MemorySessionStore::new()),
        replies,
    );
    (dispatcher, mock)
}

fn request(conversation: &str, goal: &str) -> DispatchRequest {
    DispatchRequest {
        conversation_id: conversation.to_string(),
        goal: goal.to_string(),
        ..DispatchRequest::default()
    }
}

// ── Dispatch ────────────────────────────────────────────────────────────

#[tokio::test]
async fn dispatched_task_reply_reaches_telegram() {
    let (dispatcher, mock) = relay(3, GatedAgent::open()).await;

    let outcome = dispatcher.dispatch_request(request("42", "summarize the diff"));
    let DispatchOutcome::Dispatched { worker_id, .. } = outcome else {
        panic!("expected dispatch, got {outcome:?}");
    };

    let messages = mock.wait_for(1).await;
    assert_eq!(messages[0].0, "42");
    assert_eq!(
        messages[0].1,
        format!("worker-{worker_id} [codex]\necho: summarize the diff")
    );
}

#[tokio::test]
async fn exhausted_task_sends_failure_notice() {
    let (dispatcher, mock) = relay(3, GatedAgent::failing("codex exited with code 2")).await;

    let outcome = dispatcher.dispatch_request(request("42", "break things"));
    assert_eq!(outcome.status(), "dispatched");

    let messages = mock.wait_for(1).await;
    assert!(messages[0].1.contains("failed: codex exited with code 2"), "{messages:?}");
}

#[tokio::test]
async fn empty_goal_is_rejected_without_sending() {
    let (dispatcher, mock) = relay(3, GatedAgent::open()).await;

    let outcome = dispatcher.dispatch_request(request("42", "   "));
    assert_eq!(outcome.status(), "rejected");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(mock.messages().is_empty());
}

#[tokio::test]
async fn overflow_request_runs_after_worker_frees() {
    // A single pool worker (id 2).
    let agent = GatedAgent::closed();
    let (dispatcher, mock) = relay(2, agent.clone()).await;

    let first = dispatcher.dispatch_request(request("42", "first"));
    assert_eq!(first.status(), "dispatched");
    let second = dispatcher.dispatch_request(request("42", "second"));
    assert_eq!(second, DispatchOutcome::Queued { position: 1 });

    agent.release(1);
    let messages = mock.wait_for(1).await;
    assert!(messages[0].1.ends_with("echo: first"), "{messages:?}");

    agent.release(1);
    let messages = mock.wait_for(2).await;
    assert!(messages[1].1.ends_with("echo: second"), "{messages:?}");
}

// ── Diagnostics API ─────────────────────────────────────────────────────

#[tokio::test]
async fn diagnostics_reports_busy_worker() {
    let agent = GatedAgent::closed();
    let (dispatcher, mock) = relay(3, agent.clone()).await;
    let base = serve(diagnostics_routes(dispatcher.clone())).await;

    let outcome = dispatcher.dispatch_request(request("42", "hold on"));
    assert_eq!(outcome.status(), "dispatched");

    let body: Value = reqwest::get(format!("{base}/api/diagnostics?scope=conversation&conversation_id=42"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["scope"], "conversation");
    assert_eq!(body["conversationId"], "42");
    assert_eq!(body["workers"]["busy"], 1);
    assert_eq!(body["locks"].as_array().unwrap().len(), 1);
    assert_eq!(body["locks"][0]["staleLock"], false);
    assert_eq!(body["queue"]["enabled"], false);
    assert_eq!(body["runtime"]["maxWorkers"], 3);

    agent.release(1);
    mock.wait_for(1).await;

    // Other conversations never see the lock.
    let body: Value = reqwest::get(format!("{base}/api/diagnostics?scope=chat&conversation_id=7"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["locks"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn diagnostics_rejects_bad_scope() {
    let (dispatcher, _mock) = relay(3, GatedAgent::open()).await;
    let base = serve(diagnostics_routes(dispatcher)).await;

    let resp = reqwest::get(format!("{base}/api/diagnostics?scope=conversation"))
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("conversation_id"));

    let health: Value = reqwest::get(format!("{base}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
}
