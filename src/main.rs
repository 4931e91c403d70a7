use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use agent_relay::agent::{AgentRunner, CliAgentRunner};
use agent_relay::bridge::local::{AgentJobHandler, NotifyJobHandler};
use agent_relay::bridge::{BackendGate, ExecutionBridge, LocalQueue, QueueName};
use agent_relay::config::{BackendKind, RelayConfig};
use agent_relay::delivery::{DirectSender, OutboundTransport, ReplySender, TelegramTransport};
use agent_relay::http::diagnostics_routes;
use agent_relay::store::JsonFileSessionStore;
use agent_relay::voice::{VoiceCapabilities, VoiceGuard, VoiceReply};
use agent_relay::worker::{Coordinator, DispatchRequest, Dispatcher};

fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "agent-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env().context("invalid configuration")?;
    // Keep the file writer flushing for the whole process.
    let _log_guard = init_tracing(config.log_dir.as_deref());
    config.dispatch.validate()?;

    let token = config
        .telegram_token
        .clone()
        .context("TELEGRAM_BOT_TOKEN not set")?;

    eprintln!("🛰  Agent Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Workers: {}..={} ({} attempts, {}s timeout)",
        agent_relay::config::FIRST_POOL_WORKER_ID,
        config.dispatch.max_workers,
        config.dispatch.attempts_per_task,
        config.dispatch.task_timeout.as_secs()
    );
    eprintln!("   Diagnostics: http://0.0.0.0:{}/api/diagnostics", config.http_port);

    // ── Delivery ────────────────────────────────────────────────────────
    let transport: Arc<dyn OutboundTransport> = Arc::new(TelegramTransport::new(token));
    let direct = Arc::new(DirectSender::new(transport, config.delivery.clone()));
    let runner: Arc<dyn AgentRunner> = Arc::new(CliAgentRunner::new(config.agent_cli.clone()));

    // ── Queue backend ───────────────────────────────────────────────────
    let (gate, local_queue) = match config.backend.kind {
        BackendKind::None => {
            eprintln!("   Queue backend: none (direct execution)");
            (Arc::new(BackendGate::disabled()), None)
        }
        BackendKind::Local => {
            let queue = LocalQueue::new(config.backend.job_attempts, config.backend.job_backoff);
            queue.spawn_consumers(
                QueueName::Agent,
                config.backend.agent_concurrency,
                Arc::new(AgentJobHandler::new(Arc::clone(&runner))),
            );
            queue.spawn_consumers(
                QueueName::Notify,
                config.backend.notify_concurrency,
                Arc::new(NotifyJobHandler::new(Arc::clone(&direct))),
            );
            eprintln!(
                "   Queue backend: local ({} agent / {} notify consumers)",
                config.backend.agent_concurrency, config.backend.notify_concurrency
            );
            let gate = BackendGate::new(Arc::new(queue.clone()), config.backend.init_retry_interval);
            (Arc::new(gate), Some(queue))
        }
    };

    // ── Dispatcher ──────────────────────────────────────────────────────
    let coordinator = Arc::new(Coordinator::new(&config.dispatch));
    let bridge = Arc::new(ExecutionBridge::new(
        Arc::clone(&gate),
        runner,
        config.backend.agent_wait_for_result,
    ));
    let replies = Arc::new(ReplySender::new(Arc::clone(&direct), Arc::clone(&gate)));
    let sessions = Arc::new(JsonFileSessionStore::new(&config.sessions_path));
    let dispatcher = Dispatcher::new(
        config.dispatch.clone(),
        Arc::clone(&coordinator),
        bridge,
        sessions,
        replies,
    );

    let voice = Arc::new(VoiceGuard::new(
        coordinator,
        direct,
        VoiceCapabilities::from_config(&config.voice, &config.agent_cli.workdir),
        config.voice.temp_dir.clone(),
    ));
    eprintln!(
        "   Voice replies: {}",
        if voice.is_enabled() { "enabled" } else { "disabled" }
    );

    // ── Event log ───────────────────────────────────────────────────────
    let mut events = dispatcher.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let payload = serde_json::to_string(&event).unwrap_or_default();
                    tracing::debug!(event_type = event.event_type(), event = %payload, "task_event");
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "task_event_log_lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    // ── HTTP ────────────────────────────────────────────────────────────
    let app = diagnostics_routes(dispatcher.clone());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port))
        .await
        .with_context(|| format!("failed to bind diagnostics port {}", config.http_port))?;
    tracing::info!(port = config.http_port, "diagnostics_server_started");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "diagnostics_server_failed");
        }
    });

    // ── Console / shutdown ──────────────────────────────────────────────
    match config.console_conversation.clone() {
        Some(conversation) => {
            eprintln!("   Console: dispatching stdin lines into {conversation}. /quit to exit.\n");
            tokio::select! {
                result = run_console(dispatcher, voice, conversation) => result?,
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => {
            eprintln!();
            tokio::signal::ctrl_c().await?;
        }
    }

    tracing::info!("shutting_down");
    if let Some(queue) = local_queue {
        queue.close();
    }
    Ok(())
}

/// Dispatch each stdin line as a goal; `/voice <text>` sends a voice reply.
async fn run_console(
    dispatcher: Dispatcher,
    voice: Arc<VoiceGuard>,
    conversation: String,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }

        if let Some(text) = line.strip_prefix("/voice ") {
            let reply = VoiceReply {
                conversation_id: conversation.clone(),
                text: text.to_string(),
                ..VoiceReply::default()
            };
            match voice.send_voice_reply(reply).await {
                Ok(outcome) => eprintln!("voice: {outcome:?}"),
                Err(e) => eprintln!("voice failed: {e}"),
            }
            continue;
        }

        let outcome = dispatcher.dispatch_request(DispatchRequest {
            conversation_id: conversation.clone(),
            goal: line.to_string(),
            request_id: Some(uuid::Uuid::new_v4().to_string()),
            ..DispatchRequest::default()
        });
        eprintln!("{}", outcome.acknowledgement());
    }
    Ok(())
}
