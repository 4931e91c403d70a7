//! Read-only diagnostics snapshot of workers, locks and queue health.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::bridge::{BackendGate, JobCounts, QueueName};
use crate::config::DispatchConfig;
use crate::worker::registry::RegistrySnapshot;
use crate::worker::scheduler::Dispatcher;
use crate::worker::state::{TaskState, WorkerLock};

/// Which locks and workers a snapshot covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticsScope {
    Global,
    Conversation(String),
}

impl DiagnosticsScope {
    /// Parse `global` or `conversation` (alias `chat`); the latter needs an id.
    pub fn parse(scope: Option<&str>, conversation_id: Option<&str>) -> Result<Self, String> {
        let conversation_id = conversation_id.map(str::trim).filter(|c| !c.is_empty());
        match scope.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("global") => Ok(Self::Global),
            Some("conversation") | Some("chat") => conversation_id
                .map(|id| Self::Conversation(id.to_string()))
                .ok_or_else(|| "conversation scope requires conversation_id".to_string()),
            Some(other) => Err(format!("unknown diagnostics scope: {other}")),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Conversation(_) => "conversation",
        }
    }

    fn includes(&self, conversation_id: &str) -> bool {
        match self {
            Self::Global => true,
            Self::Conversation(id) => id == conversation_id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub scope: &'static str,
    pub conversation_id: Option<String>,
    pub workers: WorkerSummary,
    pub locks: Vec<LockDiagnostics>,
    pub queue: QueueHealth,
    pub runtime: RuntimeStats,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSummary {
    pub total: usize,
    pub busy: usize,
    pub idle: usize,
    pub list: Vec<WorkerStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub worker_id: u32,
    /// `idle`, or the state of the first active lock.
    pub state: String,
    pub current_task_id: Option<String>,
    pub active_locks: usize,
    pub active_conversations: Vec<String>,
    pub active_agents: Vec<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LockDiagnostics {
    pub task_id: String,
    /// `<agent>:worker-<id>`
    pub lock_owner: String,
    pub conversation_id: String,
    pub worker_id: u32,
    pub state: TaskState,
    pub acquired_at: DateTime<Utc>,
    pub ttl_ms: u64,
    pub ttl_remaining_ms: u64,
    pub heartbeat_age_ms: u64,
    pub stale_lock: bool,
    pub attempt: u32,
    pub last_error: Option<String>,
    pub job_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueHealth {
    pub enabled: bool,
    pub ready: bool,
    pub backend: Option<String>,
    pub agent: Option<QueueSnapshot>,
    pub notify: Option<QueueSnapshot>,
    pub pending_dispatches: usize,
    pub oldest_pending_age_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub consumers_online: usize,
    pub counts: Option<JobCounts>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStats {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
    pub uptime_sec: u64,
    pub request_timeout_ms: u64,
    pub max_workers: u32,
    pub tasks_tracked: usize,
}

fn millis_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> u64 {
    (later - earlier).num_milliseconds().max(0) as u64
}

/// Gather a snapshot from a running dispatcher.
pub async fn collect(dispatcher: &Dispatcher, scope: &DiagnosticsScope) -> DiagnosticsSnapshot {
    let registry = dispatcher.coordinator().snapshot();
    let queue = queue_health(dispatcher.gate()).await;
    assemble(
        &registry,
        scope,
        dispatcher.config(),
        queue,
        dispatcher.started_at(),
        Utc::now(),
    )
}

/// Backend state as last observed. Never triggers initialization.
async fn queue_health(gate: &BackendGate) -> QueueHealth {
    let mut health = QueueHealth {
        enabled: gate.is_enabled(),
        ready: gate.is_ready(),
        ..QueueHealth::default()
    };
    let Some(backend) = gate.backend() else {
        return health;
    };
    health.backend = Some(backend.name().to_string());
    if !health.ready {
        return health;
    }

    for queue in QueueName::ALL {
        let consumers_online = match backend.consumer_count(queue).await {
            Ok(count) => count,
            Err(e) => {
                warn!(queue = %queue, error = %e, "queue_workers_count_failed");
                0
            }
        };
        let counts = match backend.job_counts(queue).await {
            Ok(counts) => Some(counts),
            Err(e) => {
                warn!(queue = %queue, error = %e, "queue_counts_failed");
                None
            }
        };
        let snapshot = Some(QueueSnapshot {
            consumers_online,
            counts,
        });
        match queue {
            QueueName::Agent => health.agent = snapshot,
            QueueName::Notify => health.notify = snapshot,
        }
    }
    health
}

/// Build the snapshot from already-gathered state.
pub fn assemble(
    registry: &RegistrySnapshot,
    scope: &DiagnosticsScope,
    config: &DispatchConfig,
    mut queue: QueueHealth,
    started_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> DiagnosticsSnapshot {
    let scoped: Vec<_> = registry
        .locks
        .iter()
        .filter(|(lock, _)| scope.includes(&lock.key.conversation_id))
        .collect();

    let mut locks: Vec<LockDiagnostics> = scoped
        .iter()
        .map(|(lock, task)| {
            let acquired_at = task.as_ref().map_or(lock.updated_at, |t| t.created_at);
            let ttl = task.as_ref().map_or(config.task_timeout, |t| t.timeout);
            let ttl_ms = ttl.as_millis() as u64;
            let age_ms = millis_between(acquired_at, now);
            let heartbeat_age_ms = millis_between(lock.updated_at, now);
            LockDiagnostics {
                task_id: lock.task_id.to_string(),
                lock_owner: format!("{}:worker-{}", lock.key.agent, lock.key.worker_id),
                conversation_id: lock.key.conversation_id.clone(),
                worker_id: lock.key.worker_id,
                state: lock.state,
                acquired_at,
                ttl_ms,
                ttl_remaining_ms: ttl_ms.saturating_sub(age_ms),
                heartbeat_age_ms,
                stale_lock: !lock.state.is_terminal() && ttl_ms > 0 && heartbeat_age_ms > ttl_ms,
                attempt: lock.attempt,
                last_error: lock.last_error.clone(),
                job_id: task.as_ref().and_then(|t| t.job_id.clone()),
            }
        })
        .collect();
    locks.sort_by(|a, b| {
        a.worker_id
            .cmp(&b.worker_id)
            .then_with(|| a.conversation_id.cmp(&b.conversation_id))
    });

    let active: Vec<&WorkerLock> = scoped
        .iter()
        .map(|(lock, _)| lock)
        .filter(|lock| !lock.state.is_terminal())
        .collect();
    let list: Vec<WorkerStatus> = config
        .pool_worker_ids()
        .map(|worker_id| worker_status(worker_id, &active))
        .collect();
    let busy = list.iter().filter(|w| w.active_locks > 0).count();

    let pending: Vec<_> = registry
        .pending
        .iter()
        .filter(|item| scope.includes(&item.conversation_id))
        .collect();
    queue.pending_dispatches = pending.len();
    queue.oldest_pending_age_ms = pending
        .iter()
        .map(|item| item.enqueued_at)
        .min()
        .map(|at| millis_between(at, now));

    DiagnosticsSnapshot {
        timestamp: now,
        scope: scope.as_str(),
        conversation_id: match scope {
            DiagnosticsScope::Global => None,
            DiagnosticsScope::Conversation(id) => Some(id.clone()),
        },
        workers: WorkerSummary {
            total: list.len(),
            busy,
            idle: list.len() - busy,
            list,
        },
        locks,
        queue,
        runtime: RuntimeStats {
            pid: std::process::id(),
            started_at,
            uptime_sec: (now - started_at).num_seconds().max(0) as u64,
            request_timeout_ms: config.task_timeout.as_millis() as u64,
            max_workers: config.max_workers,
            tasks_tracked: registry.tasks_tracked,
        },
    }
}

fn worker_status(worker_id: u32, active: &[&WorkerLock]) -> WorkerStatus {
    let mine: Vec<&&WorkerLock> = active
        .iter()
        .filter(|lock| lock.key.worker_id == worker_id)
        .collect();
    let conversations: BTreeSet<String> = mine.iter().map(|l| l.key.conversation_id.clone()).collect();
    let agents: BTreeSet<String> = mine.iter().map(|l| l.key.agent.clone()).collect();
    WorkerStatus {
        worker_id,
        state: mine
            .first()
            .map_or_else(|| "idle".to_string(), |l| l.state.to_string()),
        current_task_id: mine.first().map(|l| l.task_id.to_string()),
        active_locks: mine.len(),
        active_conversations: conversations.into_iter().collect(),
        active_agents: agents.into_iter().collect(),
        last_heartbeat: mine.iter().map(|l| l.updated_at).max(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::worker::registry::PendingDispatchItem;
    use crate::worker::state::{TaskRecord, WorkerKey};

    fn config() -> DispatchConfig {
        DispatchConfig {
            max_workers: 4,
            task_timeout: Duration::from_secs(5),
            ..DispatchConfig::default()
        }
    }

    fn running_lock(conversation: &str, worker_id: u32, age: Duration) -> (WorkerLock, Option<TaskRecord>) {
        let key = WorkerKey::new(conversation, "codex", worker_id);
        let mut record = TaskRecord::new(&key, "long task", 2, Duration::from_secs(5));
        record.transition_to(TaskState::Running, None).unwrap();
        record.attempt = 1;
        let then = Utc::now() - chrono::Duration::from_std(age).unwrap();
        record.created_at = then;
        record.updated_at = then;
        let lock = WorkerLock::for_record(&record);
        (lock, Some(record))
    }

    #[test]
    fn scope_parsing() {
        assert_eq!(DiagnosticsScope::parse(None, None).unwrap(), DiagnosticsScope::Global);
        assert_eq!(
            DiagnosticsScope::parse(Some("chat"), Some("42")).unwrap(),
            DiagnosticsScope::Conversation("42".into())
        );
        assert!(DiagnosticsScope::parse(Some("conversation"), None).is_err());
        assert!(DiagnosticsScope::parse(Some("everything"), None).is_err());
    }

    #[test]
    fn overdue_lock_is_stale_with_no_ttl_left() {
        let registry = RegistrySnapshot {
            locks: vec![
                running_lock("chat-a", 3, Duration::from_secs(30)),
                running_lock("chat-a", 2, Duration::from_secs(1)),
            ],
            pending: Vec::new(),
            tasks_tracked: 2,
        };
        let snap = assemble(
            &registry,
            &DiagnosticsScope::Global,
            &config(),
            QueueHealth::default(),
            Utc::now(),
            Utc::now(),
        );

        assert_eq!(snap.locks.len(), 2);
        let fresh = &snap.locks[0];
        assert_eq!(fresh.worker_id, 2);
        assert!(!fresh.stale_lock);
        assert!(fresh.ttl_remaining_ms > 0);

        let overdue = &snap.locks[1];
        assert_eq!(overdue.worker_id, 3);
        assert!(overdue.stale_lock);
        assert_eq!(overdue.ttl_remaining_ms, 0);
        assert_eq!(overdue.lock_owner, "codex:worker-3");

        assert_eq!(snap.workers.total, 3);
        assert_eq!(snap.workers.busy, 2);
        assert_eq!(snap.workers.idle, 1);
        assert_eq!(snap.workers.list[2].state, "idle");
    }

    #[test]
    fn conversation_scope_filters_locks_and_pending() {
        let enqueued_at = Utc::now() - chrono::Duration::seconds(2);
        let registry = RegistrySnapshot {
            locks: vec![
                running_lock("chat-a", 2, Duration::from_secs(1)),
                running_lock("chat-b", 2, Duration::from_secs(1)),
            ],
            pending: vec![PendingDispatchItem {
                conversation_id: "chat-b".into(),
                agent: "codex".into(),
                model: None,
                goal: "later".into(),
                request_id: None,
                enqueued_at,
            }],
            tasks_tracked: 2,
        };
        let scope = DiagnosticsScope::Conversation("chat-b".into());
        let snap = assemble(&registry, &scope, &config(), QueueHealth::default(), Utc::now(), Utc::now());

        assert_eq!(snap.locks.len(), 1);
        assert_eq!(snap.locks[0].conversation_id, "chat-b");
        assert_eq!(snap.queue.pending_dispatches, 1);
        assert!(snap.queue.oldest_pending_age_ms.unwrap() >= 2000);

        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["scope"], "conversation");
        assert_eq!(json["conversationId"], "chat-b");
        assert!(json["locks"][0]["staleLock"].is_boolean());
        assert!(json["queue"]["pendingDispatches"].is_number());
        assert!(json["runtime"]["requestTimeoutMs"].is_number());
    }

    #[tokio::test]
    async fn queue_health_does_not_initialize_backend() {
        use std::sync::Arc;
        use std::sync::atomic::Ordering;

        use crate::bridge::gate::testing::ScriptedBackend;

        let backend = Arc::new(ScriptedBackend::new(true, 1));
        let gate = BackendGate::new(backend.clone(), Duration::from_secs(5));
        let health = queue_health(&gate).await;
        assert!(health.enabled);
        assert!(!health.ready);
        assert!(health.agent.is_none());
        assert_eq!(backend.init_calls.load(Ordering::SeqCst), 0);

        assert!(gate.ensure_ready().await);
        let health = queue_health(&gate).await;
        assert_eq!(health.agent.unwrap().consumers_online, 1);
        assert_eq!(health.backend.as_deref(), Some("scripted"));
    }
}
