//! Task registry and admission control.
//!
//! The `Coordinator` owns every piece of contended dispatch state behind a
//! single mutex:
//! - task records and the worker lock table
//! - per-(conversation, agent) worker cursors
//! - the FIFO overflow queue of requests waiting for a worker
//! - the per-conversation "latest voice request" map
//!
//! Every method completes without awaiting, so callers never hold the lock
//! across I/O.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{DispatchConfig, FIRST_POOL_WORKER_ID};
use crate::error::TaskError;
use crate::worker::state::{TaskId, TaskRecord, TaskState, WorkerKey, WorkerLock};

/// A request waiting in the overflow queue for a free worker.
#[derive(Debug, Clone, Serialize)]
pub struct PendingDispatchItem {
    pub conversation_id: String,
    pub agent: String,
    pub model: Option<String>,
    pub goal: String,
    pub request_id: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

/// Result of trying to admit a request.
#[derive(Debug)]
pub enum Admission {
    /// A worker was locked and a pending task record created.
    Admitted(TaskRecord),
    /// No worker was free; the request joined the overflow queue.
    Queued { position: usize },
}

/// How a failed attempt was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Attempts remain; the task is back to pending.
    Retry,
    /// Attempts exhausted; the task is failed.
    Exhausted,
}

/// Point-in-time copy of registry state for diagnostics.
#[derive(Debug, Clone)]
pub struct RegistrySnapshot {
    pub locks: Vec<(WorkerLock, Option<TaskRecord>)>,
    pub pending: Vec<PendingDispatchItem>,
    pub tasks_tracked: usize,
}

#[derive(Default)]
struct RegistryState {
    tasks: HashMap<TaskId, TaskRecord>,
    locks: HashMap<WorkerKey, WorkerLock>,
    cursors: HashMap<(String, String), u32>,
    pending: VecDeque<PendingDispatchItem>,
    latest_voice: HashMap<String, String>,
}

impl RegistryState {
    fn is_worker_idle(&self, key: &WorkerKey) -> bool {
        self.locks.get(key).is_none_or(WorkerLock::is_free)
    }

    fn choose_idle_worker(
        &self,
        max_workers: u32,
        conversation_id: &str,
        agent: &str,
        preferred: Option<u32>,
        reserved: &HashSet<u32>,
    ) -> Option<u32> {
        let preferred = preferred
            .filter(|id| (FIRST_POOL_WORKER_ID..=max_workers).contains(id));
        preferred
            .into_iter()
            .chain((FIRST_POOL_WORKER_ID..=max_workers).filter(|id| Some(*id) != preferred))
            .filter(|id| !reserved.contains(id))
            .find(|id| self.is_worker_idle(&WorkerKey::new(conversation_id, agent, *id)))
    }

    fn next_preferred_worker_id(&mut self, max_workers: u32, conversation_id: &str, agent: &str) -> u32 {
        let cursor = self
            .cursors
            .entry((conversation_id.to_string(), agent.to_string()))
            .or_insert(FIRST_POOL_WORKER_ID - 1);
        let mut next = *cursor + 1;
        if next < FIRST_POOL_WORKER_ID || next > max_workers {
            next = FIRST_POOL_WORKER_ID;
        }
        *cursor = next;
        next
    }

    fn acquire_lock(
        &mut self,
        key: WorkerKey,
        task: &str,
        attempts_max: u32,
        timeout: Duration,
    ) -> Option<TaskRecord> {
        if !self.is_worker_idle(&key) {
            return None;
        }
        let record = TaskRecord::new(&key, task, attempts_max, timeout);
        self.locks.insert(key, WorkerLock::for_record(&record));
        self.tasks.insert(record.task_id.clone(), record.clone());
        Some(record)
    }

    fn pending_count(&self, conversation_id: &str, agent: Option<&str>) -> usize {
        self.pending
            .iter()
            .filter(|item| {
                item.conversation_id == conversation_id && agent.is_none_or(|a| item.agent == a)
            })
            .count()
    }

    /// Apply `mutate` and a state transition, then mirror onto the owning lock.
    fn transition(
        &mut self,
        task_id: &TaskId,
        to: TaskState,
        reason: Option<String>,
        mutate: impl FnOnce(&mut TaskRecord),
    ) -> Result<TaskRecord, TaskError> {
        let record = self
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
        // Validate before mutating so a rejected transition leaves no trace.
        if !record.state.can_transition_to(to) {
            return Err(TaskError::InvalidTransition {
                task_id: task_id.to_string(),
                from: record.state.to_string(),
                to: to.to_string(),
            });
        }
        mutate(record);
        record.transition_to(to, reason)?;
        let snapshot = record.clone();

        if let Some(lock) = self.locks.get_mut(&snapshot.key())
            && lock.task_id == *task_id
        {
            lock.mirror(&snapshot);
        }
        Ok(snapshot)
    }
}

/// Single owner of worker locks, task records, cursors, the overflow queue
/// and the voice-latest map.
pub struct Coordinator {
    max_workers: u32,
    attempts_per_task: u32,
    task_timeout: Duration,
    state: Mutex<RegistryState>,
}

impl Coordinator {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            max_workers: config.max_workers.max(FIRST_POOL_WORKER_ID),
            attempts_per_task: config.attempts_per_task.max(1),
            task_timeout: config.task_timeout,
            state: Mutex::new(RegistryState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn max_workers(&self) -> u32 {
        self.max_workers
    }

    // ── Admission control ───────────────────────────────────────────

    /// First worker id that is idle and not reserved, trying `preferred` first.
    pub fn choose_idle_worker(
        &self,
        conversation_id: &str,
        agent: &str,
        preferred: Option<u32>,
        reserved: &HashSet<u32>,
    ) -> Option<u32> {
        self.state()
            .choose_idle_worker(self.max_workers, conversation_id, agent, preferred, reserved)
    }

    /// Lock a worker and create its pending task record.
    ///
    /// Returns `None` when a non-terminal lock already holds the key.
    pub fn acquire_lock(
        &self,
        key: WorkerKey,
        task: &str,
        attempts_max: u32,
        timeout: Duration,
    ) -> Option<TaskRecord> {
        self.state().acquire_lock(key, task, attempts_max, timeout)
    }

    /// Remove the lock for `key` if it still belongs to `task_id`.
    ///
    /// Returns whether a lock was removed. Releasing twice is a no-op.
    pub fn release_lock(&self, key: &WorkerKey, task_id: &TaskId) -> bool {
        let mut state = self.state();
        let owned = state
            .locks
            .get(key)
            .is_some_and(|lock| lock.task_id == *task_id);
        if owned {
            state.locks.remove(key);
        }
        owned
    }

    /// Advance the round-robin cursor for (conversation, agent).
    pub fn next_preferred_worker_id(&self, conversation_id: &str, agent: &str) -> u32 {
        self.state()
            .next_preferred_worker_id(self.max_workers, conversation_id, agent)
    }

    /// Admit `item` onto an idle worker, or append it to the overflow queue.
    ///
    /// Both branches run in one critical section so a concurrent release
    /// cannot slip between the failed admission and the enqueue. While
    /// requests for the same (conversation, agent) are queued, newcomers
    /// queue behind them even if a worker has just turned free.
    pub fn admit_or_enqueue(&self, item: PendingDispatchItem) -> Admission {
        let mut state = self.state();
        let chosen = if state.pending_count(&item.conversation_id, Some(&item.agent)) > 0 {
            None
        } else {
            let preferred =
                state.next_preferred_worker_id(self.max_workers, &item.conversation_id, &item.agent);
            state.choose_idle_worker(
                self.max_workers,
                &item.conversation_id,
                &item.agent,
                Some(preferred),
                &HashSet::new(),
            )
        };
        if let Some(worker_id) = chosen {
            let key = WorkerKey::new(&item.conversation_id, &item.agent, worker_id);
            if let Some(record) =
                state.acquire_lock(key, &item.goal, self.attempts_per_task, self.task_timeout)
            {
                return Admission::Admitted(record);
            }
        }

        let conversation_id = item.conversation_id.clone();
        let agent = item.agent.clone();
        state.pending.push_back(item);
        Admission::Queued {
            position: state.pending_count(&conversation_id, Some(&agent)),
        }
    }

    /// One full pass over the overflow queue in arrival order.
    ///
    /// Every item that finds an idle worker is removed and returned with its
    /// new task record; items without a free worker keep their place.
    pub fn allocate_pending_pass(&self) -> Vec<(TaskRecord, PendingDispatchItem)> {
        let mut state = self.state();
        let mut allocated = Vec::new();
        let mut remaining = VecDeque::with_capacity(state.pending.len());

        while let Some(item) = state.pending.pop_front() {
            let preferred = state.next_preferred_worker_id(
                self.max_workers,
                &item.conversation_id,
                &item.agent,
            );
            let record = state
                .choose_idle_worker(
                    self.max_workers,
                    &item.conversation_id,
                    &item.agent,
                    Some(preferred),
                    &HashSet::new(),
                )
                .and_then(|worker_id| {
                    state.acquire_lock(
                        WorkerKey::new(&item.conversation_id, &item.agent, worker_id),
                        &item.goal,
                        self.attempts_per_task,
                        self.task_timeout,
                    )
                });
            match record {
                Some(record) => allocated.push((record, item)),
                None => remaining.push_back(item),
            }
        }

        state.pending = remaining;
        allocated
    }

    /// Whether any queued item could be allocated right now.
    pub fn can_allocate(&self) -> bool {
        let state = self.state();
        state.pending.iter().any(|item| {
            state
                .choose_idle_worker(
                    self.max_workers,
                    &item.conversation_id,
                    &item.agent,
                    None,
                    &HashSet::new(),
                )
                .is_some()
        })
    }

    /// Queued items for a conversation, optionally restricted to one agent.
    pub fn pending_count(&self, conversation_id: &str, agent: Option<&str>) -> usize {
        self.state().pending_count(conversation_id, agent)
    }

    pub fn pending_len(&self) -> usize {
        self.state().pending.len()
    }

    // ── Task lifecycle ──────────────────────────────────────────────

    /// Start the next attempt: `pending → running`, attempt + 1, error cleared.
    pub fn begin_attempt(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError> {
        let mut state = self.state();
        let record = state
            .tasks
            .get(task_id)
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
        if !record.has_attempts_left() {
            return Err(TaskError::InvalidTransition {
                task_id: task_id.to_string(),
                from: record.state.to_string(),
                to: format!("{} (attempt {} of {})", TaskState::Running, record.attempt + 1, record.attempts_max),
            });
        }
        state.transition(task_id, TaskState::Running, None, |rec| {
            rec.attempt += 1;
            rec.last_error = None;
            rec.job_id = None;
        })
    }

    /// `running → done`.
    pub fn complete(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError> {
        self.state()
            .transition(task_id, TaskState::Done, Some("completed".to_string()), |rec| {
                rec.last_error = None;
            })
    }

    /// Record a failed attempt: back to pending if attempts remain, else failed.
    pub fn record_failure(
        &self,
        task_id: &TaskId,
        error: &str,
    ) -> Result<(FailureOutcome, TaskRecord), TaskError> {
        let mut state = self.state();
        let exhausted = state
            .tasks
            .get(task_id)
            .map(|rec| !rec.has_attempts_left())
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
        let (outcome, to) = if exhausted {
            (FailureOutcome::Exhausted, TaskState::Failed)
        } else {
            (FailureOutcome::Retry, TaskState::Pending)
        };
        let record = state.transition(task_id, to, Some(error.to_string()), |rec| {
            rec.last_error = Some(error.to_string());
        })?;
        Ok((outcome, record))
    }

    /// Force a pending or running task to `failed`, mirroring onto its lock.
    ///
    /// Returns `None` when the task is already terminal.
    pub fn fail_task(&self, task_id: &TaskId, error: &str) -> Result<Option<TaskRecord>, TaskError> {
        let mut state = self.state();
        let record = state
            .tasks
            .get_mut(task_id)
            .ok_or_else(|| TaskError::NotFound(task_id.to_string()))?;
        if !record.abandon(error) {
            return Ok(None);
        }
        let snapshot = record.clone();
        if let Some(lock) = state.locks.get_mut(&snapshot.key())
            && lock.task_id == *task_id
        {
            lock.mirror(&snapshot);
        }
        Ok(Some(snapshot))
    }

    /// Record the backend job that is serving the current attempt.
    pub fn record_job_id(&self, task_id: &TaskId, job_id: &str) {
        if let Some(record) = self.state().tasks.get_mut(task_id) {
            record.job_id = Some(job_id.to_string());
        }
    }

    /// Refresh `updated_at` on the task and its lock.
    pub fn touch_heartbeat(&self, task_id: &TaskId) {
        let mut state = self.state();
        let now = Utc::now();
        let Some(record) = state.tasks.get_mut(task_id) else {
            return;
        };
        record.updated_at = now;
        let key = record.key();
        if let Some(lock) = state.locks.get_mut(&key)
            && lock.task_id == *task_id
        {
            lock.updated_at = now;
        }
    }

    pub fn task(&self, task_id: &TaskId) -> Option<TaskRecord> {
        self.state().tasks.get(task_id).cloned()
    }

    pub fn lock_for(&self, key: &WorkerKey) -> Option<WorkerLock> {
        self.state().locks.get(key).cloned()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state();
        RegistrySnapshot {
            locks: state
                .locks
                .values()
                .map(|lock| (lock.clone(), state.tasks.get(&lock.task_id).cloned()))
                .collect(),
            pending: state.pending.iter().cloned().collect(),
            tasks_tracked: state.tasks.len(),
        }
    }

    // ── Voice request registry ──────────────────────────────────────

    /// Make `request_id` the conversation's latest voice request.
    pub fn register_voice_request(&self, conversation_id: &str, request_id: &str) {
        self.state()
            .latest_voice
            .insert(conversation_id.to_string(), request_id.to_string());
    }

    pub fn is_latest_voice_request(&self, conversation_id: &str, request_id: &str) -> bool {
        self.state()
            .latest_voice
            .get(conversation_id)
            .is_some_and(|latest| latest == request_id)
    }

    pub fn latest_voice_request(&self, conversation_id: &str) -> Option<String> {
        self.state().latest_voice.get(conversation_id).cloned()
    }

    /// Clear the entry only if `request_id` still owns it.
    pub fn clear_voice_request_if_latest(&self, conversation_id: &str, request_id: &str) -> bool {
        let mut state = self.state();
        if state
            .latest_voice
            .get(conversation_id)
            .is_some_and(|latest| latest == request_id)
        {
            state.latest_voice.remove(conversation_id);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator(max_workers: u32) -> Coordinator {
        Coordinator::new(&DispatchConfig {
            max_workers,
            attempts_per_task: 2,
            task_timeout: Duration::from_secs(5),
            ..DispatchConfig::default()
        })
    }

    fn item(conversation: &str, agent: &str, goal: &str) -> PendingDispatchItem {
        PendingDispatchItem {
            conversation_id: conversation.to_string(),
            agent: agent.to_string(),
            model: None,
            goal: goal.to_string(),
            request_id: None,
            enqueued_at: Utc::now(),
        }
    }

    fn lock(c: &Coordinator, worker_id: u32) -> TaskRecord {
        c.acquire_lock(
            WorkerKey::new("chat", "codex", worker_id),
            "busy",
            1,
            Duration::from_secs(5),
        )
        .expect("worker should be free")
    }

    #[test]
    fn chooses_idle_worker_when_preferred_is_locked() {
        let c = coordinator(4);
        lock(&c, 3);
        let chosen = c.choose_idle_worker("chat", "codex", Some(3), &HashSet::new());
        assert_eq!(chosen, Some(2));
    }

    #[test]
    fn prefers_requested_worker_when_idle() {
        let c = coordinator(4);
        assert_eq!(c.choose_idle_worker("chat", "codex", Some(4), &HashSet::new()), Some(4));
        // Out of range preference is ignored.
        assert_eq!(c.choose_idle_worker("chat", "codex", Some(1), &HashSet::new()), Some(2));
        assert_eq!(c.choose_idle_worker("chat", "codex", Some(9), &HashSet::new()), Some(2));
    }

    #[test]
    fn respects_locks_and_reserved_workers() {
        let c = coordinator(4);
        lock(&c, 2);
        let reserved = HashSet::from([3]);
        assert_eq!(c.choose_idle_worker("chat", "codex", Some(3), &reserved), Some(4));

        lock(&c, 4);
        assert_eq!(c.choose_idle_worker("chat", "codex", None, &reserved), None);
        // Locks are scoped per (conversation, agent).
        assert_eq!(c.choose_idle_worker("chat", "claude", None, &reserved), Some(2));
        assert_eq!(c.choose_idle_worker("other", "codex", None, &reserved), Some(2));
    }

    #[test]
    fn acquire_fails_while_lock_is_held() {
        let c = coordinator(3);
        let first = lock(&c, 2);
        assert!(c
            .acquire_lock(WorkerKey::new("chat", "codex", 2), "again", 1, Duration::from_secs(1))
            .is_none());
        assert_eq!(first.state, TaskState::Pending);
        let held = c.lock_for(&first.key()).unwrap();
        assert_eq!(held.task_id, first.task_id);
    }

    #[test]
    fn terminal_lock_does_not_occupy_worker() {
        let c = coordinator(3);
        let rec = lock(&c, 2);
        c.begin_attempt(&rec.task_id).unwrap();
        c.complete(&rec.task_id).unwrap();
        assert_eq!(c.choose_idle_worker("chat", "codex", Some(2), &HashSet::new()), Some(2));

        let next = c
            .acquire_lock(rec.key(), "next", 1, Duration::from_secs(1))
            .expect("terminal lock is reusable");
        // The stale owner can no longer release the reassigned lock.
        assert!(!c.release_lock(&rec.key(), &rec.task_id));
        assert!(c.release_lock(&next.key(), &next.task_id));
    }

    #[test]
    fn release_is_idempotent() {
        let c = coordinator(3);
        let rec = lock(&c, 2);
        assert!(c.release_lock(&rec.key(), &rec.task_id));
        assert!(!c.release_lock(&rec.key(), &rec.task_id));
        assert!(c.lock_for(&rec.key()).is_none());
        // The record stays for diagnostics.
        assert!(c.task(&rec.task_id).is_some());
    }

    #[test]
    fn cursor_round_robins_and_wraps() {
        let c = coordinator(4);
        let ids: Vec<u32> = (0..5).map(|_| c.next_preferred_worker_id("chat", "codex")).collect();
        assert_eq!(ids, vec![2, 3, 4, 2, 3]);
        assert_eq!(c.next_preferred_worker_id("chat", "claude"), 2);
    }

    #[test]
    fn admit_assigns_distinct_workers_then_queues() {
        let c = coordinator(3);
        let mut workers = HashSet::new();
        for n in 0..2 {
            match c.admit_or_enqueue(item("chat", "codex", &format!("goal {n}"))) {
                Admission::Admitted(rec) => assert!(workers.insert(rec.worker_id)),
                Admission::Queued { .. } => panic!("worker should be free"),
            }
        }
        assert_eq!(workers, HashSet::from([2, 3]));

        assert!(matches!(
            c.admit_or_enqueue(item("chat", "codex", "overflow 1")),
            Admission::Queued { position: 1 }
        ));
        assert!(matches!(
            c.admit_or_enqueue(item("chat", "codex", "overflow 2")),
            Admission::Queued { position: 2 }
        ));
        assert_eq!(c.pending_count("chat", Some("codex")), 2);
        assert_eq!(c.pending_count("chat", None), 2);
        assert_eq!(c.pending_count("chat", Some("claude")), 0);
    }

    #[test]
    fn allocation_preserves_arrival_order() {
        let c = coordinator(3);
        let a = lock(&c, 2);
        let b = lock(&c, 3);
        for goal in ["first", "second", "third"] {
            c.admit_or_enqueue(item("chat", "codex", goal));
        }
        assert!(c.allocate_pending_pass().is_empty());
        assert!(!c.can_allocate());

        c.release_lock(&b.key(), &b.task_id);
        assert!(c.can_allocate());
        let allocated = c.allocate_pending_pass();
        assert_eq!(allocated.len(), 1);
        assert_eq!(allocated[0].1.goal, "first");
        assert_eq!(allocated[0].0.worker_id, 3);

        c.release_lock(&a.key(), &a.task_id);
        let allocated = c.allocate_pending_pass();
        assert_eq!(allocated.len(), 1);
        assert_eq!(allocated[0].1.goal, "second");
        assert_eq!(c.pending_len(), 1);
    }

    #[test]
    fn newcomer_queues_behind_waiting_requests() {
        let c = coordinator(2);
        let busy = lock(&c, 2);
        assert!(matches!(
            c.admit_or_enqueue(item("chat", "codex", "waiting")),
            Admission::Queued { position: 1 }
        ));

        // Worker 2 turns free but the pump has not run yet.
        c.begin_attempt(&busy.task_id).unwrap();
        c.complete(&busy.task_id).unwrap();
        assert!(matches!(
            c.admit_or_enqueue(item("chat", "codex", "newcomer")),
            Admission::Queued { position: 2 }
        ));
        // Other keys are not held back.
        assert!(matches!(
            c.admit_or_enqueue(item("chat", "claude", "unrelated")),
            Admission::Admitted(_)
        ));

        let allocated = c.allocate_pending_pass();
        assert_eq!(allocated.len(), 1);
        assert_eq!(allocated[0].1.goal, "waiting");
        assert_eq!(c.pending_count("chat", Some("codex")), 1);
    }

    #[test]
    fn fail_task_forces_failed_and_mirrors_lock() {
        let c = coordinator(3);
        let rec = lock(&c, 2);
        c.begin_attempt(&rec.task_id).unwrap();

        let failed = c
            .fail_task(&rec.task_id, "Task panicked: boom")
            .unwrap()
            .expect("running task is failed");
        assert_eq!(failed.state, TaskState::Failed);
        assert!(failed.finished_at.is_some());
        let held = c.lock_for(&rec.key()).unwrap();
        assert_eq!(held.state, TaskState::Failed);
        assert_eq!(held.last_error.as_deref(), Some("Task panicked: boom"));

        // Terminal records are left alone.
        assert!(c.fail_task(&rec.task_id, "again").unwrap().is_none());
        assert_eq!(
            c.task(&rec.task_id).unwrap().last_error.as_deref(),
            Some("Task panicked: boom")
        );
        assert!(matches!(
            c.fail_task(&TaskId::generate(&rec.key()), "x"),
            Err(TaskError::NotFound(_))
        ));
    }

    #[test]
    fn allocation_skips_items_without_free_worker() {
        let c = coordinator(2);
        lock(&c, 2);
        c.admit_or_enqueue(item("chat", "codex", "blocked"));
        // Other agents and conversations have their own worker slots.
        c.admit_or_enqueue(item("chat", "claude", "free"));
        c.admit_or_enqueue(item("other", "codex", "other-free"));
        assert_eq!(c.pending_len(), 1);
        let allocated = c.allocate_pending_pass();
        assert!(allocated.is_empty());
        assert_eq!(c.pending_len(), 1);
    }

    #[test]
    fn attempts_never_exceed_max() {
        let c = coordinator(3);
        let rec = c
            .acquire_lock(WorkerKey::new("chat", "codex", 2), "flaky", 2, Duration::from_secs(1))
            .unwrap();

        let running = c.begin_attempt(&rec.task_id).unwrap();
        assert_eq!(running.attempt, 1);
        let (outcome, pending) = c.record_failure(&rec.task_id, "boom").unwrap();
        assert_eq!(outcome, FailureOutcome::Retry);
        assert_eq!(pending.state, TaskState::Pending);
        assert_eq!(pending.last_error.as_deref(), Some("boom"));

        let running = c.begin_attempt(&rec.task_id).unwrap();
        assert_eq!(running.attempt, 2);
        assert!(running.last_error.is_none());
        let (outcome, failed) = c.record_failure(&rec.task_id, "boom again").unwrap();
        assert_eq!(outcome, FailureOutcome::Exhausted);
        assert_eq!(failed.state, TaskState::Failed);

        assert!(c.begin_attempt(&rec.task_id).is_err());
        assert_eq!(c.task(&rec.task_id).unwrap().attempt, 2);

        let lock = c.lock_for(&rec.key()).unwrap();
        assert_eq!(lock.state, TaskState::Failed);
        assert_eq!(lock.attempt, 2);
        assert_eq!(lock.last_error.as_deref(), Some("boom again"));
    }

    #[test]
    fn heartbeat_touches_task_and_lock() {
        let c = coordinator(3);
        let rec = lock(&c, 2);
        std::thread::sleep(Duration::from_millis(5));
        c.touch_heartbeat(&rec.task_id);
        let touched = c.task(&rec.task_id).unwrap();
        assert!(touched.updated_at > rec.updated_at);
        assert_eq!(c.lock_for(&rec.key()).unwrap().updated_at, touched.updated_at);
        assert_eq!(touched.state, TaskState::Pending);
    }

    #[test]
    fn voice_registry_latest_wins() {
        let c = coordinator(3);
        c.register_voice_request("chat", "req-1");
        assert!(c.is_latest_voice_request("chat", "req-1"));
        c.register_voice_request("chat", "req-2");
        assert!(!c.is_latest_voice_request("chat", "req-1"));

        assert!(!c.clear_voice_request_if_latest("chat", "req-1"));
        assert_eq!(c.latest_voice_request("chat").as_deref(), Some("req-2"));
        assert!(c.clear_voice_request_if_latest("chat", "req-2"));
        assert!(c.latest_voice_request("chat").is_none());
    }

    #[test]
    fn snapshot_copies_locks_and_queue() {
        let c = coordinator(2);
        let rec = lock(&c, 2);
        c.admit_or_enqueue(item("chat", "codex", "waiting"));
        let snap = c.snapshot();
        assert_eq!(snap.locks.len(), 1);
        assert_eq!(snap.locks[0].0.task_id, rec.task_id);
        assert!(snap.locks[0].1.is_some());
        assert_eq!(snap.pending.len(), 1);
        assert_eq!(snap.tasks_tracked, 1);
    }
}
