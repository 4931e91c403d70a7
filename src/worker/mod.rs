//! Worker pool: admission control, retries and dispatch.
//!
//! Core components:
//! - `state`: task state machine (Pending → Running → Done/Failed) and lock records
//! - `registry`: `Coordinator` owning locks, tasks, cursors, the overflow queue and voice ownership
//! - `executor`: retrying executor with heartbeat and per-attempt timeout
//! - `scheduler`: `Dispatcher` entry point, queue pump and completion notices
//! - `events`: broadcast lifecycle events

pub mod events;
pub mod executor;
pub mod registry;
pub mod scheduler;
pub mod state;

pub use events::TaskEvent;
pub use executor::{Executor, TaskOptions, TaskSuccess};
pub use registry::{Admission, Coordinator, PendingDispatchItem};
pub use scheduler::{DispatchOutcome, DispatchRequest, Dispatcher};
pub use state::{TaskId, TaskRecord, TaskState, WorkerKey, WorkerLock};
