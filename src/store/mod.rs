//! Session persistence.
//!
//! Agent CLIs return a session id that lets the next call resume the same
//! conversation. Sessions are kept per worker slot so parallel workers in
//! one conversation never share a session.

pub mod file;
pub mod memory;

pub use file::JsonFileSessionStore;
pub use memory::MemorySessionStore;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::worker::state::WorkerKey;

/// Per-worker session id storage.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_worker_session(&self, key: &WorkerKey) -> Result<Option<String>, StoreError>;

    async fn set_worker_session(&self, key: &WorkerKey, session_id: &str) -> Result<(), StoreError>;

    async fn clear_worker_session(&self, key: &WorkerKey) -> Result<(), StoreError>;
}
