use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::SessionStore;
use crate::error::StoreError;
use crate::worker::state::WorkerKey;

/// In-memory session store. Sessions are lost on restart.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<WorkerKey, String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get_worker_session(&self, key: &WorkerKey) -> Result<Option<String>, StoreError> {
        Ok(self.sessions.read().await.get(key).cloned())
    }

    async fn set_worker_session(&self, key: &WorkerKey, session_id: &str) -> Result<(), StoreError> {
        self.sessions
            .write()
            .await
            .insert(key.clone(), session_id.to_string());
        Ok(())
    }

    async fn clear_worker_session(&self, key: &WorkerKey) -> Result<(), StoreError> {
        self.sessions.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sessions_are_scoped_per_worker() {
        let store = MemorySessionStore::new();
        let w2 = WorkerKey::new("chat", "codex", 2);
        let w3 = WorkerKey::new("chat", "codex", 3);

        store.set_worker_session(&w2, "s-2").await.unwrap();
        assert_eq!(store.get_worker_session(&w2).await.unwrap().as_deref(), Some("s-2"));
        assert!(store.get_worker_session(&w3).await.unwrap().is_none());

        store.clear_worker_session(&w2).await.unwrap();
        assert!(store.get_worker_session(&w2).await.unwrap().is_none());
    }
}
