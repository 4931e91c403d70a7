use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::SessionStore;
use crate::error::StoreError;
use crate::worker::state::WorkerKey;

/// Session store backed by a JSON file.
///
/// The file maps `conversation:agent:worker` keys to session ids. It is read
/// once on first access and rewritten through a temp file on every change.
pub struct JsonFileSessionStore {
    path: PathBuf,
    cache: Mutex<Option<BTreeMap<String, String>>>,
}

impl JsonFileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: Mutex::new(None),
        }
    }

    async fn load(&self) -> Result<BTreeMap<String, String>, StoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) if raw.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn persist(&self, sessions: &BTreeMap<String, String>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(sessions)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), entries = sessions.len(), "sessions_persisted");
        Ok(())
    }

    /// Run `f` against the loaded map, persisting if it reports a change.
    async fn with_sessions<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, String>) -> (T, bool),
    ) -> Result<T, StoreError> {
        let mut cache = self.cache.lock().await;
        if cache.is_none() {
            *cache = Some(self.load().await?);
        }
        let sessions = cache.get_or_insert_with(BTreeMap::new);
        let (value, changed) = f(sessions);
        if changed {
            self.persist(sessions).await?;
        }
        Ok(value)
    }
}

fn session_key(key: &WorkerKey) -> String {
    key.to_string()
}

#[async_trait]
impl SessionStore for JsonFileSessionStore {
    async fn get_worker_session(&self, key: &WorkerKey) -> Result<Option<String>, StoreError> {
        self.with_sessions(|sessions| (sessions.get(&session_key(key)).cloned(), false))
            .await
    }

    async fn set_worker_session(&self, key: &WorkerKey, session_id: &str) -> Result<(), StoreError> {
        self.with_sessions(|sessions| {
            let previous = sessions.insert(session_key(key), session_id.to_string());
            ((), previous.as_deref() != Some(session_id))
        })
        .await
    }

    async fn clear_worker_session(&self, key: &WorkerKey) -> Result<(), StoreError> {
        self.with_sessions(|sessions| ((), sessions.remove(&session_key(key)).is_some()))
            .await
    }
}
