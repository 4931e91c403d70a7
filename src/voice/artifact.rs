//! Temporary voice artifacts and voice file validation.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::AsyncReadExt;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::VoiceError;
use crate::worker::registry::Coordinator;

/// Extensions Telegram accepts for voice notes.
pub const SUPPORTED_EXTENSIONS: [&str; 2] = ["ogg", "opus"];

const OGG_MAGIC: &[u8; 4] = b"OggS";

/// Owner of one voice request's registry entry and its temp files.
///
/// Every path handed out by `allocate` is deleted when the set drops, and
/// the request's "latest voice request" entry is cleared if it still owns
/// it. Cleanup runs on every exit path, including early returns and errors.
pub struct VoiceArtifacts {
    dir: PathBuf,
    paths: Mutex<Vec<PathBuf>>,
    binding: Option<RegistryBinding>,
}

struct RegistryBinding {
    coordinator: Arc<Coordinator>,
    conversation_id: String,
    request_id: String,
}

impl VoiceArtifacts {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            paths: Mutex::new(Vec::new()),
            binding: None,
        }
    }

    /// Clear `request_id` from the voice registry on drop, if still latest.
    pub fn bound_to(mut self, coordinator: Arc<Coordinator>, conversation_id: &str, request_id: &str) -> Self {
        self.binding = Some(RegistryBinding {
            coordinator,
            conversation_id: conversation_id.to_string(),
            request_id: request_id.to_string(),
        });
        self
    }

    pub async fn ensure_dir(&self) -> Result<(), VoiceError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    /// Reserve a fresh temp path. The file is removed when the set drops.
    pub fn allocate(&self, prefix: &str, extension: &str) -> PathBuf {
        let nonce = Uuid::new_v4().simple().to_string();
        let path = self.dir.join(format!(
            "{prefix}-{}-{}.{extension}",
            chrono::Utc::now().timestamp_millis(),
            &nonce[..12]
        ));
        self.paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(path.clone());
        path
    }

    pub fn tracked(&self) -> Vec<PathBuf> {
        self.paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for VoiceArtifacts {
    fn drop(&mut self) {
        if let Some(binding) = &self.binding {
            binding
                .coordinator
                .clear_voice_request_if_latest(&binding.conversation_id, &binding.request_id);
        }

        let paths = std::mem::take(self.paths.get_mut().unwrap_or_else(PoisonError::into_inner));
        for path in paths {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "voice_artifact_removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "voice_artifact_cleanup_failed"),
            }
        }
    }
}

/// Fail with `MissingArtifact` unless `path` exists.
pub async fn ensure_artifact(path: &Path) -> Result<(), VoiceError> {
    match tokio::fs::try_exists(path).await {
        Ok(true) => Ok(()),
        _ => Err(VoiceError::MissingArtifact(path.to_path_buf())),
    }
}

/// Check that `path` is a non-empty OGG/Opus file.
pub async fn validate_voice_file(path: &Path) -> Result<(), VoiceError> {
    let display = path.display();
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|_| VoiceError::InvalidFile(format!("Voice file not found: {display}")))?;
    if !metadata.is_file() {
        return Err(VoiceError::InvalidFile(format!("Voice path is not a file: {display}")));
    }
    if metadata.len() == 0 {
        return Err(VoiceError::InvalidFile(format!("Voice file is empty: {display}")));
    }

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
        let shown = if extension.is_empty() { "(none)".to_string() } else { format!(".{extension}") };
        return Err(VoiceError::InvalidFile(format!(
            "Unsupported voice file format: {shown}; expected one of .ogg, .opus"
        )));
    }

    let mut header = [0u8; 4];
    let mut file = tokio::fs::File::open(path).await?;
    let read = file.read(&mut header).await?;
    if read < header.len() || &header != OGG_MAGIC {
        return Err(VoiceError::InvalidFile(format!(
            "Invalid OGG container header in {display}"
        )));
    }
    Ok(())
}
