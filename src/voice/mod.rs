//! Voice replies: only the latest request per conversation is delivered.

pub mod artifact;
pub mod ffmpeg;
pub mod tts;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub use artifact::VoiceArtifacts;
pub use ffmpeg::{FfmpegTagger, FfmpegTranscoder};
pub use tts::{FallbackSynthesizer, LocalScriptSpeech, OpenAiSpeech};

use crate::config::VoiceConfig;
use crate::delivery::DirectSender;
use crate::error::{ErrorKind, VoiceError};
use crate::worker::registry::Coordinator;

/// Audio produced by a synthesizer.
#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub path: PathBuf,
    /// False when the file is already OGG/Opus.
    pub needs_transcode: bool,
}

/// Text-to-speech backend.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    fn name(&self) -> &str;

    /// Write speech for `text` into a path allocated from `artifacts`.
    ///
    /// `Ok(None)` when the backend is not configured or has nothing to say.
    async fn synthesize(
        &self,
        text: &str,
        artifacts: &VoiceArtifacts,
    ) -> Result<Option<SynthesizedAudio>, VoiceError>;
}

#[async_trait]
pub trait VoiceTranscoder: Send + Sync {
    async fn transcode(&self, input: &Path, output: &Path) -> Result<(), VoiceError>;
}

/// Embeds request ownership metadata into a voice file.
#[async_trait]
pub trait ArtifactTagger: Send + Sync {
    async fn tag(
        &self,
        input: &Path,
        output: &Path,
        request_id: &str,
        user_id: &str,
    ) -> Result<(), VoiceError>;
}

/// The external capabilities a `VoiceGuard` drives.
pub struct VoiceCapabilities {
    /// `None` disables speech replies entirely.
    pub synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    pub transcoder: Arc<dyn VoiceTranscoder>,
    pub tagger: Arc<dyn ArtifactTagger>,
}

impl VoiceCapabilities {
    /// OpenAI first when a key is set, the local script otherwise or as fallback.
    pub fn from_config(config: &VoiceConfig, workdir: &Path) -> Self {
        let openai: Option<Arc<dyn SpeechSynthesizer>> = config.openai_api_key.clone().map(|key| {
            Arc::new(OpenAiSpeech::new(
                key,
                &config.tts_model,
                &config.tts_voice,
                &config.tts_format,
            )) as Arc<dyn SpeechSynthesizer>
        });
        let local: Option<Arc<dyn SpeechSynthesizer>> = config.local_script.clone().map(|script| {
            Arc::new(
                LocalScriptSpeech::new(script, &config.tts_lang, config.tool_timeout)
                    .with_workdir(workdir),
            ) as Arc<dyn SpeechSynthesizer>
        });
        let synthesizer = match (openai, local) {
            (Some(primary), Some(fallback)) => {
                Some(Arc::new(FallbackSynthesizer::new(primary, fallback)) as Arc<dyn SpeechSynthesizer>)
            }
            (primary, fallback) => primary.or(fallback),
        };

        Self {
            synthesizer,
            transcoder: Arc::new(FfmpegTranscoder::new(&config.ffmpeg_bin, config.tool_timeout)),
            tagger: Arc::new(FfmpegTagger::new(&config.ffmpeg_bin, config.tool_timeout)),
        }
    }
}

/// A speech reply to deliver.
#[derive(Debug, Clone, Default)]
pub struct VoiceReply {
    pub conversation_id: String,
    pub text: String,
    /// Generated when absent.
    pub request_id: Option<String>,
    /// Defaults to the conversation id.
    pub user_id: Option<String>,
    pub required_topic: Option<String>,
    /// The user message that prompted this reply, for the topic gate.
    pub source_text: Option<String>,
    pub caption: Option<String>,
}

/// Result of a voice reply that did not error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoiceOutcome {
    Sent,
    TopicMismatch,
    StaleDropped,
    NoAudio,
}

impl VoiceOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, Self::Sent)
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::TopicMismatch => Some(ErrorKind::VoiceTopicMismatch),
            Self::StaleDropped => Some(ErrorKind::StaleRequestDropped),
            Self::Sent | Self::NoAudio => None,
        }
    }
}

/// Case-insensitive substring gate. A blank topic always passes.
pub fn matches_topic(topic: Option<&str>, text: &str, source_text: Option<&str>) -> bool {
    let Some(topic) = topic.map(str::trim).filter(|t| !t.is_empty()) else {
        return true;
    };
    let needle = topic.to_lowercase();
    text.to_lowercase().contains(&needle)
        || source_text.is_some_and(|s| s.to_lowercase().contains(&needle))
}

fn generate_request_id() -> String {
    let nonce = Uuid::new_v4().simple().to_string();
    format!("voice-{}-{}", chrono::Utc::now().timestamp_millis(), &nonce[..8])
}

/// Synthesizes, binds and sends voice replies under the latest-wins rule.
pub struct VoiceGuard {
    coordinator: Arc<Coordinator>,
    direct: Arc<DirectSender>,
    capabilities: VoiceCapabilities,
    temp_dir: PathBuf,
}

impl VoiceGuard {
    pub fn new(
        coordinator: Arc<Coordinator>,
        direct: Arc<DirectSender>,
        capabilities: VoiceCapabilities,
        temp_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            coordinator,
            direct,
            capabilities,
            temp_dir: temp_dir.into(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.capabilities.synthesizer.is_some()
    }

    /// Deliver `reply` as a voice note unless it is off-topic or superseded.
    ///
    /// Policy outcomes come back as `Ok`; binding and artifact failures are
    /// errors. Temp files are removed and the registry entry is released on
    /// every path.
    pub async fn send_voice_reply(&self, reply: VoiceReply) -> Result<VoiceOutcome, VoiceError> {
        let request_id = reply
            .request_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(generate_request_id);
        let user_id = reply
            .user_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| reply.conversation_id.clone());
        let conversation = reply.conversation_id.as_str();

        self.coordinator.register_voice_request(conversation, &request_id);
        let artifacts = VoiceArtifacts::new(&self.temp_dir).bound_to(
            Arc::clone(&self.coordinator),
            conversation,
            &request_id,
        );

        let result = self.deliver(&reply, &request_id, &user_id, &artifacts).await;
        match &result {
            Ok(outcome) => debug!(
                conversation,
                request_id = %request_id,
                outcome = ?outcome,
                "send_voice_reply_finished"
            ),
            Err(e) => warn!(
                conversation,
                request_id = %request_id,
                error = %e,
                "send_voice_reply_failed"
            ),
        }
        result
    }

    async fn deliver(
        &self,
        reply: &VoiceReply,
        request_id: &str,
        user_id: &str,
        artifacts: &VoiceArtifacts,
    ) -> Result<VoiceOutcome, VoiceError> {
        let conversation = reply.conversation_id.as_str();

        if !matches_topic(
            reply.required_topic.as_deref(),
            &reply.text,
            reply.source_text.as_deref(),
        ) {
            info!(
                conversation,
                request_id,
                topic = reply.required_topic.as_deref().unwrap_or(""),
                "send_voice_reply_blocked_topic_validation"
            );
            return Ok(VoiceOutcome::TopicMismatch);
        }

        let Some(synthesizer) = &self.capabilities.synthesizer else {
            return Ok(VoiceOutcome::NoAudio);
        };
        artifacts.ensure_dir().await?;
        let Some(audio) = synthesizer.synthesize(&reply.text, artifacts).await? else {
            debug!(conversation, request_id, "voice_no_audio");
            return Ok(VoiceOutcome::NoAudio);
        };
        artifact::ensure_artifact(&audio.path).await?;

        let voice = if audio.needs_transcode {
            let out = artifacts.allocate("voice", "ogg");
            self.capabilities.transcoder.transcode(&audio.path, &out).await?;
            out
        } else {
            audio.path
        };

        let tagged = artifacts.allocate("voice-tagged", "ogg");
        self.capabilities
            .tagger
            .tag(&voice, &tagged, request_id, user_id)
            .await?;
        artifact::ensure_artifact(&tagged).await?;

        if !self.coordinator.is_latest_voice_request(conversation, request_id) {
            let latest = self.coordinator.latest_voice_request(conversation);
            info!(
                conversation,
                request_id,
                latest = latest.as_deref().unwrap_or(""),
                "voice_request_stale_drop"
            );
            return Ok(VoiceOutcome::StaleDropped);
        }

        self.direct
            .send_voice_with_retry(conversation, &tagged, reply.caption.as_deref())
            .await?;
        info!(conversation, request_id, user_id, "voice_reply_sent");
        Ok(VoiceOutcome::Sent)
    }
}
