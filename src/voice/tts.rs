//! Speech synthesis backends.

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, warn};

use super::artifact::{VoiceArtifacts, ensure_artifact};
use super::ffmpeg::run_tool;
use super::{SpeechSynthesizer, SynthesizedAudio};
use crate::error::VoiceError;

const OPENAI_API_BASE: &str = "https://api.openai.com";

/// OpenAI rejects longer inputs.
pub const OPENAI_MAX_INPUT_CHARS: usize = 3500;

/// OpenAI `/v1/audio/speech`.
pub struct OpenAiSpeech {
    api_key: SecretString,
    model: String,
    voice: String,
    format: String,
    api_base: String,
    client: reqwest::Client,
}

impl OpenAiSpeech {
    pub fn new(api_key: SecretString, model: &str, voice: &str, format: &str) -> Self {
        Self {
            api_key,
            model: model.to_string(),
            voice: voice.to_string(),
            format: format.to_lowercase(),
            api_base: OPENAI_API_BASE.to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn extension(&self) -> &'static str {
        match self.format.as_str() {
            "opus" => "opus",
            "wav" => "wav",
            _ => "mp3",
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSpeech {
    fn name(&self) -> &str {
        "openai"
    }

    async fn synthesize(
        &self,
        text: &str,
        artifacts: &VoiceArtifacts,
    ) -> Result<Option<SynthesizedAudio>, VoiceError> {
        let input: String = text.trim().chars().take(OPENAI_MAX_INPUT_CHARS).collect();
        if input.is_empty() || self.api_key.expose_secret().is_empty() {
            return Ok(None);
        }

        let body = serde_json::json!({
            "model": self.model,
            "voice": self.voice,
            "input": input,
            "response_format": self.format,
        });
        let resp = self
            .client
            .post(format!("{}/v1/audio/speech", self.api_base))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Synthesis(format!("OpenAI TTS request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            return Err(VoiceError::Synthesis(format!(
                "OpenAI TTS HTTP {}: {}",
                status.as_u16(),
                detail.trim()
            )));
        }
        let audio = resp
            .bytes()
            .await
            .map_err(|e| VoiceError::Synthesis(format!("OpenAI TTS body read failed: {e}")))?;

        let path = artifacts.allocate("tts", self.extension());
        tokio::fs::write(&path, &audio).await?;
        debug!(bytes = audio.len(), path = %path.display(), "openai_tts_written");
        Ok(Some(SynthesizedAudio {
            path,
            needs_transcode: true,
        }))
    }
}

/// A local script invoked as `<script> --text T --output F --lang L`.
///
/// The script must write OGG/Opus directly.
pub struct LocalScriptSpeech {
    script: PathBuf,
    lang: String,
    workdir: Option<PathBuf>,
    timeout: Duration,
}

impl LocalScriptSpeech {
    pub fn new(script: impl Into<PathBuf>, lang: &str, timeout: Duration) -> Self {
        Self {
            script: script.into(),
            lang: lang.to_string(),
            workdir: None,
            timeout,
        }
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }
}

#[async_trait]
impl SpeechSynthesizer for LocalScriptSpeech {
    fn name(&self) -> &str {
        "local_script"
    }

    async fn synthesize(
        &self,
        text: &str,
        artifacts: &VoiceArtifacts,
    ) -> Result<Option<SynthesizedAudio>, VoiceError> {
        let text = text.trim();
        if text.is_empty() || !tokio::fs::try_exists(&self.script).await.unwrap_or(false) {
            return Ok(None);
        }

        let output = artifacts.allocate("voice-local", "ogg");
        let args: Vec<OsString> = vec![
            "--text".into(),
            text.into(),
            "--output".into(),
            output.as_os_str().to_owned(),
            "--lang".into(),
            self.lang.as_str().into(),
        ];
        run_tool(
            &self.script,
            &args,
            self.workdir.as_deref(),
            self.timeout,
            "local tts script failed",
        )
        .await
        .map_err(VoiceError::Synthesis)?;
        ensure_artifact(&output).await?;

        Ok(Some(SynthesizedAudio {
            path: output,
            needs_transcode: false,
        }))
    }
}

/// Tries `primary`, then `fallback` when the primary is unavailable or fails.
pub struct FallbackSynthesizer {
    primary: Arc<dyn SpeechSynthesizer>,
    fallback: Arc<dyn SpeechSynthesizer>,
}

impl FallbackSynthesizer {
    pub fn new(primary: Arc<dyn SpeechSynthesizer>, fallback: Arc<dyn SpeechSynthesizer>) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl SpeechSynthesizer for FallbackSynthesizer {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn synthesize(
        &self,
        text: &str,
        artifacts: &VoiceArtifacts,
    ) -> Result<Option<SynthesizedAudio>, VoiceError> {
        match self.primary.synthesize(text, artifacts).await {
            Ok(Some(audio)) => return Ok(Some(audio)),
            Ok(None) => {}
            Err(e) => warn!(
                synthesizer = self.primary.name(),
                fallback = self.fallback.name(),
                error = %e,
                "tts_primary_failed"
            ),
        }
        self.fallback.synthesize(text, artifacts).await
    }
}
