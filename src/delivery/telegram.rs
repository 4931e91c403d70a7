//! Telegram Bot API transport.

use std::path::Path;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use super::{OutboundTransport, split_message};
use crate::error::TransportError;
use crate::voice::artifact::validate_voice_file;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

/// Sends text and voice messages through the Bot API.
pub struct TelegramTransport {
    bot_token: SecretString,
    api_base: String,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    description: Option<String>,
    parameters: Option<ApiErrorParameters>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorParameters {
    retry_after: Option<u64>,
}

impl TelegramTransport {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            api_base: TELEGRAM_API_BASE.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Point the transport at a different API host (local Bot API server, tests).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.api_base,
            self.bot_token.expose_secret()
        )
    }

    async fn send_message_chunk(&self, chat_id: &str, text: &str) -> Result<(), TransportError> {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
        });
        let resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(network_error)?;
        check_response(resp).await
    }
}

#[async_trait]
impl OutboundTransport for TelegramTransport {
    /// Splits long messages that exceed Telegram's 4096 char limit.
    async fn send_text(&self, conversation_id: &str, text: &str) -> Result<(), TransportError> {
        if text.trim().is_empty() {
            return Err(TransportError::InvalidInput("message text is empty".into()));
        }
        for chunk in split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH) {
            self.send_message_chunk(conversation_id, &chunk).await?;
        }
        Ok(())
    }

    fn max_text_len(&self) -> Option<usize> {
        Some(TELEGRAM_MAX_MESSAGE_LENGTH)
    }

    async fn send_voice_file(
        &self,
        conversation_id: &str,
        path: &Path,
        caption: Option<&str>,
    ) -> Result<(), TransportError> {
        validate_voice_file(path)
            .await
            .map_err(|e| TransportError::InvalidInput(e.to_string()))?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("voice.ogg")
            .to_string();
        let bytes = tokio::fs::read(path).await?;
        let part = Part::bytes(bytes)
            .file_name(file_name.clone())
            .mime_str("audio/ogg")
            .map_err(|e| TransportError::InvalidInput(e.to_string()))?;

        let mut form = Form::new()
            .text("chat_id", conversation_id.to_string())
            .part("voice", part);
        if let Some(cap) = caption.filter(|c| !c.is_empty()) {
            form = form.text("caption", cap.to_string());
        }

        let resp = self
            .client
            .post(self.api_url("sendVoice"))
            .multipart(form)
            .send()
            .await
            .map_err(network_error)?;
        check_response(resp).await?;

        tracing::info!(conversation = conversation_id, file = %file_name, "telegram_voice_sent");
        Ok(())
    }
}

/// Tag connection-level failures with the errno-style codes the retry
/// classifier recognizes.
fn network_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Network(format!("ETIMEDOUT: {e}"))
    } else if e.is_connect() || e.is_request() {
        TransportError::Network(format!("ECONNRESET: {e}"))
    } else {
        TransportError::Network(e.to_string())
    }
}

async fn check_response(resp: reqwest::Response) -> Result<(), TransportError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(api_error(status.as_u16(), &body))
}

fn api_error(status: u16, body: &str) -> TransportError {
    let parsed = serde_json::from_str::<ApiErrorBody>(body).ok();
    let retry_after = parsed
        .as_ref()
        .and_then(|b| b.parameters.as_ref())
        .and_then(|p| p.retry_after);
    let description = parsed
        .and_then(|b| b.description)
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| body.trim().to_string());
    TransportError::Http {
        status,
        description,
        retry_after,
    }
}
