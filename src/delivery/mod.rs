//! Outbound delivery with rate limiting, retries and queue fallback.
//!
//! `DirectSender` owns the transport plus a per-conversation throttle and
//! retries transient failures. `ReplySender` puts the notify queue in front
//! of it: replies go through the backend when it has live consumers, and
//! straight to the transport otherwise.

pub mod retry;
pub mod telegram;

pub use telegram::TelegramTransport;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bridge::gate::BackendGate;
use crate::bridge::{BackendJob, NotifyJob, QueueName};
use crate::config::DeliveryConfig;
use crate::error::{DeliveryError, TransportError};

/// Raw outbound primitives of a messaging channel.
#[async_trait]
pub trait OutboundTransport: Send + Sync {
    async fn send_text(&self, conversation_id: &str, text: &str) -> Result<(), TransportError>;

    /// Longest text one `send_text` call delivers as a single message.
    /// Longer texts are split by the caller and each piece retried alone.
    fn max_text_len(&self) -> Option<usize> {
        None
    }

    async fn send_voice_file(
        &self,
        conversation_id: &str,
        path: &Path,
        caption: Option<&str>,
    ) -> Result<(), TransportError>;
}

/// Enforces a minimum interval between sends to the same conversation.
///
/// Each caller reserves the next free slot under the lock and sleeps
/// outside it, so concurrent senders are spaced out rather than bunched.
pub struct SendThrottle {
    min_interval: Duration,
    next_slot: Mutex<HashMap<String, Instant>>,
}

impl SendThrottle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(HashMap::new()),
        }
    }

    pub async fn wait(&self, conversation_id: &str) {
        let slot = {
            let mut slots = self.next_slot.lock().unwrap_or_else(PoisonError::into_inner);
            let now = Instant::now();
            let slot = slots
                .get(conversation_id)
                .copied()
                .filter(|next| *next > now)
                .unwrap_or(now);
            slots.insert(conversation_id.to_string(), slot + self.min_interval);
            slot
        };
        tokio::time::sleep_until(slot).await;
    }
}

/// Direct sends with throttling and transient-failure retries.
pub struct DirectSender {
    transport: Arc<dyn OutboundTransport>,
    throttle: SendThrottle,
    config: DeliveryConfig,
}

impl DirectSender {
    pub fn new(transport: Arc<dyn OutboundTransport>, config: DeliveryConfig) -> Self {
        Self {
            transport,
            throttle: SendThrottle::new(config.min_send_interval),
            config,
        }
    }

    /// Send text, retrying transient failures.
    ///
    /// Texts over the transport's limit go out as separate chunks, each with
    /// its own retry budget, so a failed chunk never resends earlier ones.
    pub async fn send_text_with_retry(
        &self,
        conversation_id: &str,
        text: &str,
    ) -> Result<(), DeliveryError> {
        let chunks = match self.transport.max_text_len() {
            Some(max_len) => split_message(text, max_len),
            None => vec![text.to_string()],
        };
        let total = chunks.len();
        for (index, chunk) in chunks.iter().enumerate() {
            self.with_retry(conversation_id, "text", || {
                self.transport.send_text(conversation_id, chunk)
            })
            .await
            .map_err(|(attempts, err)| {
                if index > 0 {
                    warn!(
                        conversation = conversation_id,
                        delivered = index,
                        total,
                        "telegram_send_partial"
                    );
                }
                DeliveryError::Failed {
                    conversation: conversation_id.to_string(),
                    attempts,
                    reason: err.to_string(),
                }
            })?;
        }
        Ok(())
    }

    /// Send a voice file, retrying transient failures. Returns the last error.
    pub async fn send_voice_with_retry(
        &self,
        conversation_id: &str,
        path: &Path,
        caption: Option<&str>,
    ) -> Result<(), TransportError> {
        self.with_retry(conversation_id, "voice", || {
            self.transport.send_voice_file(conversation_id, path, caption)
        })
        .await
        .map_err(|(_, err)| err)
    }

    async fn with_retry<F, Fut>(
        &self,
        conversation_id: &str,
        kind: &'static str,
        mut send: F,
    ) -> Result<(), (u32, TransportError)>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), TransportError>>,
    {
        let max_attempts = self.config.send_max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.throttle.wait(conversation_id).await;
            let err = match send().await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            match retry::next_delay(&err, attempt, max_attempts, self.config.retry_base) {
                Some(delay) => {
                    warn!(
                        conversation = conversation_id,
                        kind,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "telegram_send_retry"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    warn!(conversation = conversation_id, kind, attempt, error = %err, "telegram_send_failed");
                    return Err((attempt, err));
                }
            }
        }
    }
}

/// Split a message into chunks of at most `max_len` bytes, preferring
/// newline then space boundaries.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len || max_len == 0 {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.len() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        let mut limit = max_len;
        while limit > 0 && !remaining.is_char_boundary(limit) {
            limit -= 1;
        }
        if limit == 0 {
            // A single character wider than `max_len`.
            limit = remaining.chars().next().map_or(remaining.len(), char::len_utf8);
        }
        let window = &remaining[..limit];
        let split_at = match window.rfind('\n').or_else(|| window.rfind(' ')) {
            Some(0) | None => limit,
            Some(pos) => pos,
        };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

/// How a reply left the process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum ReplyRoute {
    Queued { job_id: String },
    Direct,
}

/// Text replies: notify queue first, direct send as fallback.
pub struct ReplySender {
    direct: Arc<DirectSender>,
    gate: Arc<BackendGate>,
}

impl ReplySender {
    pub fn new(direct: Arc<DirectSender>, gate: Arc<BackendGate>) -> Self {
        Self { direct, gate }
    }

    pub fn direct(&self) -> &Arc<DirectSender> {
        &self.direct
    }

    /// Deliver a text reply.
    ///
    /// Fails with `delivery_failed` only when the backend path is unavailable
    /// and every direct attempt failed.
    pub async fn send_reply(
        &self,
        conversation_id: &str,
        text: &str,
        request_id: Option<&str>,
    ) -> Result<ReplyRoute, DeliveryError> {
        if let Some(backend) = self.gate.available(QueueName::Notify).await {
            let job = BackendJob::NotifySend(NotifyJob {
                conversation_id: conversation_id.to_string(),
                text: text.to_string(),
                request_id: request_id.map(str::to_string),
            });
            match backend.enqueue(job).await {
                Ok(job_id) => {
                    debug!(
                        conversation = conversation_id,
                        request_id = request_id.unwrap_or(""),
                        job_id = %job_id,
                        "reply_enqueued"
                    );
                    return Ok(ReplyRoute::Queued { job_id });
                }
                Err(e) => warn!(
                    conversation = conversation_id,
                    error = %e,
                    "notify_enqueue_failed_fallback_direct"
                ),
            }
        }

        self.direct.send_text_with_retry(conversation_id, text).await?;
        if let Some(request_id) = request_id {
            info!(conversation = conversation_id, request_id, "reply_delivered_direct");
        }
        Ok(ReplyRoute::Direct)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::path::PathBuf;

    use tokio::sync::Mutex as AsyncMutex;

    use super::*;

    /// Transport stub that records sends and replays scripted failures.
    #[derive(Default)]
    pub struct RecordingTransport {
        pub texts: AsyncMutex<Vec<(String, String)>>,
        pub voices: AsyncMutex<Vec<(String, PathBuf, Option<String>)>>,
        pub failures: AsyncMutex<Vec<TransportError>>,
        pub max_text_len: Option<usize>,
    }

    impl RecordingTransport {
        pub fn failing_with(failures: Vec<TransportError>) -> Self {
            Self {
                failures: AsyncMutex::new(failures),
                ..Self::default()
            }
        }

        async fn next_failure(&self) -> Option<TransportError> {
            let mut failures = self.failures.lock().await;
            (!failures.is_empty()).then(|| failures.remove(0))
        }
    }

    #[async_trait]
    impl OutboundTransport for RecordingTransport {
        async fn send_text(&self, conversation_id: &str, text: &str) -> Result<(), TransportError> {
            if let Some(err) = self.next_failure().await {
                return Err(err);
            }
            self.texts
                .lock()
                .await
                .push((conversation_id.to_string(), text.to_string()));
            Ok(())
        }

        fn max_text_len(&self) -> Option<usize> {
            self.max_text_len
        }

        async fn send_voice_file(
            &self,
            conversation_id: &str,
            path: &Path,
            caption: Option<&str>,
        ) -> Result<(), TransportError> {
            if let Some(err) = self.next_failure().await {
                return Err(err);
            }
            self.voices.lock().await.push((
                conversation_id.to_string(),
                path.to_path_buf(),
                caption.map(str::to_string),
            ));
            Ok(())
        }
    }

    pub fn unavailable(status: u16) -> TransportError {
        TransportError::Http {
            status,
            description: "Service Unavailable".to_string(),
            retry_after: None,
        }
    }
}
