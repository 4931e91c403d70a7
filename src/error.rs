//! Error types for Agent Relay.

use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for the relay.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Voice error: {0}")]
    Voice(#[from] VoiceError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl Error {
    /// Stable error code, if this error belongs to the relay taxonomy.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Dispatch(e) => Some(e.kind()),
            Self::Agent(_) => Some(ErrorKind::AgentProcessError),
            Self::Task(e) => e.kind(),
            Self::Queue(_) => Some(ErrorKind::QueueUnavailable),
            Self::Delivery(_) => Some(ErrorKind::DeliveryFailed),
            Self::Voice(e) => e.kind(),
            Self::Config(_) | Self::Transport(_) | Self::Store(_) => None,
        }
    }
}

/// Error codes surfaced to callers and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    EmptyGoal,
    TaskTimeout,
    AgentProcessError,
    QueueUnavailable,
    DeliveryFailed,
    VoiceTopicMismatch,
    VoiceBindingFailed,
    StaleRequestDropped,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EmptyGoal => "empty_goal",
            Self::TaskTimeout => "task_timeout",
            Self::AgentProcessError => "agent_process_error",
            Self::QueueUnavailable => "queue_unavailable",
            Self::DeliveryFailed => "delivery_failed",
            Self::VoiceTopicMismatch => "voice_topic_mismatch",
            Self::VoiceBindingFailed => "voice_binding_failed",
            Self::StaleRequestDropped => "stale_request_dropped",
        }
    }

    /// Whether a task failing with this kind may be attempted again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::TaskTimeout | Self::AgentProcessError)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors rejecting a dispatch request before any state is created.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Goal text is empty")]
    EmptyGoal,
}

impl DispatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyGoal => ErrorKind::EmptyGoal,
        }
    }
}

/// Failures of the opaque agent-run operation.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Failed to spawn {agent}: {source}")]
    Spawn {
        agent: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{message}")]
    Exit {
        agent: String,
        code: Option<i32>,
        message: String,
    },

    #[error("{agent} timed out after {timeout:?}")]
    Timeout { agent: String, timeout: Duration },

    #[error("{0}")]
    Failed(String),
}

/// Task lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task timed out after {}ms", .timeout.as_millis())]
    Timeout { task_id: String, timeout: Duration },

    #[error("{0}")]
    Agent(#[from] AgentError),

    #[error("Task {task_id} cannot transition from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("Task {0} not found")]
    NotFound(String),

    #[error("Task panicked: {0}")]
    Panicked(String),
}

impl TaskError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Timeout { .. } => Some(ErrorKind::TaskTimeout),
            Self::Agent(_) => Some(ErrorKind::AgentProcessError),
            Self::InvalidTransition { .. } | Self::NotFound(_) | Self::Panicked(_) => None,
        }
    }
}

/// Backend queue errors. Never fatal to callers; they trigger fallback.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Queue backend unavailable: {0}")]
    Unavailable(String),

    #[error("Queue {queue} has no live consumers")]
    NoConsumers { queue: String },

    #[error("Queue returned empty result")]
    EmptyResult,

    #[error("Timed out after {0:?} waiting for queued job")]
    WaitTimeout(Duration),

    #[error("Queued job failed: {0}")]
    JobFailed(String),

    #[error("Queue closed")]
    Closed,

    #[error("Invalid job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// A single outbound send failed.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP {status}: {description}")]
    Http {
        status: u16,
        description: String,
        retry_after: Option<u64>,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid outbound payload: {0}")]
    InvalidInput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// No path could deliver a reply.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Delivery to {conversation} failed after {attempts} attempts: {reason}")]
    Failed {
        conversation: String,
        attempts: u32,
        reason: String,
    },
}

/// Unexpected voice reply failures. Policy outcomes are not errors.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    #[error("Voice request binding failed: {0}")]
    BindingFailed(String),

    #[error("Voice artifact missing: {}", .0.display())]
    MissingArtifact(PathBuf),

    #[error("Speech synthesis failed: {0}")]
    Synthesis(String),

    #[error("Voice transcode failed: {0}")]
    Transcode(String),

    #[error("Invalid voice file: {0}")]
    InvalidFile(String),

    #[error("Voice send failed: {0}")]
    Send(#[from] TransportError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::BindingFailed(_) => Some(ErrorKind::VoiceBindingFailed),
            _ => None,
        }
    }
}

/// Session store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification of a task failure message, for notices and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Stalled,
    Timeout,
    AgentProcess,
    ExecutionError,
}

impl FailureClass {
    pub fn classify(message: &str) -> Self {
        let lower = message.trim().to_lowercase();
        if lower.contains("stalled") {
            Self::Stalled
        } else if lower.contains("timed out") || lower.contains("timeout") {
            Self::Timeout
        } else if lower.contains("exited with code")
            || lower.contains("spawn")
            || lower.contains("econnreset")
            || lower.contains("eai_again")
        {
            Self::AgentProcess
        } else {
            Self::ExecutionError
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Stalled => "stalled",
            Self::Timeout => "timeout",
            Self::AgentProcess => "agent_process",
            Self::ExecutionError => "execution_error",
        }
    }

    pub fn summary(&self) -> &'static str {
        match self {
            Self::Stalled => "Worker was interrupted and the job was marked stalled.",
            Self::Timeout => "Task exceeded configured timeout while waiting for completion.",
            Self::AgentProcess => "Agent process exited or runtime dependency failed.",
            Self::ExecutionError => "Task failed due to an execution error in the agent pipeline.",
        }
    }
}

/// Result type alias for the relay.
pub type Result<T> = std::result::Result<T, Error>;
