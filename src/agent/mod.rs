//! External agent execution.
//!
//! The dispatcher treats running an agent as one opaque call:
//! `run(agent, session, prompt, model) -> (session, reply)`. `CliAgentRunner`
//! implements it by spawning the codex or claude CLI; tests substitute stubs.

pub mod cli;
pub mod stream;

pub use cli::CliAgentRunner;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::AgentError;

/// Supported agent CLIs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Codex,
    Claude,
}

impl AgentKind {
    /// Resolve a free-form agent name. Anything that is not `claude` runs codex.
    pub fn resolve(name: &str) -> Self {
        if name.trim().eq_ignore_ascii_case("claude") {
            Self::Claude
        } else {
            Self::Codex
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Codex => "codex",
            Self::Claude => "claude",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One agent invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    pub agent: String,
    pub conversation_id: String,
    pub session_id: Option<String>,
    pub prompt: String,
    pub model: Option<String>,
    pub request_id: Option<String>,
}

/// Result of a successful agent run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRun {
    /// Session to resume on the next call, if the agent reported one.
    pub session_id: Option<String>,
    pub reply: String,
}

/// Runs an agent to completion.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, request: AgentRequest) -> Result<AgentRun, AgentError>;
}

/// Collapse `{"detail": "..."}` error bodies to their detail string.
pub fn normalize_error_message(message: &str) -> String {
    let raw = message.trim();
    if raw.is_empty() {
        return String::new();
    }
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(str::to_string))
        .unwrap_or_else(|| raw.to_string())
}
