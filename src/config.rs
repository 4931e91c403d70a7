//! Configuration types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Worker id 1 is reserved for synchronous replies; the pool starts at 2.
pub const FIRST_POOL_WORKER_ID: u32 = 2;

/// Read and parse an environment variable, falling back to `default` when unset.
fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|e: T::Err| ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
        }
        _ => Ok(default),
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_millis() as u64).map(Duration::from_millis)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v.trim() == "1")
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_secret(key: &str) -> Option<SecretString> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(SecretString::from)
}

/// Admission and retry settings for the worker pool.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Highest worker id in the pool. Pool ids are `2..=max_workers`.
    pub max_workers: u32,
    /// Attempts per task before it is marked failed.
    pub attempts_per_task: u32,
    /// Timeout raced against every attempt.
    pub task_timeout: Duration,
    /// How often a running attempt refreshes its heartbeat.
    pub heartbeat_interval: Duration,
    /// Resume the worker's previous agent session on each task.
    pub reuse_sessions: bool,
    /// Agent used when a request does not name one.
    pub default_agent: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_workers: 10,
            attempts_per_task: 2,
            task_timeout: Duration::from_secs(180),
            heartbeat_interval: Duration::from_secs(10),
            reuse_sessions: true,
            default_agent: "codex".to_string(),
        }
    }
}

impl DispatchConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            max_workers: env_parse("MAX_WORKER_TASKS", defaults.max_workers)?,
            attempts_per_task: env_parse("JOB_ATTEMPTS", defaults.attempts_per_task)?.max(1),
            task_timeout: env_millis("REQUEST_TIMEOUT_MS", defaults.task_timeout)?
                .max(Duration::from_secs(1)),
            heartbeat_interval: env_millis("TASK_HEARTBEAT_MS", defaults.heartbeat_interval)?
                .max(Duration::from_secs(1)),
            reuse_sessions: env_flag("REUSE_SESSIONS", defaults.reuse_sessions),
            default_agent: env_string("DEFAULT_AGENT", &defaults.default_agent),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers < FIRST_POOL_WORKER_ID {
            return Err(ConfigError::InvalidValue {
                key: "MAX_WORKER_TASKS".to_string(),
                message: format!(
                    "must be at least {FIRST_POOL_WORKER_ID}, got {}",
                    self.max_workers
                ),
            });
        }
        if self.attempts_per_task == 0 {
            return Err(ConfigError::InvalidValue {
                key: "JOB_ATTEMPTS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Worker ids available to the pool, ascending.
    pub fn pool_worker_ids(&self) -> std::ops::RangeInclusive<u32> {
        FIRST_POOL_WORKER_ID..=self.max_workers
    }
}

/// Outbound text delivery settings.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Minimum gap between direct sends to the same conversation.
    pub min_send_interval: Duration,
    /// Direct send attempts before giving up.
    pub send_max_attempts: u32,
    /// Linear backoff base; attempt `n` waits `n * retry_base`.
    pub retry_base: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            min_send_interval: Duration::from_millis(200),
            send_max_attempts: 4,
            retry_base: Duration::from_millis(1500),
        }
    }
}

impl DeliveryConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            min_send_interval: env_millis(
                "TELEGRAM_MIN_SEND_INTERVAL_MS",
                defaults.min_send_interval,
            )?,
            send_max_attempts: env_parse("TELEGRAM_SEND_MAX_ATTEMPTS", defaults.send_max_attempts)?
                .max(1),
            retry_base: env_millis("TELEGRAM_SEND_RETRY_BASE_MS", defaults.retry_base)?,
        })
    }
}

/// Which queue backend to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Direct execution only.
    None,
    /// In-process queue with local consumers.
    Local,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "none" | "off" => Ok(Self::None),
            "local" => Ok(Self::Local),
            other => Err(format!("unknown queue backend '{other}' (expected none|local)")),
        }
    }
}

/// Queue backend settings.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// Minimum gap between readiness attempts against an unavailable backend.
    pub init_retry_interval: Duration,
    /// Bounded wait for a queued agent run to produce a result.
    pub agent_wait_for_result: Duration,
    /// Attempts the backend makes per job before dead-lettering.
    pub job_attempts: u32,
    /// Exponential backoff base between backend job attempts.
    pub job_backoff: Duration,
    pub agent_concurrency: usize,
    pub notify_concurrency: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::None,
            init_retry_interval: Duration::from_secs(5),
            agent_wait_for_result: Duration::from_secs(210),
            job_attempts: 2,
            job_backoff: Duration::from_secs(2),
            agent_concurrency: 2,
            notify_concurrency: 2,
        }
    }
}

impl BackendConfig {
    pub fn from_env(dispatch: &DispatchConfig) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            kind: env_parse("RELAY_QUEUE_BACKEND", defaults.kind)?,
            init_retry_interval: env_millis("QUEUE_INIT_RETRY_MS", defaults.init_retry_interval)?
                .max(Duration::from_secs(1)),
            agent_wait_for_result: env_millis(
                "AGENT_QUEUE_WAIT_FOR_RESULT_MS",
                dispatch.task_timeout + Duration::from_secs(30),
            )?,
            job_attempts: env_parse("QUEUE_JOB_ATTEMPTS", dispatch.attempts_per_task)?.max(1),
            job_backoff: env_millis("JOB_BACKOFF_MS", defaults.job_backoff)?,
            agent_concurrency: env_parse("AGENT_WORKER_CONCURRENCY", defaults.agent_concurrency)?
                .max(1),
            notify_concurrency: env_parse(
                "NOTIFY_WORKER_CONCURRENCY",
                defaults.notify_concurrency,
            )?
            .max(1),
        })
    }
}

/// Speech synthesis and voice artifact settings.
#[derive(Debug, Clone)]
pub struct VoiceConfig {
    pub temp_dir: PathBuf,
    pub ffmpeg_bin: String,
    pub openai_api_key: Option<SecretString>,
    pub tts_model: String,
    pub tts_voice: String,
    pub tts_format: String,
    pub local_script: Option<PathBuf>,
    pub tts_lang: String,
    /// Per-invocation limit for external audio tools.
    pub tool_timeout: Duration,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            temp_dir: std::env::temp_dir().join("agent-relay-tts"),
            ffmpeg_bin: "ffmpeg".to_string(),
            openai_api_key: None,
            tts_model: "tts-1".to_string(),
            tts_voice: "alloy".to_string(),
            tts_format: "mp3".to_string(),
            local_script: None,
            tts_lang: "en".to_string(),
            tool_timeout: Duration::from_secs(120),
        }
    }
}

impl VoiceConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            temp_dir: std::env::var("VOICE_TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.temp_dir),
            ffmpeg_bin: env_string("FFMPEG_BIN", &defaults.ffmpeg_bin),
            openai_api_key: env_secret("OPENAI_API_KEY"),
            tts_model: env_string("OPENAI_TTS_MODEL", &defaults.tts_model),
            tts_voice: env_string("OPENAI_TTS_VOICE", &defaults.tts_voice),
            tts_format: env_string("OPENAI_TTS_FORMAT", &defaults.tts_format).to_lowercase(),
            local_script: std::env::var("LOCAL_TTS_SCRIPT")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            tts_lang: env_string("TTS_LANG", &defaults.tts_lang),
            tool_timeout: defaults.tool_timeout,
        }
    }
}

/// Settings for the codex/claude subprocess runner.
#[derive(Debug, Clone)]
pub struct AgentCliConfig {
    pub codex_bin: String,
    pub claude_bin: String,
    pub workdir: PathBuf,
    pub bypass_sandbox: bool,
    pub reuse_sessions: bool,
    pub timeout: Duration,
}

impl Default for AgentCliConfig {
    fn default() -> Self {
        Self {
            codex_bin: "codex".to_string(),
            claude_bin: "claude".to_string(),
            workdir: PathBuf::from("."),
            bypass_sandbox: true,
            reuse_sessions: true,
            timeout: Duration::from_secs(180),
        }
    }
}

impl AgentCliConfig {
    pub fn from_env(dispatch: &DispatchConfig) -> Self {
        let defaults = Self::default();
        Self {
            codex_bin: env_string("CODEX_BIN", &defaults.codex_bin),
            claude_bin: env_string("CLAUDE_BIN", &defaults.claude_bin),
            workdir: std::env::var("BOT_WORKDIR")
                .map(PathBuf::from)
                .or_else(|_| std::env::current_dir())
                .unwrap_or(defaults.workdir),
            bypass_sandbox: env_flag("CODEX_BYPASS_SANDBOX", defaults.bypass_sandbox),
            reuse_sessions: dispatch.reuse_sessions,
            timeout: dispatch.task_timeout,
        }
    }
}

/// Full relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub dispatch: DispatchConfig,
    pub delivery: DeliveryConfig,
    pub backend: BackendConfig,
    pub voice: VoiceConfig,
    pub agent_cli: AgentCliConfig,
    pub telegram_token: Option<SecretString>,
    pub http_port: u16,
    /// Conversation that stdin lines are dispatched into, if any.
    pub console_conversation: Option<String>,
    /// Directory for rolling log files, if file logging is enabled.
    pub log_dir: Option<PathBuf>,
    pub sessions_path: PathBuf,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let dispatch = DispatchConfig::from_env()?;
        let backend = BackendConfig::from_env(&dispatch)?;
        let agent_cli = AgentCliConfig::from_env(&dispatch);
        Ok(Self {
            delivery: DeliveryConfig::from_env()?,
            voice: VoiceConfig::from_env(),
            telegram_token: env_secret("TELEGRAM_BOT_TOKEN"),
            http_port: env_parse("AGENT_RELAY_HTTP_PORT", 8080)?,
            console_conversation: std::env::var("AGENT_RELAY_CONSOLE_CHAT")
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            log_dir: std::env::var("AGENT_RELAY_LOG_DIR").ok().map(PathBuf::from),
            sessions_path: std::env::var("AGENT_RELAY_SESSIONS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/sessions.json")),
            dispatch,
            backend,
            agent_cli,
        })
    }
}
