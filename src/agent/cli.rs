//! Codex / Claude CLI runner.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use super::stream::Transcript;
use super::{AgentKind, AgentRequest, AgentRun, AgentRunner, normalize_error_message};
use crate::config::AgentCliConfig;
use crate::error::AgentError;

/// Placeholder reply when the agent finished without printing anything.
pub const NO_TEXT_OUTPUT: &str = "(no text output)";

/// Spawns the agent CLI for each run and decodes its JSON event stream.
pub struct CliAgentRunner {
    config: AgentCliConfig,
}

/// What a finished child process left behind.
struct ProcessOutput {
    code: Option<i32>,
    transcript: Transcript,
    stderr: String,
}

impl CliAgentRunner {
    pub fn new(config: AgentCliConfig) -> Self {
        Self { config }
    }

    fn resume_session<'a>(&self, session_id: Option<&'a str>) -> Option<&'a str> {
        session_id.filter(|s| self.config.reuse_sessions && !s.is_empty())
    }

    fn codex_args(
        &self,
        session_id: Option<&str>,
        prompt: &str,
        model: Option<&str>,
        output_path: &Path,
    ) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if self.config.bypass_sandbox {
            args.push("--dangerously-bypass-approvals-and-sandbox".to_string());
        }
        if let Some(session) = self.resume_session(session_id) {
            args.push("resume".to_string());
            args.push(session.to_string());
        }
        args.extend([
            "--skip-git-repo-check".to_string(),
            "--json".to_string(),
            "--output-last-message".to_string(),
            output_path.display().to_string(),
        ]);
        if let Some(model) = model.filter(|m| !m.is_empty()) {
            args.push("-m".to_string());
            args.push(model.to_string());
        }
        args.push(prompt.to_string());
        args
    }

    fn claude_args(&self, session_id: Option<&str>, prompt: &str) -> Vec<String> {
        let mut args: Vec<String> = [
            "-p",
            "--verbose",
            "--output-format",
            "stream-json",
            "--permission-mode",
            "bypassPermissions",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        if let Some(session) = self.resume_session(session_id) {
            args.push("--resume".to_string());
            args.push(session.to_string());
        }
        args.push(prompt.to_string());
        args
    }

    async fn run_process(
        &self,
        kind: AgentKind,
        bin: &str,
        args: &[String],
        session_id: Option<String>,
    ) -> Result<ProcessOutput, AgentError> {
        let mut child = Command::new(bin)
            .args(args)
            .current_dir(&self.config.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AgentError::Spawn {
                agent: kind.to_string(),
                source,
            })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let timeout = self.config.timeout;

        let result = tokio::time::timeout(timeout, async {
            let read_stdout = async {
                let mut transcript = Transcript::resuming(session_id);
                if let Some(out) = stdout {
                    let mut lines = BufReader::new(out).lines();
                    while let Some(line) = lines.next_line().await? {
                        transcript.push_line(&line);
                    }
                }
                Ok::<_, std::io::Error>(transcript)
            };
            let read_stderr = async {
                let mut buf = String::new();
                if let Some(mut err) = stderr {
                    err.read_to_string(&mut buf).await?;
                }
                Ok::<_, std::io::Error>(buf)
            };
            let (transcript, stderr) = tokio::try_join!(read_stdout, read_stderr)?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>(ProcessOutput {
                code: status.code(),
                transcript,
                stderr,
            })
        })
        .await;

        match result {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(AgentError::Failed(format!("{kind} output read failed: {e}"))),
            Err(_) => {
                warn!(agent = %kind, timeout_ms = timeout.as_millis() as u64, "agent_run_timeout_kill");
                let _ = child.kill().await;
                Err(AgentError::Timeout {
                    agent: kind.to_string(),
                    timeout,
                })
            }
        }
    }

    async fn run_codex(&self, request: &AgentRequest) -> Result<AgentRun, AgentError> {
        let output_path = last_message_path();
        let args = self.codex_args(
            request.session_id.as_deref(),
            &request.prompt,
            request.model.as_deref(),
            &output_path,
        );
        let output = self
            .run_process(
                AgentKind::Codex,
                &self.config.codex_bin,
                &args,
                request.session_id.clone(),
            )
            .await;

        let last_message = tokio::fs::read_to_string(&output_path)
            .await
            .unwrap_or_default();
        if let Err(e) = tokio::fs::remove_file(&output_path).await
            && e.kind() != std::io::ErrorKind::NotFound
        {
            debug!(path = %output_path.display(), error = %e, "codex_output_cleanup_failed");
        }

        codex_outcome(output?, &last_message)
    }

    async fn run_claude(&self, request: &AgentRequest) -> Result<AgentRun, AgentError> {
        let args = self.claude_args(request.session_id.as_deref(), &request.prompt);
        let output = self
            .run_process(
                AgentKind::Claude,
                &self.config.claude_bin,
                &args,
                request.session_id.clone(),
            )
            .await?;
        claude_outcome(output)
    }
}

#[async_trait]
impl AgentRunner for CliAgentRunner {
    async fn run(&self, request: AgentRequest) -> Result<AgentRun, AgentError> {
        let kind = AgentKind::resolve(&request.agent);
        debug!(
            agent = %kind,
            conversation = %request.conversation_id,
            request_id = request.request_id.as_deref().unwrap_or(""),
            resume = request.session_id.is_some(),
            "agent_run_start"
        );
        match kind {
            AgentKind::Codex => self.run_codex(&request).await,
            AgentKind::Claude => self.run_claude(&request).await,
        }
    }
}

fn last_message_path() -> PathBuf {
    let nonce = Uuid::new_v4().simple().to_string();
    std::env::temp_dir().join(format!(
        "codex-last-{}-{}.txt",
        chrono::Utc::now().timestamp_millis(),
        &nonce[..12]
    ))
}

fn exit_message(kind: AgentKind, code: Option<i32>) -> String {
    match code {
        Some(code) => format!("{kind} exited with code {code}"),
        None => format!("{kind} exited with code null"),
    }
}

fn codex_outcome(output: ProcessOutput, last_message: &str) -> Result<AgentRun, AgentError> {
    let stderr = normalize_error_message(&output.stderr);
    if output.code != Some(0) {
        return Err(AgentError::Exit {
            agent: AgentKind::Codex.to_string(),
            code: output.code,
            message: non_empty(stderr).unwrap_or_else(|| exit_message(AgentKind::Codex, output.code)),
        });
    }
    let reply = non_empty(last_message.trim().to_string())
        .or_else(|| non_empty(stderr))
        .unwrap_or_else(|| NO_TEXT_OUTPUT.to_string());
    Ok(AgentRun {
        session_id: output.transcript.session_id().map(str::to_string),
        reply,
    })
}

fn claude_outcome(output: ProcessOutput) -> Result<AgentRun, AgentError> {
    if output.code != Some(0) {
        let message = output
            .transcript
            .stream_error()
            .map(str::to_string)
            .or_else(|| non_empty(normalize_error_message(&output.stderr)))
            .unwrap_or_else(|| exit_message(AgentKind::Claude, output.code));
        return Err(AgentError::Exit {
            agent: AgentKind::Claude.to_string(),
            code: output.code,
            message,
        });
    }
    Ok(AgentRun {
        session_id: output.transcript.session_id().map(str::to_string),
        reply: output
            .transcript
            .reply()
            .unwrap_or_else(|| NO_TEXT_OUTPUT.to_string()),
    })
}

fn non_empty(s: String) -> Option<String> {
    (!s.trim().is_empty()).then_some(s)
}
