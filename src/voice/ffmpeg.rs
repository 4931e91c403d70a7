//! ffmpeg-backed transcode and request-binding remux.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::artifact::ensure_artifact;
use super::{ArtifactTagger, VoiceTranscoder};
use crate::error::VoiceError;

/// Prefix of the container comment that binds a file to its request.
pub const REQUEST_COMMENT_PREFIX: &str = "voice-request:";

/// Run an external tool to completion, killing it after `timeout`.
///
/// `Err` carries the tool's stderr, else stdout, else `fallback`.
pub(crate) async fn run_tool(
    bin: &Path,
    args: &[OsString],
    cwd: Option<&Path>,
    timeout: Duration,
    fallback: &str,
) -> Result<(), String> {
    let mut cmd = Command::new(bin);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(format!("{fallback}: {}: {e}", bin.display())),
        Err(_) => {
            return Err(format!(
                "{fallback}: timed out after {}ms",
                timeout.as_millis()
            ));
        }
    };
    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    Err(if !stderr.is_empty() {
        stderr
    } else if !stdout.is_empty() {
        stdout
    } else {
        fallback.to_string()
    })
}

fn os_args<I, S>(items: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    items.into_iter().map(Into::into).collect()
}

/// Converts synthesized audio to OGG/Opus.
pub struct FfmpegTranscoder {
    bin: PathBuf,
    timeout: Duration,
}

impl FfmpegTranscoder {
    pub fn new(bin: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
        }
    }

    fn args(input: &Path, output: &Path) -> Vec<OsString> {
        let mut args = os_args(["-y", "-i"]);
        args.push(input.as_os_str().to_owned());
        args.extend(os_args([
            "-c:a",
            "libopus",
            "-b:a",
            "24k",
            "-vbr",
            "on",
            "-compression_level",
            "10",
        ]));
        args.push(output.as_os_str().to_owned());
        args
    }
}

#[async_trait]
impl VoiceTranscoder for FfmpegTranscoder {
    async fn transcode(&self, input: &Path, output: &Path) -> Result<(), VoiceError> {
        ensure_artifact(input).await?;
        run_tool(
            &self.bin,
            &Self::args(input, output),
            None,
            self.timeout,
            "ffmpeg voice transcode failed",
        )
        .await
        .map_err(VoiceError::Transcode)?;
        ensure_artifact(output).await?;
        debug!(output = %output.display(), "voice_transcoded");
        Ok(())
    }
}

/// Remuxes a voice file with request metadata, without re-encoding.
pub struct FfmpegTagger {
    bin: PathBuf,
    timeout: Duration,
}

impl FfmpegTagger {
    pub fn new(bin: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            bin: bin.into(),
            timeout,
        }
    }

    fn args(input: &Path, output: &Path, request_id: &str, user_id: &str) -> Vec<OsString> {
        let mut args = os_args(["-y", "-i"]);
        args.push(input.as_os_str().to_owned());
        args.extend(os_args([
            "-map_metadata".to_string(),
            "-1".to_string(),
            "-c:a".to_string(),
            "copy".to_string(),
            "-metadata".to_string(),
            format!("request_id={request_id}"),
            "-metadata".to_string(),
            format!("user_id={user_id}"),
            "-metadata".to_string(),
            format!("comment={REQUEST_COMMENT_PREFIX}{request_id}"),
        ]));
        args.push(output.as_os_str().to_owned());
        args
    }
}

#[async_trait]
impl ArtifactTagger for FfmpegTagger {
    async fn tag(
        &self,
        input: &Path,
        output: &Path,
        request_id: &str,
        user_id: &str,
    ) -> Result<(), VoiceError> {
        if ensure_artifact(input).await.is_err() {
            return Err(VoiceError::BindingFailed(
                "voice file missing before request binding".into(),
            ));
        }
        if request_id.trim().is_empty() || user_id.trim().is_empty() {
            return Err(VoiceError::BindingFailed(
                "missing request_id/user_id for voice binding".into(),
            ));
        }

        run_tool(
            &self.bin,
            &Self::args(input, output, request_id, user_id),
            None,
            self.timeout,
            "ffmpeg remux failed",
        )
        .await
        .map_err(VoiceError::BindingFailed)?;

        if ensure_artifact(output).await.is_err() {
            return Err(VoiceError::BindingFailed(
                "ffmpeg remux produced no output".into(),
            ));
        }
        Ok(())
    }
}
