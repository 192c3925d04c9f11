//! Claude Code in headless mode.
//!
//! [`ClaudeHeadless`] runs `claude -p <prompt> --output-format json` in a
//! working directory under a deadline and turns the JSON envelope into a
//! [`ClaudeReply`]. Both the default implementer and the planner's
//! reasoning service sit on top of it.

use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Deadline applied when the caller sets none.
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// What one headless invocation produced.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaudeReply {
    /// Final result text, or the error description when `failed`.
    pub text: String,
    pub failed: bool,
    pub session_id: Option<String>,
    pub cost_usd: Option<f64>,
    pub num_turns: Option<u32>,
}

impl ClaudeReply {
    fn text_only(text: String, failed: bool) -> Self {
        Self {
            text,
            failed,
            session_id: None,
            cost_usd: None,
            num_turns: None,
        }
    }

    /// `Ok(text)` for a successful reply, `Err(text)` otherwise.
    pub fn into_result(self) -> std::result::Result<String, String> {
        if self.failed {
            Err(self.text)
        } else {
            Ok(self.text)
        }
    }
}

/// The `--output-format json` envelope; only the fields we read.
#[derive(Debug, Deserialize)]
struct Envelope {
    subtype: Option<String>,
    #[serde(default)]
    is_error: bool,
    result: Option<String>,
    error: Option<String>,
    session_id: Option<String>,
    total_cost_usd: Option<f64>,
    num_turns: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ClaudeHeadless {
    binary: PathBuf,
    timeout: Duration,
    /// Appended after the prompt and output format flags.
    extra_args: Vec<String>,
}

impl ClaudeHeadless {
    /// Use `binary`, resolved on `PATH` when possible and taken as is otherwise.
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        let binary = binary.into();
        Self {
            binary: which::which(&binary).unwrap_or(binary),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            extra_args: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn args(&self, prompt: &str) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            prompt.to_string(),
            "--output-format".to_string(),
            "json".to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Run `prompt` in `cwd`. The child is killed when the deadline passes
    /// or the future is dropped.
    ///
    /// # Errors
    /// [`Error::Timeout`] past the deadline, [`Error::Io`] when the process
    /// cannot be spawned.
    pub async fn execute(&self, prompt: &str, cwd: &Path) -> Result<ClaudeReply> {
        debug!(
            binary = %self.binary.display(),
            cwd = %cwd.display(),
            prompt_len = prompt.len(),
            "running claude headless"
        );
        let mut command = Command::new(&self.binary);
        command
            .args(self.args(prompt))
            .current_dir(cwd)
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| Error::Timeout(self.timeout))?
            .map_err(Error::Io)?;

        let reply = Self::reply_from_output(&output);
        debug!(
            failed = reply.failed,
            turns = ?reply.num_turns,
            cost_usd = ?reply.cost_usd,
            "claude finished"
        );
        Ok(reply)
    }

    /// Interpret a finished process: the JSON envelope when stdout holds
    /// one, otherwise the exit status with stderr or stdout as the text.
    pub fn reply_from_output(output: &Output) -> ClaudeReply {
        let stdout = String::from_utf8_lossy(&output.stdout);
        if let Ok(reply) = Self::parse_envelope(stdout.trim()) {
            return reply;
        }

        if output.status.success() {
            return ClaudeReply::text_only(stdout.trim().to_string(), false);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let text = match stderr.trim() {
            "" => format!(
                "claude exited with code {}",
                output.status.code().unwrap_or(-1)
            ),
            message => message.to_string(),
        };
        ClaudeReply::text_only(text, true)
    }

    /// Parse the JSON envelope. `is_error`, an `error` field, or an
    /// `error*` subtype mark the reply as failed.
    pub fn parse_envelope(json: &str) -> Result<ClaudeReply> {
        let envelope: Envelope = serde_json::from_str(json)?;
        let failed = envelope.is_error
            || envelope.error.is_some()
            || envelope
                .subtype
                .as_deref()
                .is_some_and(|s| s.starts_with("error"));

        let (text, failed) = match (failed, envelope.result) {
            (false, Some(result)) => (result, false),
            (false, None) => ("reply carried no result".to_string(), true),
            (true, result) => (
                envelope
                    .error
                    .or(result)
                    .or(envelope.subtype)
                    .unwrap_or_else(|| "unknown error".to_string()),
                true,
            ),
        };

        Ok(ClaudeReply {
            text,
            failed,
            session_id: envelope.session_id,
            cost_usd: envelope.total_cost_usd,
            num_turns: envelope.num_turns,
        })
    }
}
