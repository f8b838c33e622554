// src/llm/cli.rs
// Subprocess adapter for CLI-backed providers (claude_code, qwen_code).
// Writes the conversation as JSON on stdin, reads stream-json lines on
// stdout, and concatenates the assistant message text parts.

use crate::error::{Result, SibylError};
use crate::llm::provider::{LlmClient, Provider};
use crate::llm::types::{ChatReply, ChatRequest};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Hard ceiling for a single CLI invocation.
const CLI_MAX_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Bound on the `--version` availability probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct CliClient {
    provider: Provider,
    command: String,
}

impl CliClient {
    pub fn claude_code() -> Self {
        Self {
            provider: Provider::ClaudeCode,
            command: "claude".into(),
        }
    }

    pub fn qwen_code() -> Self {
        Self {
            provider: Provider::QwenCode,
            command: "qwen".into(),
        }
    }

    /// Override the executable, for tests and nonstandard installs.
    pub fn with_command(provider: Provider, command: impl Into<String>) -> Self {
        Self {
            provider,
            command: command.into(),
        }
    }

    fn spawn_error(&self, e: std::io::Error) -> SibylError {
        if e.kind() == std::io::ErrorKind::NotFound {
            SibylError::CliMissing {
                command: self.command.clone(),
            }
        } else {
            SibylError::Io(e)
        }
    }
}

#[async_trait]
impl LlmClient for CliClient {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatReply> {
        let request_id = Uuid::new_v4().to_string();
        let start = Instant::now();
        let timeout = request.timeout.min(CLI_MAX_TIMEOUT);

        let mut cmd = Command::new(&self.command);
        cmd.arg("-p")
            .arg("--output-format")
            .arg("stream-json")
            .arg("--model")
            .arg(&request.model);
        if let Some(system) = &request.system {
            cmd.arg("--system-prompt").arg(system);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;

        // Drain stderr in the background so the child never blocks on a
        // full pipe; its diagnostics land in our logs.
        if let Some(stderr) = child.stderr.take() {
            let command = self.command.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(command = %command, "cli stderr: {}", line.trim());
                }
            });
        }

        let stdin = child.stdin.take().ok_or_else(|| {
            SibylError::Other(format!("{} produced no stdin handle", self.command))
        })?;
        let mut stdin = BufWriter::new(stdin);
        let messages = json!([{ "role": "user", "content": request.prompt }]);
        stdin.write_all(messages.to_string().as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        // Close stdin so the CLI knows the conversation is complete
        drop(stdin);

        let stdout = child.stdout.take().ok_or_else(|| {
            SibylError::Other(format!("{} produced no stdout handle", self.command))
        })?;

        let read_all = async {
            let mut reader = BufReader::new(stdout).lines();
            let mut content = String::new();
            while let Some(line) = reader.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(event) => {
                        if let Some(text) = extract_assistant_text(&event) {
                            content.push_str(&text);
                        }
                    }
                    Err(_) => debug!(request_id = %request_id, "Skipping non-JSON CLI line"),
                }
            }
            Ok::<String, SibylError>(content)
        };

        let content = match tokio::time::timeout(timeout, read_all).await {
            Ok(result) => result?,
            Err(_) => {
                // Kill and reap so the subprocess doesn't leak
                let _ = child.kill().await;
                let _ = child.wait().await;
                warn!(request_id = %request_id, command = %self.command, "CLI chat timed out");
                return Err(SibylError::Timeout {
                    provider: self.provider.to_string(),
                    after_ms: timeout.as_millis() as u64,
                });
            }
        };

        let status = child.wait().await?;
        if !status.success() {
            return Err(SibylError::Provider {
                provider: self.provider.to_string(),
                status: None,
                message: format!("{} exited with {status}", self.command),
            });
        }
        if content.is_empty() {
            return Err(SibylError::Provider {
                provider: self.provider.to_string(),
                status: None,
                message: "no assistant text in CLI output".into(),
            });
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        info!(
            request_id = %request_id,
            command = %self.command,
            model = %request.model,
            duration_ms,
            "CLI chat complete"
        );

        Ok(ChatReply {
            request_id,
            content,
            usage: None,
            duration_ms,
        })
    }

    async fn probe(&self) -> bool {
        let mut cmd = Command::new(&self.command);
        cmd.arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(_) => return false,
        };

        match tokio::time::timeout(PROBE_TIMEOUT, child.wait_with_output()).await {
            Ok(Ok(output)) => output.status.success(),
            _ => false,
        }
    }
}

/// Pull the text parts out of one `stream-json` assistant event.
fn extract_assistant_text(event: &Value) -> Option<String> {
    if event.get("type").and_then(Value::as_str) != Some("assistant") {
        return None;
    }
    let parts = event.get("message")?.get("content")?.as_array()?;
    let text: String = parts
        .iter()
        .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect();
    if text.is_empty() { None } else { Some(text) }
}
