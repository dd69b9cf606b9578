//! External CLI driver.
//!
//! Spawns a configured command, delivers the request as one JSON document
//! on stdin, and reads NDJSON from stdout: any number of
//! `{"type":"progress", ...}` lines followed by one terminal
//! `{"type":"result", ...}` or `{"type":"error", ...}` line. Cancellation
//! kills the child.

use std::process::Stdio;

use async_trait::async_trait;
use ksi_core::SessionId;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::driver::{ProviderDriver, ProviderError, ProviderReply, ProviderRequest, ProviderUsage};

/// Driver that shells out to an external model CLI.
#[derive(Debug, Clone)]
pub struct CliDriver {
    name: String,
    /// Argv template; `{model}` in any element is replaced per request.
    argv: Vec<String>,
}

/// One stdout line from the child.
#[derive(Debug)]
enum CliLine {
    Progress(serde_json::Value),
    Result {
        session_id: Option<String>,
        result: serde_json::Value,
        usage: ProviderUsage,
    },
    Error {
        message: String,
        retryable: bool,
    },
}

impl CliLine {
    /// Classify one NDJSON line by its `type` field.
    fn parse(line: &str) -> Result<Self, String> {
        let value: serde_json::Value = serde_json::from_str(line).map_err(|e| e.to_string())?;
        match value.get("type").and_then(|t| t.as_str()) {
            Some("progress") => Ok(Self::Progress(value)),
            Some("result") => Ok(Self::Result {
                session_id: value
                    .get("session_id")
                    .and_then(|s| s.as_str())
                    .map(str::to_owned),
                result: value.get("result").cloned().unwrap_or_default(),
                usage: value
                    .get("usage")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| e.to_string())?
                    .unwrap_or_default(),
            }),
            Some("error") => Ok(Self::Error {
                message: value
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unspecified provider error")
                    .to_owned(),
                retryable: value
                    .get("retryable")
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false),
            }),
            other => Err(format!("unknown line type {other:?}")),
        }
    }
}

impl CliDriver {
    /// Build a driver from a provider name and argv template.
    #[must_use]
    pub fn new(name: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            name: name.into(),
            argv,
        }
    }

    fn build_command(&self, model: &str) -> Result<Command, ProviderError> {
        let mut argv = self.argv.iter().map(|a| a.replace("{model}", model));
        let program = argv
            .next()
            .ok_or_else(|| ProviderError::Failed(format!("provider {} has an empty argv", self.name)))?;
        let mut command = Command::new(program);
        command
            .args(argv)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(command)
    }
}

#[async_trait]
impl ProviderDriver for CliDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        request: ProviderRequest,
        progress: mpsc::Sender<serde_json::Value>,
        cancel: CancellationToken,
    ) -> Result<ProviderReply, ProviderError> {
        let mut child = self
            .build_command(&request.model)?
            .spawn()
            .map_err(|e| ProviderError::Io(format!("spawn {}: {e}", self.name)))?;

        // Deliver the request on stdin, then close it so line-oriented
        // CLIs see EOF.
        let payload =
            serde_json::to_vec(&request).map_err(|e| ProviderError::Failed(e.to_string()))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| ProviderError::Io(format!("stdin: {e}")))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| ProviderError::Io(format!("stdin close: {e}")))?;
        }

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::Io("child stdout unavailable".to_owned()))?;
        let mut lines = BufReader::new(stdout).lines();

        let outcome = loop {
            let line = tokio::select! {
                () = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(ProviderError::Cancelled);
                },
                line = lines.next_line() => line,
            };
            match line {
                Err(e) => break Err(ProviderError::Io(format!("stdout: {e}"))),
                Ok(None) => {
                    break Err(ProviderError::Io(format!(
                        "provider {} exited without a terminal line",
                        self.name
                    )));
                },
                Ok(Some(line)) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match CliLine::parse(line) {
                        Ok(CliLine::Progress(data)) => {
                            if progress.send(data).await.is_err() {
                                debug!(provider = %self.name, "progress receiver dropped");
                            }
                        },
                        Ok(CliLine::Result {
                            session_id,
                            result,
                            usage,
                        }) => {
                            // Session simulation: a CLI with no native
                            // session concept echoes the prior id, or gets
                            // a fresh one minted here on first contact.
                            let session_id = match session_id {
                                Some(sid) => SessionId::from(sid),
                                None => request.session_id.clone().unwrap_or_else(|| {
                                    SessionId::from(format!(
                                        "{}-{}",
                                        self.name,
                                        Uuid::new_v4().simple()
                                    ))
                                }),
                            };
                            break Ok(ProviderReply {
                                session_id,
                                result,
                                usage,
                            });
                        },
                        Ok(CliLine::Error { message, retryable }) => {
                            break if retryable {
                                Err(ProviderError::Transient(message))
                            } else {
                                Err(ProviderError::Failed(message))
                            };
                        },
                        Err(e) => {
                            warn!(provider = %self.name, error = %e, "unparseable provider line");
                        },
                    }
                },
            }
        };

        // Reap the child; a non-zero exit after a clean result line is
        // the provider's problem, not ours.
        match child.wait().await {
            Ok(status) => debug!(provider = %self.name, %status, "provider exited"),
            Err(e) => warn!(provider = %self.name, error = %e, "failed to reap provider"),
        }
        outcome
    }
}
