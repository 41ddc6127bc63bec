//! Shell plumbing shared by the process-based providers.
//!
//! [`ShellConnector`] runs one shell snippet either to completion
//! ([`run`](ShellConnector::run)) or as a live [`OutputStream`]
//! ([`run_stream`](ShellConnector::run_stream)). [`stream_child`] turns any
//! spawned child into an [`OutputStream`] that ends with the exit code and
//! kills the child when interrupted or when the stream is dropped.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use futures::stream::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::{LinesStream, ReceiverStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::provider::{OutputLine, OutputStream, ProviderError, ProviderResult};

/// Exit code reported for a command stopped by an interrupt (128 + SIGINT).
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Captured result of [`ShellConnector::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs shell snippets with `{shell} -c`.
#[derive(Debug, Clone)]
pub struct ShellConnector {
    shell: String,
    working_dir: Option<PathBuf>,
    timeout_secs: u64,
}

impl Default for ShellConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellConnector {
    pub fn new() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            working_dir: None,
            timeout_secs: 3600,
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    fn command(&self, script: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.shell);
        cmd.arg("-c").arg(script);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Runs `script` to completion, bounded by the connector timeout.
    pub async fn run(&self, script: &str) -> ProviderResult<ConnectorResult> {
        self.run_with_timeout(script, Duration::from_secs(self.timeout_secs))
            .await
    }

    pub async fn run_with_timeout(
        &self,
        script: &str,
        timeout: Duration,
    ) -> ProviderResult<ConnectorResult> {
        debug!("Running: {}", script);
        let output = tokio::time::timeout(timeout, self.command(script).output())
            .await
            .map_err(|_| {
                ProviderError::Timeout(format!("command did not finish within {:?}", timeout))
            })?
            .map_err(|e| ProviderError::ExecFailed(format!("Failed to run {}: {}", self.shell, e)))?;

        Ok(ConnectorResult {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Starts `script` and streams its output. Cancelling `interrupt` kills it.
    pub async fn run_stream(
        &self,
        script: &str,
        interrupt: CancellationToken,
    ) -> ProviderResult<OutputStream> {
        debug!("Streaming: {}", script);
        let child = self
            .command(script)
            .spawn()
            .map_err(|e| ProviderError::ExecFailed(format!("Failed to spawn {}: {}", self.shell, e)))?;
        stream_child(child, interrupt)
    }
}

/// Converts a spawned child with piped stdout/stderr into an [`OutputStream`].
///
/// The stream always ends with [`OutputLine::ExitCode`] unless the receiver
/// is dropped first. The child is killed if `interrupt` fires or the stream
/// is dropped while it is still running.
pub fn stream_child(
    mut child: tokio::process::Child,
    interrupt: CancellationToken,
) -> ProviderResult<OutputStream> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ProviderError::ExecFailed("stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ProviderError::ExecFailed("stderr not captured".to_string()))?;

    let stdout_stream = LinesStream::new(BufReader::new(stdout).lines())
        .map(|line| OutputLine::Stdout(line.unwrap_or_default()));
    let stderr_stream = LinesStream::new(BufReader::new(stderr).lines())
        .map(|line| OutputLine::Stderr(line.unwrap_or_default()));
    let mut lines = futures::stream::select(stdout_stream, stderr_stream);

    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = interrupt.cancelled() => {
                    let _ = child.kill().await;
                    let _ = tx.send(OutputLine::ExitCode(INTERRUPTED_EXIT_CODE)).await;
                    return;
                }
                _ = tx.closed() => {
                    let _ = child.kill().await;
                    return;
                }
                line = lines.next() => match line {
                    Some(line) => {
                        if tx.send(line).await.is_err() {
                            let _ = child.kill().await;
                            return;
                        }
                    }
                    None => break,
                }
            }
        }

        let code = tokio::select! {
            _ = interrupt.cancelled() => {
                let _ = child.kill().await;
                INTERRUPTED_EXIT_CODE
            }
            status = child.wait() => status.ok().and_then(|s| s.code()).unwrap_or(-1),
        };
        let _ = tx.send(OutputLine::ExitCode(code)).await;
    });

    Ok(Box::pin(ReceiverStream::new(rx)))
}
