//! Execution runner: one test case in one leased environment.
//!
//! The [`ExecutionRunner`] uploads the test script, runs it with the
//! configured shell, collects bounded output and copies artifacts back to
//! the host. [`run`](ExecutionRunner::run) always returns: the script's exit,
//! the deadline, cancellation and backend errors all end in an
//! [`ExecutionOutcome`]. The runner never changes the environment's pool
//! state; the caller releases it based on the outcome.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use kdispatch::config::RunnerConfig;
//! use kdispatch::model::{ExecutionRecord, TestCase};
//! use kdispatch::orchestrator::ExecutionRunner;
//! use kdispatch::provider::local::LocalSandbox;
//! use tokio_util::sync::CancellationToken;
//!
//! async fn run_one(sandbox: &LocalSandbox, record: &ExecutionRecord, test_case: &TestCase) {
//!     let runner = ExecutionRunner::new(RunnerConfig::default());
//!     let outcome = runner
//!         .run(sandbox, record, test_case, Duration::from_secs(600), CancellationToken::new())
//!         .await;
//!     println!("{}", outcome.summary());
//! }
//! ```

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::select;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::model::{Artifacts, ExecutionRecord, TestCase};
use crate::provider::{Command, OutputLine, Sandbox};
use crate::store::persist::escape_id;

/// Callback for streamed script output, called with the record id.
pub type OutputCallback = Arc<dyn Fn(&str, &OutputLine) + Send + Sync>;

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The script ran to its end. The exit code may be non-zero.
    Completed { exit_code: i32, artifacts: Artifacts },

    /// The script could not be run to its end because of the environment
    /// or the backend.
    Failed { reason: String, artifacts: Artifacts },

    /// The deadline passed; the script was interrupted.
    TimedOut { artifacts: Artifacts },

    /// Cancellation was requested; the script was interrupted.
    Cancelled { artifacts: Artifacts },
}

impl ExecutionOutcome {
    pub fn artifacts(&self) -> &Artifacts {
        match self {
            ExecutionOutcome::Completed { artifacts, .. }
            | ExecutionOutcome::Failed { artifacts, .. }
            | ExecutionOutcome::TimedOut { artifacts }
            | ExecutionOutcome::Cancelled { artifacts } => artifacts,
        }
    }

    /// Whether the environment can safely run another test.
    ///
    /// Backend failures and timeouts leave the environment in an unknown
    /// state.
    pub fn environment_reusable(&self) -> bool {
        matches!(
            self,
            ExecutionOutcome::Completed { .. } | ExecutionOutcome::Cancelled { .. }
        )
    }

    pub fn summary(&self) -> String {
        match self {
            ExecutionOutcome::Completed { exit_code, .. } => {
                format!("completed with exit code {}", exit_code)
            }
            ExecutionOutcome::Failed { reason, .. } => format!("failed: {}", reason),
            ExecutionOutcome::TimedOut { .. } => "timed out".to_string(),
            ExecutionOutcome::Cancelled { .. } => "cancelled".to_string(),
        }
    }
}

/// Output kept for one stream, cut off at a byte limit.
struct BoundedOutput {
    limit: usize,
    text: String,
    dropped: usize,
}

impl BoundedOutput {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            text: String::new(),
            dropped: 0,
        }
    }

    fn push_line(&mut self, line: &str) {
        if self.dropped > 0 || self.text.len() + line.len() + 1 > self.limit {
            self.dropped += line.len() + 1;
            return;
        }
        self.text.push_str(line);
        self.text.push('\n');
    }

    fn finish(mut self) -> String {
        if self.dropped > 0 {
            self.text
                .push_str(&format!("[kdispatch: {} bytes of output dropped]\n", self.dropped));
        }
        self.text
    }
}

enum StreamEnd {
    Exited(i32),
    Deadline,
    Cancelled,
    Broken(String),
}

/// Runs test scripts inside environments.
#[derive(Clone)]
pub struct ExecutionRunner {
    config: RunnerConfig,
    output_callback: Option<OutputCallback>,
}

impl ExecutionRunner {
    pub fn new(config: RunnerConfig) -> Self {
        Self {
            config,
            output_callback: None,
        }
    }

    /// Sets a callback receiving every output line as it is produced.
    pub fn with_output_callback(mut self, callback: OutputCallback) -> Self {
        self.output_callback = Some(callback);
        self
    }

    /// Host directory receiving the artifacts of one attempt.
    pub fn attempt_dir(&self, record: &ExecutionRecord) -> PathBuf {
        self.config
            .artifacts_dir
            .join(escape_id(&record.plan_id))
            .join(escape_id(&record.test_case_id))
            .join(format!("attempt-{}", record.retry_count + 1))
    }

    /// Runs `test_case` in `sandbox` until it exits, `timeout` elapses or
    /// `cancel` fires.
    ///
    /// On timeout and cancellation the in-environment process is
    /// interrupted before returning.
    pub async fn run<S: Sandbox + ?Sized>(
        &self,
        sandbox: &S,
        record: &ExecutionRecord,
        test_case: &TestCase,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> ExecutionOutcome {
        let deadline = Instant::now() + timeout;
        let mut artifacts = Artifacts {
            script_sha256: Some(script_digest(&test_case.script)),
            ..Default::default()
        };

        let staged = select! {
            biased;
            _ = cancel.cancelled() => return ExecutionOutcome::Cancelled { artifacts },
            staged = tokio::time::timeout_at(deadline, self.stage_script(sandbox, &test_case.script)) => staged,
        };
        match staged {
            Ok(Ok(())) => {}
            Ok(Err(reason)) => return ExecutionOutcome::Failed { reason, artifacts },
            Err(_) => {
                interrupt(sandbox).await;
                return ExecutionOutcome::TimedOut { artifacts };
            }
        }

        let cmd = Command::new(&self.config.shell)
            .arg(&self.config.script_path)
            .env("KDISPATCH_RECORD", &record.id)
            .env("KDISPATCH_PLAN", &record.plan_id)
            .env("KDISPATCH_TEST_CASE", &record.test_case_id)
            .env("KDISPATCH_ATTEMPT", (record.retry_count + 1).to_string());

        let mut stream = match sandbox.exec_stream(&cmd).await {
            Ok(stream) => stream,
            Err(e) => {
                return ExecutionOutcome::Failed {
                    reason: format!("failed to start script: {}", e),
                    artifacts,
                };
            }
        };

        info!(record = %record.id, env = %sandbox.id(), "Script started");

        let mut stdout = BoundedOutput::new(self.config.output_limit_bytes);
        let mut stderr = BoundedOutput::new(self.config.output_limit_bytes);
        let end = loop {
            select! {
                biased;
                _ = cancel.cancelled() => break StreamEnd::Cancelled,
                _ = tokio::time::sleep_until(deadline) => break StreamEnd::Deadline,
                line = stream.next() => {
                    let Some(line) = line else {
                        break StreamEnd::Broken("output ended without an exit code".to_string());
                    };
                    if let Some(callback) = &self.output_callback {
                        callback(&record.id, &line);
                    }
                    match &line {
                        OutputLine::Stdout(s) => {
                            if self.config.stream_output {
                                info!(record = %record.id, "{}", s);
                            }
                            stdout.push_line(s);
                        }
                        OutputLine::Stderr(s) => {
                            if self.config.stream_output {
                                warn!(record = %record.id, "{}", s);
                            }
                            stderr.push_line(s);
                        }
                        OutputLine::ExitCode(code) => break StreamEnd::Exited(*code),
                    }
                }
            }
        };
        drop(stream);

        artifacts.stdout = stdout.finish();
        artifacts.stderr = stderr.finish();

        match end {
            StreamEnd::Exited(exit_code) => {
                debug!(record = %record.id, exit_code, "Script exited");
                artifacts.files = self.collect_artifacts(sandbox, record, deadline).await;
                ExecutionOutcome::Completed {
                    exit_code,
                    artifacts,
                }
            }
            StreamEnd::Deadline => {
                warn!(record = %record.id, "Script exceeded {:?}; interrupting", timeout);
                interrupt(sandbox).await;
                ExecutionOutcome::TimedOut { artifacts }
            }
            StreamEnd::Cancelled => {
                info!(record = %record.id, "Script cancelled; interrupting");
                interrupt(sandbox).await;
                ExecutionOutcome::Cancelled { artifacts }
            }
            StreamEnd::Broken(reason) => ExecutionOutcome::Failed { reason, artifacts },
        }
    }

    /// Writes the script to a temporary file and uploads it.
    async fn stage_script<S: Sandbox + ?Sized>(
        &self,
        sandbox: &S,
        script: &str,
    ) -> Result<(), String> {
        let mut file = tempfile::NamedTempFile::new()
            .map_err(|e| format!("failed to create script file: {}", e))?;
        file.write_all(script.as_bytes())
            .and_then(|_| file.flush())
            .map_err(|e| format!("failed to write script file: {}", e))?;

        sandbox
            .upload(file.path(), Path::new(&self.config.script_path))
            .await
            .map_err(|e| format!("failed to upload script: {}", e))
    }

    /// Downloads the configured artifact paths, skipping missing ones.
    ///
    /// Bounded by the attempt deadline.
    async fn collect_artifacts<S: Sandbox + ?Sized>(
        &self,
        sandbox: &S,
        record: &ExecutionRecord,
        deadline: Instant,
    ) -> Vec<PathBuf> {
        if self.config.artifact_paths.is_empty() {
            return Vec::new();
        }
        let dir = self.attempt_dir(record);
        let mut files = Vec::new();

        for remote in &self.config.artifact_paths {
            let remote = Path::new(remote);
            let Some(name) = remote.file_name() else {
                continue;
            };
            let local = dir.join(name);
            match tokio::time::timeout_at(deadline, sandbox.download(&[(remote, &local)])).await {
                Ok(Ok(())) => files.push(local),
                Ok(Err(e)) => {
                    debug!(record = %record.id, "Artifact {} not collected: {}", remote.display(), e)
                }
                Err(_) => {
                    warn!(record = %record.id, "Artifact collection ran past the deadline");
                    break;
                }
            }
        }
        files
    }
}

async fn interrupt<S: Sandbox + ?Sized>(sandbox: &S) {
    if let Err(e) = sandbox.interrupt().await {
        warn!(env = %sandbox.id(), "Failed to interrupt script: {}", e);
    }
}

/// Hex SHA-256 of a script body.
pub fn script_digest(script: &str) -> String {
    format!("{:x}", Sha256::digest(script.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{Architecture, HardwareProfile};
    use crate::provider::fake::{FakeProvider, FakeSandbox};
    use crate::provider::{SandboxProvider, SandboxSpec};
    use crate::store::tests::case;

    async fn sandbox(provider: &FakeProvider) -> FakeSandbox {
        provider
            .create_sandbox(&SandboxSpec {
                id: "env-1".to_string(),
                template: "arm".to_string(),
                profile: HardwareProfile::new(Architecture::Aarch64, 1024),
            })
            .await
            .unwrap()
    }

    fn runner(dir: &Path) -> ExecutionRunner {
        ExecutionRunner::new(RunnerConfig {
            artifacts_dir: dir.to_path_buf(),
            ..Default::default()
        })
    }

    async fn run(runner: &ExecutionRunner, sandbox: &FakeSandbox, script: &str) -> ExecutionOutcome {
        let tc = case("boot", script);
        let record = ExecutionRecord::new("plan-1", &tc.id, 0);
        runner
            .run(
                sandbox,
                &record,
                &tc,
                Duration::from_secs(600),
                CancellationToken::new(),
            )
            .await
    }

    #[tokio::test]
    async fn test_completed_captures_output_and_digest() {
        let provider = FakeProvider::new();
        let sandbox = sandbox(&provider).await;
        let dir = tempfile::tempdir().unwrap();
        let script = "echo booted\nwarn slow clock\nexit 0";

        let outcome = run(&runner(dir.path()), &sandbox, script).await;
        let ExecutionOutcome::Completed {
            exit_code,
            artifacts,
        } = outcome
        else {
            panic!("expected completion, got {:?}", outcome);
        };
        assert_eq!(exit_code, 0);
        assert_eq!(artifacts.stdout, "booted\n");
        assert_eq!(artifacts.stderr, "slow clock\n");
        assert_eq!(artifacts.script_sha256, Some(script_digest(script)));
        assert_eq!(provider.state().started, vec!["plan-1/boot".to_string()]);
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_still_completed() {
        let provider = FakeProvider::new();
        let sandbox = sandbox(&provider).await;
        let dir = tempfile::tempdir().unwrap();

        let outcome = run(&runner(dir.path()), &sandbox, "exit 3").await;
        assert!(matches!(
            outcome,
            ExecutionOutcome::Completed { exit_code: 3, .. }
        ));
        assert!(outcome.environment_reusable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_interrupts_script() {
        let provider = FakeProvider::new();
        let sandbox = sandbox(&provider).await;
        let dir = tempfile::tempdir().unwrap();
        let tc = case("hang", "echo start\nhang");
        let record = ExecutionRecord::new("plan-1", &tc.id, 0);

        let outcome = runner(dir.path())
            .run(
                &sandbox,
                &record,
                &tc,
                Duration::from_secs(60),
                CancellationToken::new(),
            )
            .await;

        assert!(matches!(outcome, ExecutionOutcome::TimedOut { .. }));
        assert_eq!(outcome.artifacts().stdout, "start\n");
        assert!(!outcome.environment_reusable());
        assert_eq!(provider.state().interrupted, vec!["env-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_script() {
        let provider = FakeProvider::new();
        let sandbox = sandbox(&provider).await;
        let dir = tempfile::tempdir().unwrap();
        let tc = case("hang", "hang");
        let record = ExecutionRecord::new("plan-1", &tc.id, 0);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let outcome = runner(dir.path())
            .run(&sandbox, &record, &tc, Duration::from_secs(600), cancel)
            .await;
        assert!(matches!(outcome, ExecutionOutcome::Cancelled { .. }));
        assert_eq!(provider.state().interrupted.len(), 1);
    }

    #[tokio::test]
    async fn test_backend_error_is_failure() {
        let provider = FakeProvider::new();
        let sandbox = sandbox(&provider).await;
        let dir = tempfile::tempdir().unwrap();

        let outcome = run(&runner(dir.path()), &sandbox, "crash").await;
        assert!(matches!(outcome, ExecutionOutcome::Failed { .. }));
        assert!(!outcome.environment_reusable());
    }

    #[tokio::test]
    async fn test_artifacts_are_collected_per_attempt() {
        let provider = FakeProvider::new();
        let sandbox = sandbox(&provider).await;
        let dir = tempfile::tempdir().unwrap();
        let runner = ExecutionRunner::new(RunnerConfig {
            artifacts_dir: dir.path().to_path_buf(),
            artifact_paths: vec!["dmesg.log".to_string(), "missing.log".to_string()],
            ..Default::default()
        });

        let outcome = run(&runner, &sandbox, "write dmesg.log kernel ok\nexit 0").await;
        let expected = dir.path().join("plan-1/boot/attempt-1/dmesg.log");
        assert_eq!(outcome.artifacts().files, vec![expected.clone()]);
        assert_eq!(std::fs::read_to_string(expected).unwrap(), "kernel ok");
    }

    #[test]
    fn test_output_is_bounded() {
        let mut out = BoundedOutput::new(8);
        out.push_line("abc");
        out.push_line("defgh");
        out.push_line("i");
        let text = out.finish();
        assert!(text.starts_with("abc\n"));
        assert!(text.contains("8 bytes of output dropped"));
    }
}
