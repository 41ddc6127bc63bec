//! In-process backend for deterministic tests.
//!
//! Scripts are interpreted line by line instead of being executed:
//!
//! | Line | Effect |
//! |------|--------|
//! | `echo TEXT` | stdout line |
//! | `warn TEXT` | stderr line |
//! | `sleep SECS` | `tokio::time::sleep` (auto-advanced under paused time) |
//! | `hang` | never finishes until interrupted |
//! | `exit N` | ends with exit code `N` |
//! | `write PATH TEXT` | creates a file inside the environment |
//! | `unhealthy` | makes the environment fail its next probes |
//! | `attempt KEY` | counts attempts of `KEY` across all environments |
//! | `first: LINE` | runs `LINE` only on the first attempt of the last `KEY` |
//!
//! A script whose first line is `crash` makes `exec_stream` itself fail.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::{
    Command, OutputLine, OutputStream, ProviderError, ProviderResult, Sandbox, SandboxProvider,
    SandboxSpec,
};
use crate::connector::INTERRUPTED_EXIT_CODE;

/// Observable state shared by a [`FakeProvider`] and all its sandboxes.
#[derive(Debug, Default)]
pub(crate) struct FakeState {
    pub created: Vec<String>,
    pub terminated: Vec<String>,
    pub reclaimed: Vec<String>,
    pub interrupted: Vec<String>,
    pub unhealthy: HashSet<String>,
    /// Number of upcoming `create_sandbox` calls that fail.
    pub fail_creates: usize,
    pub create_delay: Duration,
    /// Makes `interrupt` never return.
    pub hang_interrupts: bool,
    /// Environments with a script currently executing, with counts.
    pub executing: HashMap<String, usize>,
    /// Set if an environment ever ran two scripts at once.
    pub overlap: bool,
    /// Highest number of scripts running at once across all environments.
    pub peak_executing: usize,
    /// Record ids (from `KDISPATCH_RECORD`) in the order they started.
    pub started: Vec<String>,
    attempts: HashMap<String, u32>,
}

#[derive(Clone, Default)]
pub(crate) struct FakeProvider {
    state: Arc<Mutex<FakeState>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn mark_unhealthy(&self, env_id: &str) {
        self.state().unhealthy.insert(env_id.to_string());
    }
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    type Sandbox = FakeSandbox;

    async fn create_sandbox(&self, spec: &SandboxSpec) -> ProviderResult<FakeSandbox> {
        let delay = self.state().create_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        {
            let mut state = self.state();
            if state.fail_creates > 0 {
                state.fail_creates -= 1;
                return Err(ProviderError::CreateFailed("no capacity".to_string()));
            }
            state.created.push(spec.id.clone());
        }
        Ok(FakeSandbox {
            id: spec.id.clone(),
            state: self.state.clone(),
            files: Arc::new(Mutex::new(HashMap::new())),
            interrupt: Mutex::new(CancellationToken::new()),
            terminated: AtomicBool::new(false),
        })
    }

    async fn reclaim(&self, id: &str, _remote_id: Option<&str>) -> ProviderResult<()> {
        self.state().reclaimed.push(id.to_string());
        Ok(())
    }
}

pub(crate) struct FakeSandbox {
    id: String,
    state: Arc<Mutex<FakeState>>,
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
    interrupt: Mutex<CancellationToken>,
    terminated: AtomicBool,
}

impl FakeSandbox {
    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Decrements the executing count when the interpreted script ends.
struct Executing {
    id: String,
    state: Arc<Mutex<FakeState>>,
}

impl Drop for Executing {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = state.executing.get_mut(&self.id) {
            *count = count.saturating_sub(1);
        }
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn remote_id(&self) -> Option<&str> {
        Some(&self.id)
    }

    async fn exec_stream(&self, cmd: &Command) -> ProviderResult<OutputStream> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(ProviderError::NotFound(self.id.clone()));
        }
        let path = cmd
            .args
            .last()
            .map(PathBuf::from)
            .ok_or_else(|| ProviderError::ExecFailed("no script argument".to_string()))?;
        let script = self
            .files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&path)
            .cloned()
            .ok_or_else(|| ProviderError::ExecFailed(format!("{} not found", path.display())))?;
        if script.lines().next().map(str::trim) == Some("crash") {
            return Err(ProviderError::ExecFailed("executor crashed".to_string()));
        }

        let guard = {
            let mut state = self.state();
            if let Some((_, record)) = cmd.env.iter().find(|(k, _)| k == "KDISPATCH_RECORD") {
                state.started.push(record.clone());
            }
            let count = state.executing.entry(self.id.clone()).or_default();
            *count += 1;
            if *count > 1 {
                state.overlap = true;
            }
            let total: usize = state.executing.values().sum();
            state.peak_executing = state.peak_executing.max(total);
            Executing {
                id: self.id.clone(),
                state: self.state.clone(),
            }
        };

        let interrupt = self
            .interrupt
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .child_token();
        let state = self.state.clone();
        let files = self.files.clone();
        let id = self.id.clone();
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            let _guard = guard;
            let code = tokio::select! {
                _ = interrupt.cancelled() => INTERRUPTED_EXIT_CODE,
                _ = tx.closed() => return,
                code = interpret(&script, &id, &state, &files, &tx) => code,
            };
            let _ = tx.send(OutputLine::ExitCode(code)).await;
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }

    async fn upload(&self, local: &Path, remote: &Path) -> ProviderResult<()> {
        // Synchronous: paused test time must not auto-advance during file I/O.
        let content = std::fs::read_to_string(local)
            .map_err(|e| ProviderError::UploadFailed(e.to_string()))?;
        self.files
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(remote.to_path_buf(), content);
        Ok(())
    }

    async fn download(&self, paths: &[(&Path, &Path)]) -> ProviderResult<()> {
        for (remote, local) in paths {
            let content = self
                .files
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(*remote)
                .cloned()
                .ok_or_else(|| ProviderError::DownloadFailed(remote.display().to_string()))?;
            if let Some(parent) = local.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(local, content)?;
        }
        Ok(())
    }

    async fn probe(&self) -> ProviderResult<bool> {
        if self.terminated.load(Ordering::SeqCst) {
            return Ok(false);
        }
        Ok(!self.state().unhealthy.contains(&self.id))
    }

    async fn interrupt(&self) -> ProviderResult<()> {
        let hang = {
            let mut state = self.state();
            state.interrupted.push(self.id.clone());
            state.hang_interrupts
        };
        if hang {
            std::future::pending::<()>().await;
        }
        let mut token = self.interrupt.lock().unwrap_or_else(|e| e.into_inner());
        token.cancel();
        *token = CancellationToken::new();
        Ok(())
    }

    async fn terminate(&self) -> ProviderResult<()> {
        if !self.terminated.swap(true, Ordering::SeqCst) {
            self.interrupt.lock().unwrap_or_else(|e| e.into_inner()).cancel();
            self.state().terminated.push(self.id.clone());
        }
        Ok(())
    }
}

async fn interpret(
    script: &str,
    id: &str,
    state: &Mutex<FakeState>,
    files: &Mutex<HashMap<PathBuf, String>>,
    tx: &mpsc::Sender<OutputLine>,
) -> i32 {
    let mut attempt = 0;
    for line in script.lines() {
        let mut line = line.trim();
        if let Some(rest) = line.strip_prefix("first:") {
            if attempt != 1 {
                continue;
            }
            line = rest.trim();
        }
        let (op, arg) = line.split_once(' ').unwrap_or((line, ""));
        match op {
            "echo" => {
                let _ = tx.send(OutputLine::Stdout(arg.to_string())).await;
            }
            "warn" => {
                let _ = tx.send(OutputLine::Stderr(arg.to_string())).await;
            }
            "sleep" => {
                let secs: u64 = arg.trim().parse().unwrap_or(0);
                tokio::time::sleep(Duration::from_secs(secs)).await;
            }
            "hang" => std::future::pending::<()>().await,
            "exit" => return arg.trim().parse().unwrap_or(1),
            "write" => {
                let (path, text) = arg.split_once(' ').unwrap_or((arg, ""));
                files
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(PathBuf::from(path), text.to_string());
            }
            "unhealthy" => {
                state
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .unhealthy
                    .insert(id.to_string());
            }
            "attempt" => {
                let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                let count = state.attempts.entry(arg.to_string()).or_default();
                *count += 1;
                attempt = *count;
            }
            _ => {}
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{Architecture, HardwareProfile};
    use futures::StreamExt;

    async fn run(sandbox: &FakeSandbox, script: &str) -> Vec<OutputLine> {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("t.sh");
        std::fs::write(&local, script).unwrap();
        sandbox.upload(&local, Path::new("t.sh")).await.unwrap();
        sandbox
            .exec_stream(&Command::new("sh").arg("t.sh"))
            .await
            .unwrap()
            .collect()
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_interprets_script() {
        let provider = FakeProvider::new();
        let sandbox = provider
            .create_sandbox(&SandboxSpec {
                id: "env-1".to_string(),
                template: "t".to_string(),
                profile: HardwareProfile::new(Architecture::Arm, 64),
            })
            .await
            .unwrap();

        let lines = run(&sandbox, "echo hi\nsleep 60\nwarn careful\nexit 2\necho never").await;
        assert_eq!(
            lines,
            vec![
                OutputLine::Stdout("hi".to_string()),
                OutputLine::Stderr("careful".to_string()),
                OutputLine::ExitCode(2),
            ]
        );

        let first = run(&sandbox, "attempt k\nfirst: exit 1\nexit 0").await;
        let second = run(&sandbox, "attempt k\nfirst: exit 1\nexit 0").await;
        assert_eq!(first.last(), Some(&OutputLine::ExitCode(1)));
        assert_eq!(second.last(), Some(&OutputLine::ExitCode(0)));
        assert!(!provider.state().overlap);
    }
}
