//! Local backend: each environment is a directory on the host.
//!
//! This backend does not emulate hardware. It exists for developing test
//! scripts and for smoke-testing the dispatcher itself without a hypervisor.
//!
//! # Characteristics
//!
//! | Feature | Support |
//! |---------|---------|
//! | Isolation | Per-environment working directory only |
//! | Hardware emulation | None; the catalog profile is advertised as-is |
//! | File transfer | Local copies inside the environment directory |
//! | Interrupt | Kills child processes started by the environment |
//!
//! # Example Configuration
//!
//! ```toml
//! [provider]
//! type = "local"
//! root = "/var/tmp/kdispatch"
//! shell = "/bin/bash"
//!
//! [provider.env]
//! KERNEL_SRC = "/src/linux"
//! ```
//!
//! Every command also sees `KDISPATCH_ENV_ID`, `KDISPATCH_TEMPLATE`,
//! `KDISPATCH_ARCH` and `KDISPATCH_MEMORY_MB`.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    Command, OutputStream, ProviderError, ProviderResult, Sandbox, SandboxProvider, SandboxSpec,
};
use crate::config::LocalProviderConfig;
use crate::connector::stream_child;

/// Provider that creates host directories as environments.
pub struct LocalProvider {
    config: LocalProviderConfig,
    root: PathBuf,
}

impl LocalProvider {
    pub fn new(config: LocalProviderConfig) -> Self {
        let root = config
            .root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("kdispatch"));
        Self { config, root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl SandboxProvider for LocalProvider {
    type Sandbox = LocalSandbox;

    async fn create_sandbox(&self, spec: &SandboxSpec) -> ProviderResult<LocalSandbox> {
        let dir = self.root.join(&spec.id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| ProviderError::CreateFailed(format!("{}: {}", dir.display(), e)))?;

        let mut env: Vec<(String, String)> = self
            .config
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.push(("KDISPATCH_ENV_ID".to_string(), spec.id.clone()));
        env.push(("KDISPATCH_TEMPLATE".to_string(), spec.template.clone()));
        env.push((
            "KDISPATCH_ARCH".to_string(),
            spec.profile.architecture.to_string(),
        ));
        env.push((
            "KDISPATCH_MEMORY_MB".to_string(),
            spec.profile.memory_mb.to_string(),
        ));

        info!(env = %spec.id, dir = %dir.display(), "Created local environment");

        Ok(LocalSandbox {
            id: spec.id.clone(),
            remote_id: dir.to_string_lossy().to_string(),
            dir,
            env,
            shell: self.config.shell.clone(),
            interrupt: Mutex::new(CancellationToken::new()),
        })
    }

    async fn reclaim(&self, id: &str, remote_id: Option<&str>) -> ProviderResult<()> {
        let dir = remote_id
            .map(PathBuf::from)
            .unwrap_or_else(|| self.root.join(id));
        remove_dir(&dir).await?;
        info!(env = %id, "Reclaimed local environment");
        Ok(())
    }
}

/// One local environment.
///
/// Paths inside the environment (absolute or relative) are resolved under
/// its directory, so scripts from different environments never share
/// files.
pub struct LocalSandbox {
    id: String,
    remote_id: String,
    dir: PathBuf,
    env: Vec<(String, String)>,
    shell: String,
    interrupt: Mutex<CancellationToken>,
}

impl LocalSandbox {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        let relative: PathBuf = path
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        self.dir.join(relative)
    }

    fn current_interrupt(&self) -> CancellationToken {
        self.interrupt
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .child_token()
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn remote_id(&self) -> Option<&str> {
        Some(&self.remote_id)
    }

    async fn exec_stream(&self, cmd: &Command) -> ProviderResult<OutputStream> {
        if !self.dir.is_dir() {
            return Err(ProviderError::NotFound(self.id.clone()));
        }

        let mut process = tokio::process::Command::new(&self.shell);
        process.arg("-c").arg(cmd.to_shell_string());
        process.current_dir(match &cmd.working_dir {
            Some(dir) => self.resolve(Path::new(dir)),
            None => self.dir.clone(),
        });
        for (key, value) in self.env.iter().chain(cmd.env.iter()) {
            process.env(key, value);
        }
        process.stdin(Stdio::null());
        process.stdout(Stdio::piped());
        process.stderr(Stdio::piped());
        process.kill_on_drop(true);

        let child = process
            .spawn()
            .map_err(|e| ProviderError::ExecFailed(e.to_string()))?;
        debug!(env = %self.id, "Started: {}", cmd.to_shell_string());
        stream_child(child, self.current_interrupt())
    }

    async fn upload(&self, local: &Path, remote: &Path) -> ProviderResult<()> {
        let dest = self.resolve(remote);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProviderError::UploadFailed(e.to_string()))?;
        }
        tokio::fs::copy(local, &dest)
            .await
            .map_err(|e| ProviderError::UploadFailed(format!("{}: {}", local.display(), e)))?;
        Ok(())
    }

    async fn download(&self, paths: &[(&Path, &Path)]) -> ProviderResult<()> {
        for (remote, local) in paths {
            let src = self.resolve(remote);
            if let Some(parent) = local.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ProviderError::DownloadFailed(e.to_string()))?;
            }
            if src.is_dir() {
                copy_dir_all(&src, local)
                    .await
                    .map_err(|e| ProviderError::DownloadFailed(e.to_string()))?;
            } else {
                tokio::fs::copy(&src, local).await.map_err(|e| {
                    ProviderError::DownloadFailed(format!("{}: {}", remote.display(), e))
                })?;
            }
        }
        Ok(())
    }

    async fn probe(&self) -> ProviderResult<bool> {
        Ok(tokio::fs::metadata(&self.dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false))
    }

    async fn interrupt(&self) -> ProviderResult<()> {
        let mut token = self.interrupt.lock().unwrap_or_else(|e| e.into_inner());
        token.cancel();
        *token = CancellationToken::new();
        Ok(())
    }

    async fn terminate(&self) -> ProviderResult<()> {
        self.interrupt().await?;
        remove_dir(&self.dir).await
    }
}

async fn remove_dir(dir: &Path) -> ProviderResult<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Recursively copy a directory.
async fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dst).await?;

    let mut entries = tokio::fs::read_dir(src).await?;
    while let Some(entry) = entries.next_entry().await? {
        let ty = entry.file_type().await?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if ty.is_dir() {
            Box::pin(copy_dir_all(&src_path, &dst_path)).await?;
        } else {
            tokio::fs::copy(&src_path, &dst_path).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{Architecture, HardwareProfile};
    use crate::provider::OutputLine;
    use futures::StreamExt;

    fn provider(root: &Path) -> LocalProvider {
        LocalProvider::new(LocalProviderConfig {
            root: Some(root.to_path_buf()),
            ..Default::default()
        })
    }

    fn spec(id: &str) -> SandboxSpec {
        SandboxSpec {
            id: id.to_string(),
            template: "host".to_string(),
            profile: HardwareProfile::new(Architecture::X86_64, 1024),
        }
    }

    #[tokio::test]
    async fn test_exec_runs_in_environment_dir() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = provider(root.path())
            .create_sandbox(&spec("env-1"))
            .await
            .unwrap();

        let lines: Vec<OutputLine> = sandbox
            .exec_stream(&Command::new("sh").args(["-c", "pwd; echo $KDISPATCH_ARCH"]))
            .await
            .unwrap()
            .collect()
            .await;

        let dir = sandbox.dir().to_string_lossy().to_string();
        assert!(lines.contains(&OutputLine::Stdout(dir)));
        assert!(lines.contains(&OutputLine::Stdout("x86_64".to_string())));
        assert_eq!(lines.last(), Some(&OutputLine::ExitCode(0)));
    }

    #[tokio::test]
    async fn test_upload_and_download_stay_inside_environment() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = provider(root.path())
            .create_sandbox(&spec("env-1"))
            .await
            .unwrap();

        let host = tempfile::tempdir().unwrap();
        let script = host.path().join("t.sh");
        std::fs::write(&script, "echo hi > out.txt\n").unwrap();

        sandbox
            .upload(&script, Path::new("/tmp/t.sh"))
            .await
            .unwrap();
        assert!(sandbox.dir().join("tmp/t.sh").exists());

        let lines: Vec<OutputLine> = sandbox
            .exec_stream(&Command::new("sh").arg("tmp/t.sh"))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(lines.last(), Some(&OutputLine::ExitCode(0)));

        let dest = host.path().join("artifacts/out.txt");
        sandbox
            .download(&[(Path::new("out.txt"), dest.as_path())])
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(dest).unwrap(), "hi\n");
    }

    #[tokio::test]
    async fn test_interrupt_stops_running_commands() {
        let root = tempfile::tempdir().unwrap();
        let sandbox = provider(root.path())
            .create_sandbox(&spec("env-1"))
            .await
            .unwrap();

        let mut stream = sandbox
            .exec_stream(&Command::new("sleep").arg("30"))
            .await
            .unwrap();
        sandbox.interrupt().await.unwrap();

        let last = tokio::time::timeout(std::time::Duration::from_secs(5), stream.next())
            .await
            .unwrap();
        assert_eq!(
            last,
            Some(OutputLine::ExitCode(crate::connector::INTERRUPTED_EXIT_CODE))
        );
        assert!(sandbox.probe().await.unwrap());
    }

    #[tokio::test]
    async fn test_terminate_and_reclaim_are_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let provider = provider(root.path());
        let sandbox = provider.create_sandbox(&spec("env-1")).await.unwrap();

        sandbox.terminate().await.unwrap();
        sandbox.terminate().await.unwrap();
        assert!(!sandbox.probe().await.unwrap());

        provider.reclaim("env-1", None).await.unwrap();
        provider.reclaim("env-2", None).await.unwrap();
    }
}
