//! Command backend: environment lifecycle through user shell templates.
//!
//! This backend connects kdispatch to anything that can be driven from a
//! shell: QEMU wrappers, libvirt, a board farm relay, a cloud CLI.
//!
//! # Command Protocol
//!
//! 1. **create_command**: provisions an environment and prints its id as the
//!    last non-empty stdout line
//! 2. **exec_command**: runs `{command}` inside `{env_id}`; its exit code is
//!    the test's exit code
//! 3. **destroy_command**: tears `{env_id}` down
//! 4. **health_command** / **interrupt_command** / **upload_command** /
//!    **download_command**: optional, see
//!    [`CommandProviderConfig`](crate::config::CommandProviderConfig)
//!
//! # Example
//!
//! ```toml
//! [provider]
//! type = "command"
//! create_command = "./qemu-env create --arch {arch} --mem {memory_mb} --name {name}"
//! exec_command = "./qemu-env ssh {env_id} {command}"
//! upload_command = "./qemu-env scp {local} {env_id}:{remote}"
//! health_command = "./qemu-env ping {env_id}"
//! destroy_command = "./qemu-env destroy {env_id}"
//! ```

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    Command, OutputStream, ProviderError, ProviderResult, Sandbox, SandboxProvider, SandboxSpec,
};
use crate::config::CommandProviderConfig;
use crate::connector::ShellConnector;

/// Marker closing the heredoc used by the fallback upload.
const HEREDOC_MARKER: &str = "__KDISPATCH_EOF__";

/// Provider that shells out for every lifecycle step.
pub struct CommandProvider {
    connector: Arc<ShellConnector>,
    config: Arc<CommandProviderConfig>,
    provision_timeout: Duration,
}

impl CommandProvider {
    pub fn new(config: CommandProviderConfig, provision_timeout: Duration) -> Self {
        let mut connector = ShellConnector::new()
            .with_shell(config.shell.clone())
            .with_timeout(config.timeout_secs);
        if let Some(dir) = &config.working_dir {
            connector = connector.with_working_dir(dir.clone());
        }
        Self {
            connector: Arc::new(connector),
            config: Arc::new(config),
            provision_timeout,
        }
    }
}

/// Replaces `{key}` placeholders in `template`.
fn fill(template: &str, values: &[(&str, &str)]) -> String {
    values
        .iter()
        .fold(template.to_string(), |acc, (key, value)| {
            acc.replace(&format!("{{{}}}", key), value)
        })
}

#[async_trait]
impl SandboxProvider for CommandProvider {
    type Sandbox = CommandSandbox;

    async fn create_sandbox(&self, spec: &SandboxSpec) -> ProviderResult<CommandSandbox> {
        let arch = spec.profile.architecture.to_string();
        let memory = spec.profile.memory_mb.to_string();
        let emulator = spec
            .profile
            .emulator
            .value()
            .cloned()
            .unwrap_or_else(|| "any".to_string());
        let create_command = fill(
            &self.config.create_command,
            &[
                ("name", spec.id.as_str()),
                ("template", spec.template.as_str()),
                ("arch", arch.as_str()),
                ("memory_mb", memory.as_str()),
                ("emulator", emulator.as_str()),
            ],
        );

        info!(env = %spec.id, "{}", create_command);
        let result = self
            .connector
            .run_with_timeout(&create_command, self.provision_timeout)
            .await
            .map_err(|e| ProviderError::CreateFailed(e.to_string()))?;

        if result.exit_code != 0 {
            return Err(ProviderError::CreateFailed(format!(
                "create command exited {}: {}",
                result.exit_code,
                result.stderr.trim()
            )));
        }

        let remote_id = result
            .stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or("")
            .to_string();
        if remote_id.is_empty() {
            return Err(ProviderError::CreateFailed(
                "create command printed no environment id".to_string(),
            ));
        }

        info!(env = %spec.id, remote = %remote_id, "Created environment");

        Ok(CommandSandbox {
            id: spec.id.clone(),
            remote_id,
            connector: self.connector.clone(),
            config: self.config.clone(),
            interrupt: Mutex::new(CancellationToken::new()),
            terminated: AtomicBool::new(false),
        })
    }

    async fn reclaim(&self, id: &str, remote_id: Option<&str>) -> ProviderResult<()> {
        let Some(remote_id) = remote_id else {
            warn!(env = %id, "No backend id recorded; nothing to reclaim");
            return Ok(());
        };
        let result = self
            .connector
            .run(&fill(&self.config.destroy_command, &[("env_id", remote_id)]))
            .await?;
        if result.exit_code != 0 {
            warn!(env = %id, "Destroy command failed: {}", result.stderr.trim());
        }
        Ok(())
    }
}

/// An environment managed through shell templates.
pub struct CommandSandbox {
    id: String,
    remote_id: String,
    connector: Arc<ShellConnector>,
    config: Arc<CommandProviderConfig>,
    interrupt: Mutex<CancellationToken>,
    terminated: AtomicBool,
}

impl CommandSandbox {
    fn build_exec_command(&self, cmd: &Command) -> String {
        let mut inner = cmd.to_shell_string();
        if !cmd.env.is_empty() {
            let assignments = cmd
                .env
                .iter()
                .map(|(k, v)| shell_words::quote(&format!("{}={}", k, v)).into_owned())
                .collect::<Vec<_>>()
                .join(" ");
            inner = format!("env {} {}", assignments, inner);
        }
        if let Some(dir) = &cmd.working_dir {
            inner = format!("cd {} && {}", shell_words::quote(dir), inner);
        }
        self.exec_template(&inner)
    }

    fn exec_template(&self, inner: &str) -> String {
        fill(
            &self.config.exec_command,
            &[
                ("env_id", self.remote_id.as_str()),
                ("command", &*shell_words::quote(inner)),
            ],
        )
    }

    fn build_download_command(&self, template: &str, paths: &[(&Path, &Path)]) -> String {
        let paths_str = paths
            .iter()
            .map(|(remote, local)| {
                format!(
                    "{}:{}",
                    shell_words::quote(&remote.to_string_lossy()),
                    shell_words::quote(&local.to_string_lossy())
                )
            })
            .collect::<Vec<_>>()
            .join(" ");
        fill(
            template,
            &[("env_id", self.remote_id.as_str()), ("paths", paths_str.as_str())],
        )
    }
}

#[async_trait]
impl Sandbox for CommandSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn remote_id(&self) -> Option<&str> {
        Some(&self.remote_id)
    }

    async fn exec_stream(&self, cmd: &Command) -> ProviderResult<OutputStream> {
        let shell_cmd = self.build_exec_command(cmd);
        debug!("Streaming on {}: {}", self.remote_id, shell_cmd);
        let interrupt = self
            .interrupt
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .child_token();
        self.connector.run_stream(&shell_cmd, interrupt).await
    }

    async fn upload(&self, local: &Path, remote: &Path) -> ProviderResult<()> {
        let local_str = local.to_string_lossy();
        let remote_str = remote.to_string_lossy();

        let shell_cmd = match &self.config.upload_command {
            Some(template) => fill(
                template,
                &[
                    ("env_id", self.remote_id.as_str()),
                    ("local", &*shell_words::quote(&local_str)),
                    ("remote", &*shell_words::quote(&remote_str)),
                ],
            ),
            None => {
                let content = tokio::fs::read_to_string(local)
                    .await
                    .map_err(|e| ProviderError::UploadFailed(e.to_string()))?;
                if content.lines().any(|l| l == HEREDOC_MARKER) {
                    return Err(ProviderError::UploadFailed(format!(
                        "{} contains the upload marker; configure upload_command",
                        local.display()
                    )));
                }
                let quoted = shell_words::quote(&remote_str);
                let parent = remote
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(|p| format!("mkdir -p {} && ", shell_words::quote(&p.to_string_lossy())))
                    .unwrap_or_default();
                self.exec_template(&format!(
                    "{}cat > {} <<'{}'\n{}\n{}",
                    parent, quoted, HEREDOC_MARKER, content, HEREDOC_MARKER
                ))
            }
        };

        let result = self.connector.run(&shell_cmd).await?;
        if result.exit_code != 0 {
            return Err(ProviderError::UploadFailed(format!(
                "upload to {} exited {}: {}",
                self.remote_id,
                result.exit_code,
                result.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn download(&self, paths: &[(&Path, &Path)]) -> ProviderResult<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let Some(template) = &self.config.download_command else {
            warn!("download_command not configured; skipping artifact download");
            return Ok(());
        };

        for (_, local) in paths {
            if let Some(parent) = local.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ProviderError::DownloadFailed(e.to_string()))?;
            }
        }

        let result = self
            .connector
            .run(&self.build_download_command(template, paths))
            .await?;
        if result.exit_code != 0 {
            return Err(ProviderError::DownloadFailed(format!(
                "download command failed: {}",
                result.stderr.trim()
            )));
        }
        Ok(())
    }

    async fn probe(&self) -> ProviderResult<bool> {
        if self.terminated.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let shell_cmd = match &self.config.health_command {
            Some(template) => fill(template, &[("env_id", self.remote_id.as_str())]),
            None => self.exec_template("true"),
        };
        let result = self.connector.run(&shell_cmd).await?;
        Ok(result.exit_code == 0)
    }

    async fn interrupt(&self) -> ProviderResult<()> {
        {
            let mut token = self.interrupt.lock().unwrap_or_else(|e| e.into_inner());
            token.cancel();
            *token = CancellationToken::new();
        }
        if let Some(template) = &self.config.interrupt_command {
            let result = self
                .connector
                .run(&fill(template, &[("env_id", self.remote_id.as_str())]))
                .await?;
            if result.exit_code != 0 {
                warn!(env = %self.id, "Interrupt command failed: {}", result.stderr.trim());
            }
        }
        Ok(())
    }

    async fn terminate(&self) -> ProviderResult<()> {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.interrupt.lock().unwrap_or_else(|e| e.into_inner()).cancel();

        info!(env = %self.id, remote = %self.remote_id, "Terminating environment");
        let result = self
            .connector
            .run(&fill(&self.config.destroy_command, &[("env_id", self.remote_id.as_str())]))
            .await?;
        if result.exit_code != 0 {
            warn!("Destroy command failed: {}", result.stderr.trim());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{Architecture, HardwareProfile};
    use crate::provider::OutputLine;
    use futures::StreamExt;

    /// Emulates a backend with one directory per environment under `root`.
    fn config(root: &Path) -> CommandProviderConfig {
        let root = root.display();
        CommandProviderConfig {
            create_command: format!("mkdir -p {root}/{{name}} && echo {root}/{{name}}"),
            exec_command: "cd {env_id} && sh -c {command}".to_string(),
            destroy_command: "rm -rf {env_id}".to_string(),
            health_command: Some("test -d {env_id}".to_string()),
            interrupt_command: None,
            upload_command: None,
            download_command: None,
            working_dir: None,
            shell: "/bin/sh".to_string(),
            timeout_secs: 30,
        }
    }

    fn spec() -> SandboxSpec {
        SandboxSpec {
            id: "env-1".to_string(),
            template: "qemu".to_string(),
            profile: HardwareProfile::new(Architecture::Riscv64, 256).with_emulator("qemu"),
        }
    }

    #[test]
    fn test_fill_placeholders() {
        assert_eq!(
            fill("vm create {arch} {memory_mb}", &[("arch", "arm"), ("memory_mb", "64")]),
            "vm create arm 64"
        );
        assert_eq!(fill("{unknown}", &[("arch", "arm")]), "{unknown}");
    }

    #[tokio::test]
    async fn test_lifecycle_through_templates() {
        let root = tempfile::tempdir().unwrap();
        let provider = CommandProvider::new(config(root.path()), Duration::from_secs(30));
        let sandbox = provider.create_sandbox(&spec()).await.unwrap();
        assert_eq!(
            sandbox.remote_id().map(str::to_string),
            Some(root.path().join("env-1").to_string_lossy().to_string())
        );
        assert!(sandbox.probe().await.unwrap());

        let host = tempfile::tempdir().unwrap();
        let script = host.path().join("t.sh");
        std::fs::write(&script, "echo \"it's $GREETING\"\nexit 4\n").unwrap();
        sandbox
            .upload(&script, Path::new("scripts/t.sh"))
            .await
            .unwrap();

        let lines: Vec<OutputLine> = sandbox
            .exec_stream(&Command::new("sh").arg("scripts/t.sh").env("GREETING", "up"))
            .await
            .unwrap()
            .collect()
            .await;
        assert!(lines.contains(&OutputLine::Stdout("it's up".to_string())));
        assert_eq!(lines.last(), Some(&OutputLine::ExitCode(4)));

        sandbox.terminate().await.unwrap();
        sandbox.terminate().await.unwrap();
        assert!(!root.path().join("env-1").exists());
        assert!(!sandbox.probe().await.unwrap());
    }

    #[tokio::test]
    async fn test_create_requires_an_id() {
        let root = tempfile::tempdir().unwrap();
        let mut cfg = config(root.path());
        cfg.create_command = "true".to_string();
        let provider = CommandProvider::new(cfg, Duration::from_secs(30));
        let err = provider.create_sandbox(&spec()).await.err().unwrap();
        assert!(matches!(err, ProviderError::CreateFailed(_)));
    }

    #[tokio::test]
    async fn test_create_failure_reports_stderr() {
        let root = tempfile::tempdir().unwrap();
        let mut cfg = config(root.path());
        cfg.create_command = "echo no capacity >&2; exit 1".to_string();
        let provider = CommandProvider::new(cfg, Duration::from_secs(30));
        let err = provider.create_sandbox(&spec()).await.err().unwrap();
        assert!(err.to_string().contains("no capacity"));
    }
}
