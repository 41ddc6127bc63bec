//! Backend traits for provisioning environments and running commands in them.
//!
//! The dispatcher never talks to a hypervisor, emulator or board directly.
//! Everything it needs from the outside world goes through two traits:
//!
//! - [`SandboxProvider`] - creates environments for a hardware profile and
//!   reclaims environments left over from a previous process
//! - [`Sandbox`] - one live environment: run commands, move files, probe
//!   liveness, interrupt, tear down
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     SandboxProvider                          │
//! │                                                              │
//! │  create_sandbox(SandboxSpec) ──────────► Sandbox            │
//! │  reclaim(id, remote_id)                                      │
//! └────────────────────────────────┼────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Sandbox                               │
//! │                                                              │
//! │  exec_stream(Command) ───► OutputStream                     │
//! │  upload(local, remote) / download(paths)                     │
//! │  probe() / interrupt() / terminate()                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Built-in Providers
//!
//! | Provider | Module | Description |
//! |----------|--------|-------------|
//! | Local | [`local`] | Each environment is a host directory; scripts run as child processes |
//! | Command | [`command`] | Lifecycle delegated to user shell templates (QEMU, board farms, ...) |
//!
//! # Error Handling
//!
//! All provider operations return [`ProviderResult<T>`]. A script that runs
//! and exits non-zero is *not* an error; it is reported through
//! [`OutputLine::ExitCode`].

pub mod command;
#[cfg(test)]
pub(crate) mod fake;
pub mod local;

use std::path::Path;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::hardware::HardwareProfile;

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors that can occur during provider operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The backend could not create an environment.
    #[error("Failed to create environment: {0}")]
    CreateFailed(String),

    /// A command could not be started or its output could not be read.
    ///
    /// A command that runs and exits non-zero is NOT an error.
    #[error("Failed to execute command: {0}")]
    ExecFailed(String),

    #[error("Failed to upload file: {0}")]
    UploadFailed(String),

    #[error("Failed to download file: {0}")]
    DownloadFailed(String),

    /// The environment no longer exists on the backend.
    #[error("Environment not found: {0}")]
    NotFound(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Provider-specific error: {0}")]
    Other(#[from] anyhow::Error),
}

/// What the pool asks a provider to create.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Pool-assigned environment id.
    pub id: String,

    /// Catalog template name.
    pub template: String,

    /// Capability the environment must offer.
    pub profile: HardwareProfile,
}

/// A command to execute in an environment.
///
/// # Example
///
/// ```
/// use kdispatch::provider::Command;
///
/// let cmd = Command::new("/bin/sh")
///     .arg("/tmp/kdispatch-test.sh")
///     .working_dir("/tmp")
///     .env("KDISPATCH_RECORD", "plan-1/tc-1");
///
/// assert_eq!(cmd.program, "/bin/sh");
/// assert_eq!(cmd.to_shell_string(), "/bin/sh /tmp/kdispatch-test.sh");
/// ```
#[derive(Debug, Clone)]
pub struct Command {
    pub program: String,

    pub args: Vec<String>,

    /// If `None`, the environment's default working directory is used.
    pub working_dir: Option<String>,

    /// Merged with (and overriding) the environment's own variables.
    pub env: Vec<(String, String)>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Renders the program and arguments as one shell-quoted string.
    pub fn to_shell_string(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(|s| s.as_str()))
            .map(|a| shell_words::quote(a).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A single item from a streaming command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    Stdout(String),
    Stderr(String),
    /// The exit code of the command (yielded last, after all output).
    ExitCode(i32),
}

/// A stream of output lines from a command.
pub type OutputStream = Pin<Box<dyn Stream<Item = OutputLine> + Send>>;

/// One live environment.
///
/// Implementations are shared between the pool (probing, teardown) and a
/// runner (execution) so they must be `Sync`.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Pool-assigned id, constant for the environment's lifetime.
    fn id(&self) -> &str;

    /// Backend handle persisted so a later process can [`SandboxProvider::reclaim`] it.
    fn remote_id(&self) -> Option<&str> {
        None
    }

    /// Starts a command and streams its output, ending with
    /// [`OutputLine::ExitCode`].
    async fn exec_stream(&self, cmd: &Command) -> ProviderResult<OutputStream>;

    /// Copies a host file into the environment.
    async fn upload(&self, local: &Path, remote: &Path) -> ProviderResult<()>;

    /// Copies files out of the environment. `paths` holds `(remote, local)`
    /// pairs.
    async fn download(&self, paths: &[(&Path, &Path)]) -> ProviderResult<()>;

    /// Lightweight liveness check. `Ok(false)` means the environment answered
    /// but is not usable.
    async fn probe(&self) -> ProviderResult<bool>;

    /// Stops every process started through [`exec_stream`](Self::exec_stream)
    /// that is still running. The environment stays usable.
    async fn interrupt(&self) -> ProviderResult<()>;

    /// Tears the environment down. Idempotent.
    async fn terminate(&self) -> ProviderResult<()>;
}

/// Factory for environments.
#[async_trait]
pub trait SandboxProvider: Send + Sync + 'static {
    /// The concrete [`Sandbox`] type created by this provider.
    type Sandbox: Sandbox + 'static;

    /// Provisions a new environment. Returns once it is ready for commands.
    async fn create_sandbox(&self, spec: &SandboxSpec) -> ProviderResult<Self::Sandbox>;

    /// Destroys an environment created by an earlier process, for which no
    /// live handle exists any more.
    async fn reclaim(&self, id: &str, remote_id: Option<&str>) -> ProviderResult<()>;
}
