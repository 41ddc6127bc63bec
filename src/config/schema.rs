//! Configuration schema definitions for kdispatch.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. Backend and store selection use tagged enums.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── DispatchConfig         - Orchestrator loop (concurrency, polling, health checks)
//! ├── PoolConfig             - Environment pool (capacity, catalog, prewarm)
//! ├── RunnerConfig           - Script placement and artifact collection
//! ├── ProviderConfig         - Tagged enum selecting the backend
//! │   ├── Local              - Host directories + child processes
//! │   └── Command            - User shell templates (QEMU, board farms)
//! ├── StoreConfig            - Tagged enum selecting persistence
//! │   ├── Memory             - Process lifetime only
//! │   └── Json               - One JSON document per entity
//! └── ReportConfig           - Output and reporting settings
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::hardware::EnvironmentTemplate;

/// Root configuration structure for kdispatch.
///
/// # TOML Structure
///
/// ```toml
/// [dispatch]
/// max_concurrent = 8
///
/// [pool]
/// max_environments = 4
///
/// [[pool.catalog]]
/// name = "qemu-aarch64"
/// prewarm = 1
/// profile = { architecture = "aarch64", memory_mb = 2048, emulator = "qemu" }
///
/// [provider]
/// type = "local"
///
/// [store]
/// type = "json"
/// path = "~/.local/state/kdispatch"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub dispatch: DispatchConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub runner: RunnerConfig,

    /// Backend that provisions environments and runs scripts in them.
    pub provider: ProviderConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub report: ReportConfig,
}

impl Config {
    /// Number of tests that can actually run at once.
    ///
    /// The global concurrency ceiling and the pool capacity ceiling are
    /// independent knobs; the smaller one governs.
    pub fn effective_parallelism(&self) -> usize {
        self.dispatch.max_concurrent.min(self.pool.max_environments)
    }
}

/// Orchestrator loop settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `max_concurrent` | 8 |
/// | `poll_interval_ms` | 2000 |
/// | `health_check_interval_secs` | 30 |
/// | `stale_after_secs` | 120 |
/// | `cancel_grace_secs` | 30 |
/// | `probe_timeout_secs` | 10 |
/// | `backoff_max_secs` | 60 |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchConfig {
    /// Global ceiling on simultaneously running tests.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Interval between scheduled cycles. A forced poll runs a cycle
    /// immediately regardless.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How often environments are considered for a health probe.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// An environment is probed once it has had no activity for this long.
    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    /// Time a runner gets to acknowledge cancellation before its
    /// environment is destroyed. Also added to the plan timeout for the
    /// orchestrator-level timeout.
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_secs: u64,

    /// Maximum time a single health probe may take.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Upper bound of the delay after consecutive failed cycles.
    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,
}

fn default_max_concurrent() -> usize {
    8
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_health_check_interval() -> u64 {
    30
}

fn default_stale_after() -> u64 {
    120
}

fn default_cancel_grace() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_backoff_max() -> u64 {
    60
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            poll_interval_ms: default_poll_interval_ms(),
            health_check_interval_secs: default_health_check_interval(),
            stale_after_secs: default_stale_after(),
            cancel_grace_secs: default_cancel_grace(),
            probe_timeout_secs: default_probe_timeout(),
            backoff_max_secs: default_backoff_max(),
        }
    }
}

/// Environment pool settings.
///
/// Environments are only created from catalog templates: a test whose
/// hardware requirement no template satisfies stays queued.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Pool capacity ceiling, counting environments being provisioned.
    #[serde(default = "default_max_environments")]
    pub max_environments: usize,

    /// Provision a replacement after tearing down an unhealthy environment.
    #[serde(default = "default_true")]
    pub reprovision_on_failure: bool,

    /// Maximum time a single provisioning call may take.
    #[serde(default = "default_provision_timeout")]
    pub provision_timeout_secs: u64,

    #[serde(default)]
    pub catalog: Vec<EnvironmentTemplate>,
}

fn default_max_environments() -> usize {
    4
}

fn default_provision_timeout() -> u64 {
    900
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_environments: default_max_environments(),
            reprovision_on_failure: true,
            provision_timeout_secs: default_provision_timeout(),
            catalog: Vec::new(),
        }
    }
}

/// How the runner places and executes scripts.
///
/// Relative paths inside the environment resolve against the
/// environment's working directory.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunnerConfig {
    /// Interpreter that runs the uploaded script inside the environment.
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Where the script is written inside the environment.
    #[serde(default = "default_script_path")]
    pub script_path: String,

    /// Paths inside the environment copied back after each attempt.
    #[serde(default)]
    pub artifact_paths: Vec<String>,

    /// Host directory receiving artifacts as `{plan}/{test case}/attempt-{n}`.
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,

    /// Maximum bytes of stdout and of stderr kept per attempt.
    #[serde(default = "default_output_limit")]
    pub output_limit_bytes: usize,

    /// Log script output as it is produced.
    #[serde(default)]
    pub stream_output: bool,
}

fn default_shell() -> String {
    "/bin/sh".to_string()
}

fn default_script_path() -> String {
    "kdispatch-test.sh".to_string()
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("artifacts")
}

fn default_output_limit() -> usize {
    1024 * 1024
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            script_path: default_script_path(),
            artifact_paths: Vec::new(),
            artifacts_dir: default_artifacts_dir(),
            output_limit_bytes: default_output_limit(),
            stream_output: false,
        }
    }
}

/// Backend selection.
///
/// | Type | Description | Use Case |
/// |------|-------------|----------|
/// | `local` | Host directories, child processes | Development, smoke tests |
/// | `command` | Shell templates per lifecycle step | QEMU, libvirt, board farms |
///
/// # Example
///
/// ```toml
/// [provider]
/// type = "command"
/// create_command = "vmctl create --arch {arch} --mem {memory_mb} --name {name}"
/// exec_command = "vmctl exec {env_id} -- sh -c {command}"
/// destroy_command = "vmctl destroy {env_id}"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderConfig {
    Local(LocalProviderConfig),
    Command(CommandProviderConfig),
}

/// Configuration for the local backend.
///
/// Each environment is a fresh directory under `root`; scripts run as
/// child processes of kdispatch with that directory as working directory.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LocalProviderConfig {
    /// Parent directory of environment directories.
    ///
    /// Default: `{system temp}/kdispatch`
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Shell used to start commands.
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Variables set for every command.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for LocalProviderConfig {
    fn default() -> Self {
        Self {
            root: None,
            shell: default_shell(),
            env: HashMap::new(),
        }
    }
}

/// Configuration for the command backend.
///
/// # Placeholders
///
/// | Placeholder | Available In | Value |
/// |-------------|--------------|-------|
/// | `{name}` | create | kdispatch environment id |
/// | `{template}` | create | catalog template name |
/// | `{arch}` | create | architecture |
/// | `{memory_mb}` | create | memory in MB |
/// | `{emulator}` | create | emulator, or `any` |
/// | `{env_id}` | all but create | id printed by `create_command` |
/// | `{command}` | exec | shell-quoted command |
/// | `{local}`, `{remote}` | upload | host path, environment path |
/// | `{paths}` | download | `remote:local` pairs |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommandProviderConfig {
    /// Creates an environment and prints its id as the last stdout line.
    pub create_command: String,

    pub exec_command: String,

    pub destroy_command: String,

    /// Exits 0 when the environment is healthy. Defaults to running `true`
    /// through `exec_command`.
    #[serde(default)]
    pub health_command: Option<String>,

    /// Stops running test processes without destroying the environment.
    #[serde(default)]
    pub interrupt_command: Option<String>,

    /// Copies a file in. Defaults to a heredoc through `exec_command`.
    #[serde(default)]
    pub upload_command: Option<String>,

    /// Copies files out. Without it artifact collection is skipped.
    #[serde(default)]
    pub download_command: Option<String>,

    /// Working directory for all lifecycle commands.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    #[serde(default = "default_shell")]
    pub shell: String,

    /// Timeout for lifecycle commands other than create and exec.
    #[serde(default = "default_command_timeout")]
    pub timeout_secs: u64,
}

fn default_command_timeout() -> u64 {
    300
}

/// Persistence selection.
///
/// ```toml
/// [store]
/// type = "json"
/// path = "~/.local/state/kdispatch"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Nothing survives the process.
    Memory,
    /// One JSON document per entity under `path` (`~` is expanded).
    Json { path: String },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Json {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    ".kdispatch".to_string()
}

/// Configuration for test result reporting.
///
/// | Field | Default |
/// |-------|---------|
/// | `output_dir` | `"test-results"` |
/// | `junit` | `true` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory receiving one `{plan}.xml` JUnit file per plan.
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,

    #[serde(default = "default_true")]
    pub junit: bool,
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_true() -> bool {
    true
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            junit: true,
        }
    }
}

/// A plan read from a TOML file by `kdispatch run`.
///
/// # TOML Structure
///
/// ```toml
/// id = "nightly-arm64"
/// name = "Nightly arm64 BSP"
/// priority = 5
///
/// [config]
/// timeout_minutes = 20
/// retry_failed = true
///
/// [[test_case]]
/// id = "gpio-irq"
/// target_subsystem = "drivers/gpio"
/// script_file = "tests/gpio-irq.sh"
/// hardware = { architecture = "aarch64", memory_mb = 1024, peripherals = ["gpio"] }
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanFile {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    /// Higher is dispatched first.
    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub created_by: Option<String>,

    #[serde(default)]
    pub config: crate::model::ExecutionConfig,

    /// Submit without starting; `kdispatch run` starts it right away.
    #[serde(default = "default_true")]
    pub auto_start: bool,

    #[serde(default, rename = "test_case")]
    pub test_cases: Vec<PlanFileTestCase>,
}

/// One `[[test_case]]` of a [`PlanFile`].
///
/// Exactly one of `script` and `script_file` must be set. `script_file` is
/// relative to the plan file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlanFileTestCase {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    #[serde(default = "default_test_type")]
    pub test_type: crate::model::TestType,

    #[serde(default)]
    pub target_subsystem: String,

    #[serde(default)]
    pub script: Option<String>,

    #[serde(default)]
    pub script_file: Option<PathBuf>,

    pub hardware: crate::hardware::HardwareProfile,

    #[serde(default)]
    pub estimated_duration_secs: Option<u64>,
}

fn default_test_type() -> crate::model::TestType {
    crate::model::TestType::Integration
}
