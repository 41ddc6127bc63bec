//! Core data model: test cases, plans, execution records and environments.
//!
//! Every type here is serializable because it is the durable state the
//! [`PlanStore`](crate::store::PlanStore) and
//! [`EnvironmentPool`](crate::orchestrator::EnvironmentPool) persist. Process
//! caches are rebuilt from these records alone.
//!
//! # Record Lifecycle
//!
//! ```text
//!   queued ──acquire──► environment_pending ──runner started──► running
//!     ▲                                                            │
//!     │ retry (once)                    ┌──────────┬───────────┬───┴───────┐
//!     │                                 ▼          ▼           ▼           ▼
//!     └───────────────────────────── failed    completed   timed_out   cancelled
//! ```
//!
//! `queued` and `running` may also move straight to `cancelled`, and a
//! record whose environment never materializes moves from `queued` to
//! `failed`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hardware::HardwareProfile;

/// Identifier of an [`ExecutionPlan`].
pub type PlanId = String;

/// Identifier of an [`ExecutionRecord`], `"{plan_id}/{test_case_id}"`.
pub type RecordId = String;

/// Identifier of an environment.
pub type EnvironmentId = String;

/// Category of a test case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestType {
    Unit,
    Integration,
    Performance,
    Stress,
    Fuzz,
    Security,
}

/// A single test to run in one environment. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub id: String,

    pub name: String,

    pub test_type: TestType,

    /// Kernel/BSP subsystem under test (e.g. `mm`, `net/ipv4`, `drivers/gpio`).
    pub target_subsystem: String,

    /// Script body executed inside the environment. Never interpreted here.
    pub script: String,

    pub hardware: HardwareProfile,

    /// Estimated duration in seconds.
    #[serde(default)]
    pub estimated_duration_secs: Option<u64>,

    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Execution settings shared by all tests in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Per-test timeout in minutes.
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u64,

    /// Re-queue a failed test once.
    #[serde(default)]
    pub retry_failed: bool,

    /// Allow more than one test of this plan to run at the same time.
    #[serde(default = "default_true")]
    pub parallel_execution: bool,

    /// Name of the preferred catalog template.
    #[serde(default)]
    pub environment_preference: Option<String>,
}

fn default_timeout_minutes() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: default_timeout_minutes(),
            retry_failed: false,
            parallel_execution: true,
            environment_preference: None,
        }
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_minutes.saturating_mul(60))
    }
}

/// Lifecycle of a plan as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// Submitted but waiting for an explicit start.
    Held,
    /// Accepted; records exist or will be expanded on the next cycle.
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PlanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Cancelled
        )
    }
}

impl fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PlanStatus::Held => "held",
            PlanStatus::Queued => "queued",
            PlanStatus::Running => "running",
            PlanStatus::Completed => "completed",
            PlanStatus::Failed => "failed",
            PlanStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A submitted batch of test cases sharing priority and configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: PlanId,

    /// Test case ids in submission order.
    pub test_case_ids: Vec<String>,

    /// Higher is dispatched first.
    pub priority: i32,

    pub created_at: DateTime<Utc>,

    /// Monotonic submission counter; breaks ties between equal timestamps.
    pub sequence: u64,

    #[serde(default)]
    pub test_plan_name: Option<String>,

    #[serde(default)]
    pub created_by: Option<String>,

    pub config: ExecutionConfig,

    pub status: PlanStatus,

    /// Set once the plan's records exist.
    #[serde(default)]
    pub expanded: bool,

    /// Set by an explicit cancellation; processed by the next cycle.
    #[serde(default)]
    pub cancel_requested: bool,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

/// State of one execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Queued,
    EnvironmentPending,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl RecordState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RecordState::Completed
                | RecordState::Failed
                | RecordState::TimedOut
                | RecordState::Cancelled
        )
    }

    /// Returns `true` for states that hold (or are about to hold) an
    /// environment.
    pub fn is_active(&self) -> bool {
        matches!(self, RecordState::EnvironmentPending | RecordState::Running)
    }

    /// Returns `true` if `self -> next` is a legal transition.
    ///
    /// `Failed -> Queued` is the only backwards edge and is legal only as
    /// an explicit retry.
    pub fn can_transition_to(&self, next: RecordState) -> bool {
        use RecordState::*;
        matches!(
            (self, next),
            (Queued, EnvironmentPending)
                | (Queued, Failed)
                | (Queued, Cancelled)
                | (EnvironmentPending, Running)
                | (EnvironmentPending, Queued)
                | (EnvironmentPending, Failed)
                | (EnvironmentPending, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, TimedOut)
                | (Running, Cancelled)
                | (Failed, Queued)
        )
    }
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordState::Queued => "queued",
            RecordState::EnvironmentPending => "environment_pending",
            RecordState::Running => "running",
            RecordState::Completed => "completed",
            RecordState::Failed => "failed",
            RecordState::TimedOut => "timed_out",
            RecordState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Why a record did not complete successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No environment could be created for the requested profile.
    ProvisioningFailure,
    /// The script exited non-zero or crashed.
    ExecutionFailure,
    /// The script exceeded the plan timeout.
    TimeoutExceeded,
    /// The environment failed a health check while the test was bound to it.
    EnvironmentHealthFailure,
    /// The scheduler restarted while the test was running.
    OrchestratorRestart,
    /// Explicit user cancellation.
    Cancelled,
}

impl FailureKind {
    /// Returns `true` if a plan with `retry_failed` may re-queue this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FailureKind::ExecutionFailure | FailureKind::EnvironmentHealthFailure
        )
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::ProvisioningFailure => "provisioning failure",
            FailureKind::ExecutionFailure => "execution failure",
            FailureKind::TimeoutExceeded => "timeout exceeded",
            FailureKind::EnvironmentHealthFailure => "environment health failure",
            FailureKind::OrchestratorRestart => "orchestrator restart",
            FailureKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A failure classification plus a human-readable reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    pub kind: FailureKind,
    pub reason: String,
}

impl Failure {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}

/// Output captured from one attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifacts {
    pub stdout: String,
    pub stderr: String,

    /// Host paths of files downloaded from the environment.
    #[serde(default)]
    pub files: Vec<std::path::PathBuf>,

    /// SHA-256 of the script that ran, hex encoded.
    #[serde(default)]
    pub script_sha256: Option<String>,
}

/// Tracked lifecycle of one test case within one plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: RecordId,
    pub plan_id: PlanId,
    pub test_case_id: String,

    /// Position of the test case in its plan.
    pub position: usize,

    pub state: RecordState,

    /// Number of retries consumed. The first attempt is retry 0.
    pub retry_count: u32,

    pub queued_at: DateTime<Utc>,

    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub exit_code: Option<i32>,

    #[serde(default)]
    pub environment_id: Option<EnvironmentId>,

    #[serde(default)]
    pub failure: Option<Failure>,

    #[serde(default)]
    pub artifacts: Artifacts,
}

impl ExecutionRecord {
    pub fn new(plan_id: &str, test_case_id: &str, position: usize) -> Self {
        Self {
            id: record_id(plan_id, test_case_id),
            plan_id: plan_id.to_string(),
            test_case_id: test_case_id.to_string(),
            position,
            state: RecordState::Queued,
            retry_count: 0,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit_code: None,
            environment_id: None,
            failure: None,
            artifacts: Artifacts::default(),
        }
    }
}

/// Builds the id of the record for `test_case_id` in `plan_id`.
pub fn record_id(plan_id: &str, test_case_id: &str) -> RecordId {
    format!("{}/{}", plan_id, test_case_id)
}

/// Lifecycle state of an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentState {
    Provisioning,
    Ready,
    Busy,
    TearingDown,
    Destroyed,
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EnvironmentState::Provisioning => "provisioning",
            EnvironmentState::Ready => "ready",
            EnvironmentState::Busy => "busy",
            EnvironmentState::TearingDown => "tearing_down",
            EnvironmentState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Result of the last liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Durable description of an environment owned by the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentRecord {
    pub id: EnvironmentId,

    /// Backend handle returned at creation, needed to reclaim the
    /// environment after a restart.
    #[serde(default)]
    pub remote_id: Option<String>,

    /// Catalog template this environment was built from.
    pub template: String,

    pub profile: HardwareProfile,

    pub state: EnvironmentState,

    pub health: Health,

    pub last_activity: DateTime<Utc>,

    /// The record currently running in this environment.
    #[serde(default)]
    pub bound_record: Option<RecordId>,

    /// The record this environment was provisioned for, until it claims it.
    #[serde(default)]
    pub reserved_for: Option<RecordId>,

    pub created_at: DateTime<Utc>,
}
