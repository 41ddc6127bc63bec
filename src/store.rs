//! Priority queue and plan store.
//!
//! The [`PlanStore`] owns every [`ExecutionPlan`], [`TestCase`] and
//! [`ExecutionRecord`]. All mutation goes through a narrow set of
//! operations, each serialized on the entity it touches (one mutex per plan
//! and per record) so unrelated records never contend. Every mutation is
//! written through to a [`Persistence`] backend before it returns.
//!
//! # Dispatch Order
//!
//! [`peek_next`](PlanStore::peek_next) orders queued records by:
//!
//! 1. plan priority, descending
//! 2. plan creation time, ascending (FIFO within a priority band)
//! 3. plan submission sequence, ascending
//! 4. position of the test case in its plan
//!
//! All four keys are persisted fields, so the order is identical after a
//! restart.
//!
//! # Example
//!
//! ```
//! use kdispatch::store::{PlanStore, PlanSubmission};
//! use kdispatch::store::persist::MemoryPersistence;
//! use kdispatch::model::ExecutionConfig;
//! use std::sync::Arc;
//!
//! let store = PlanStore::open(Arc::new(MemoryPersistence::new()))?;
//! let plan = store.submit(PlanSubmission::new("nightly", vec![], 5))?;
//! assert_eq!(plan.priority, 5);
//! # Ok::<(), kdispatch::store::StoreError>(())
//! ```

pub mod persist;

use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::model::{
    Artifacts, EnvironmentId, ExecutionConfig, ExecutionPlan, ExecutionRecord, Failure, PlanId,
    PlanStatus, RecordId, RecordState, TestCase, record_id,
};
use persist::{EntityKind, Persistence, load_entities, put_entity};

/// Errors returned by [`PlanStore`] operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Unknown plan: {0}")]
    UnknownPlan(PlanId),

    #[error("Unknown record: {0}")]
    UnknownRecord(RecordId),

    #[error("Plan already exists: {0}")]
    DuplicatePlan(PlanId),

    #[error("Plan {plan} lists test case {test_case} more than once")]
    DuplicateTestCase { plan: PlanId, test_case: String },

    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Record {record} cannot move from {from} to {to}")]
    InvalidTransition {
        record: RecordId,
        from: RecordState,
        to: RecordState,
    },

    #[error("Plan {plan} is {status}")]
    InvalidPlanState { plan: PlanId, status: PlanStatus },

    #[error("Persistence I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Persistence encoding error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Longest per-test timeout a plan may ask for (one week).
pub const MAX_TIMEOUT_MINUTES: u64 = 7 * 24 * 60;

/// Input of [`PlanStore::submit`].
#[derive(Debug, Clone)]
pub struct PlanSubmission {
    pub id: PlanId,
    pub test_cases: Vec<TestCase>,
    pub priority: i32,
    pub config: ExecutionConfig,
    pub test_plan_name: Option<String>,
    pub created_by: Option<String>,

    /// When `false` the plan is held until [`PlanStore::start`].
    pub auto_start: bool,
}

impl PlanSubmission {
    pub fn new(id: impl Into<String>, test_cases: Vec<TestCase>, priority: i32) -> Self {
        Self {
            id: id.into(),
            test_cases,
            priority,
            config: ExecutionConfig::default(),
            test_plan_name: None,
            created_by: None,
            auto_start: true,
        }
    }

    pub fn with_config(mut self, config: ExecutionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.test_plan_name = Some(name.into());
        self
    }

    pub fn with_created_by(mut self, who: impl Into<String>) -> Self {
        self.created_by = Some(who.into());
        self
    }

    pub fn held(mut self) -> Self {
        self.auto_start = false;
        self
    }
}

/// A queued record together with what is needed to dispatch it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub record: ExecutionRecord,
    pub test_case: Arc<TestCase>,
    pub priority: i32,
    pub config: ExecutionConfig,
}

/// Selects records for [`PlanStore::list`].
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub plan_id: Option<PlanId>,
    pub states: Option<Vec<RecordState>>,
}

impl RecordFilter {
    pub fn plan(plan_id: impl Into<String>) -> Self {
        Self {
            plan_id: Some(plan_id.into()),
            states: None,
        }
    }

    pub fn states(states: &[RecordState]) -> Self {
        Self {
            plan_id: None,
            states: Some(states.to_vec()),
        }
    }

    pub fn with_states(mut self, states: &[RecordState]) -> Self {
        self.states = Some(states.to_vec());
        self
    }

    fn accepts(&self, record: &ExecutionRecord) -> bool {
        self.plan_id.as_ref().is_none_or(|p| *p == record.plan_id)
            && self
                .states
                .as_ref()
                .is_none_or(|states| states.contains(&record.state))
    }
}

/// Terminal outcome written by [`PlanStore::mark_terminal`].
#[derive(Debug, Clone)]
pub struct TerminalUpdate {
    pub state: RecordState,
    pub exit_code: Option<i32>,
    pub failure: Option<Failure>,
    pub artifacts: Option<Artifacts>,
}

impl TerminalUpdate {
    pub fn completed(exit_code: i32, artifacts: Artifacts) -> Self {
        Self {
            state: RecordState::Completed,
            exit_code: Some(exit_code),
            failure: None,
            artifacts: Some(artifacts),
        }
    }

    pub fn failed(failure: Failure) -> Self {
        Self {
            state: RecordState::Failed,
            exit_code: None,
            failure: Some(failure),
            artifacts: None,
        }
    }

    pub fn timed_out(failure: Failure) -> Self {
        Self {
            state: RecordState::TimedOut,
            exit_code: None,
            failure: Some(failure),
            artifacts: None,
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self {
            state: RecordState::Cancelled,
            exit_code: None,
            failure: Some(Failure::new(crate::model::FailureKind::Cancelled, reason)),
            artifacts: None,
        }
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn with_artifacts(mut self, artifacts: Artifacts) -> Self {
        self.artifacts = Some(artifacts);
        self
    }
}

/// Counts removed by [`PlanStore::purge_terminal_older_than`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeSummary {
    pub records: usize,
    pub plans: usize,
}

type Shared<T> = Arc<Mutex<T>>;

/// Durable store of plans and their execution records.
pub struct PlanStore {
    persistence: Arc<dyn Persistence>,
    plans: RwLock<HashMap<PlanId, Shared<ExecutionPlan>>>,
    /// Test cases keyed by the id of the record that runs them.
    cases: RwLock<HashMap<RecordId, Arc<TestCase>>>,
    records: RwLock<HashMap<RecordId, Shared<ExecutionRecord>>>,
    /// Plan ids being written by an in-progress [`submit`](Self::submit).
    submitting: Mutex<HashSet<PlanId>>,
    next_sequence: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl PlanStore {
    /// Opens the store, rebuilding in-memory state from `persistence`.
    pub fn open(persistence: Arc<dyn Persistence>) -> Result<Self, StoreError> {
        let plans: Vec<ExecutionPlan> = load_entities(persistence.as_ref(), EntityKind::Plan)?;
        let cases: Vec<StoredCase> = load_entities(persistence.as_ref(), EntityKind::TestCase)?;
        let records: Vec<ExecutionRecord> =
            load_entities(persistence.as_ref(), EntityKind::Record)?;

        let next_sequence = plans.iter().map(|p| p.sequence + 1).max().unwrap_or(0);

        if !plans.is_empty() {
            info!(
                "Recovered {} plans and {} records from persistence",
                plans.len(),
                records.len()
            );
        }

        Ok(Self {
            persistence,
            plans: RwLock::new(
                plans
                    .into_iter()
                    .map(|p| (p.id.clone(), Arc::new(Mutex::new(p))))
                    .collect(),
            ),
            cases: RwLock::new(
                cases
                    .into_iter()
                    .map(|c| (c.record_id, Arc::new(c.test_case)))
                    .collect(),
            ),
            records: RwLock::new(
                records
                    .into_iter()
                    .map(|r| (r.id.clone(), Arc::new(Mutex::new(r))))
                    .collect(),
            ),
            submitting: Mutex::new(HashSet::new()),
            next_sequence: AtomicU64::new(next_sequence),
        })
    }

    /// Accepts a new plan.
    ///
    /// Test cases are persisted before the plan itself so a persisted plan
    /// always has its test cases.
    pub fn submit(&self, submission: PlanSubmission) -> Result<ExecutionPlan, StoreError> {
        // Record ids are `{plan}/{case}`, so neither part may contain '/'.
        check_id("plan id", &submission.id)?;
        for case in &submission.test_cases {
            check_id("test case id", &case.id)?;
        }

        if !(1..=MAX_TIMEOUT_MINUTES).contains(&submission.config.timeout_minutes) {
            return Err(StoreError::InvalidPlan(format!(
                "timeout_minutes must be between 1 and {}",
                MAX_TIMEOUT_MINUTES
            )));
        }

        let mut seen = HashSet::new();
        for case in &submission.test_cases {
            if !seen.insert(case.id.as_str()) {
                return Err(StoreError::DuplicateTestCase {
                    plan: submission.id.clone(),
                    test_case: case.id.clone(),
                });
            }
        }

        let plan_id = submission.id.clone();
        {
            let plans = self.plans.read().unwrap_or_else(|e| e.into_inner());
            let mut submitting = lock(&self.submitting);
            if plans.contains_key(&plan_id) || !submitting.insert(plan_id.clone()) {
                return Err(StoreError::DuplicatePlan(plan_id));
            }
        }

        let result = self.persist_submission(submission).map(|(plan, cases)| {
            self.cases
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .extend(cases);
            self.plans
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(plan.id.clone(), Arc::new(Mutex::new(plan.clone())));
            plan
        });
        lock(&self.submitting).remove(&plan_id);
        let plan = result?;

        info!(
            plan = %plan.id,
            priority = plan.priority,
            tests = plan.test_case_ids.len(),
            status = %plan.status,
            "Plan submitted"
        );
        Ok(plan)
    }

    /// Writes the test cases, then the plan. Holds no store lock.
    fn persist_submission(
        &self,
        submission: PlanSubmission,
    ) -> Result<(ExecutionPlan, Vec<(RecordId, Arc<TestCase>)>), StoreError> {
        let plan = ExecutionPlan {
            id: submission.id.clone(),
            test_case_ids: submission.test_cases.iter().map(|c| c.id.clone()).collect(),
            priority: submission.priority,
            created_at: Utc::now(),
            sequence: self.next_sequence.fetch_add(1, Ordering::SeqCst),
            test_plan_name: submission.test_plan_name,
            created_by: submission.created_by,
            config: submission.config,
            status: if submission.auto_start {
                PlanStatus::Queued
            } else {
                PlanStatus::Held
            },
            expanded: false,
            cancel_requested: false,
            started_at: None,
            finished_at: None,
        };

        let mut cases = Vec::with_capacity(submission.test_cases.len());
        for case in submission.test_cases {
            let rid = record_id(&plan.id, &case.id);
            let stored = StoredCase {
                record_id: rid.clone(),
                test_case: case,
            };
            put_entity(self.persistence.as_ref(), EntityKind::TestCase, &rid, &stored)?;
            cases.push((rid, Arc::new(stored.test_case)));
        }
        put_entity(self.persistence.as_ref(), EntityKind::Plan, &plan.id, &plan)?;
        Ok((plan, cases))
    }

    /// Releases a held plan for dispatch. Starting a queued or running plan
    /// is a no-op.
    pub fn start(&self, plan_id: &str) -> Result<ExecutionPlan, StoreError> {
        let plan = self.plan_handle(plan_id)?;
        let mut plan = lock(&*plan);
        match plan.status {
            PlanStatus::Held => {
                plan.status = PlanStatus::Queued;
                put_entity(self.persistence.as_ref(), EntityKind::Plan, &plan.id, &*plan)?;
                info!(plan = %plan.id, "Plan started");
                Ok(plan.clone())
            }
            PlanStatus::Queued | PlanStatus::Running => Ok(plan.clone()),
            status => Err(StoreError::InvalidPlanState {
                plan: plan.id.clone(),
                status,
            }),
        }
    }

    /// Plans accepted for dispatch whose records do not exist yet.
    pub fn unexpanded_plans(&self) -> Vec<PlanId> {
        let plans = self.plans.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<(i32, DateTime<Utc>, u64, PlanId)> = plans
            .values()
            .filter_map(|p| {
                let p = lock(&**p);
                (p.status == PlanStatus::Queued && !p.expanded && !p.cancel_requested)
                    .then(|| (p.priority, p.created_at, p.sequence, p.id.clone()))
            })
            .collect();
        out.sort_by_key(|(priority, created, seq, _)| (Reverse(*priority), *created, *seq));
        out.into_iter().map(|(_, _, _, id)| id).collect()
    }

    /// Creates one queued record per test case of the plan.
    ///
    /// Idempotent: records that already exist are kept as they are.
    pub fn expand(&self, plan_id: &str) -> Result<usize, StoreError> {
        let plan = self.plan_handle(plan_id)?;
        let mut plan = lock(&*plan);
        if plan.expanded || plan.cancel_requested {
            return Ok(0);
        }

        let created = self.create_records(&plan, |_| {})?;

        let mut next = plan.clone();
        next.expanded = true;
        if next.test_case_ids.is_empty() {
            next.status = PlanStatus::Completed;
            next.finished_at = Some(Utc::now());
        }
        put_entity(self.persistence.as_ref(), EntityKind::Plan, &next.id, &next)?;
        *plan = next;
        debug!(plan = %plan.id, records = created, "Plan expanded");
        Ok(created)
    }

    /// Creates the missing records of `plan`, each prepared by `init`.
    ///
    /// Callers hold the plan's lock, so two calls never race on one plan.
    fn create_records(
        &self,
        plan: &ExecutionPlan,
        init: impl Fn(&mut ExecutionRecord),
    ) -> Result<usize, StoreError> {
        let missing: Vec<ExecutionRecord> = {
            let records = self.records.read().unwrap_or_else(|e| e.into_inner());
            plan.test_case_ids
                .iter()
                .enumerate()
                .filter(|(_, case_id)| !records.contains_key(&record_id(&plan.id, case_id)))
                .map(|(position, case_id)| {
                    let mut record = ExecutionRecord::new(&plan.id, case_id, position);
                    init(&mut record);
                    record
                })
                .collect()
        };

        let mut created = Vec::with_capacity(missing.len());
        let mut result = Ok(());
        for record in missing {
            let written =
                put_entity(self.persistence.as_ref(), EntityKind::Record, &record.id, &record);
            if let Err(e) = written {
                result = Err(e);
                break;
            }
            created.push(record);
        }

        // Records already written stay visible even if a later write failed.
        let count = created.len();
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        for record in created {
            records.insert(record.id.clone(), Arc::new(Mutex::new(record)));
        }
        result.map(|()| count)
    }

    /// Queued records in dispatch order.
    pub fn peek_next(&self) -> Vec<Candidate> {
        let plans: HashMap<PlanId, (i32, DateTime<Utc>, u64, ExecutionConfig, bool)> = {
            let plans = self.plans.read().unwrap_or_else(|e| e.into_inner());
            plans
                .iter()
                .map(|(id, p)| {
                    let p = lock(&**p);
                    (
                        id.clone(),
                        (
                            p.priority,
                            p.created_at,
                            p.sequence,
                            p.config.clone(),
                            p.cancel_requested,
                        ),
                    )
                })
                .collect()
        };

        let queued: Vec<ExecutionRecord> = {
            let records = self.records.read().unwrap_or_else(|e| e.into_inner());
            records
                .values()
                .filter_map(|r| {
                    let r = lock(&**r);
                    (r.state == RecordState::Queued).then(|| r.clone())
                })
                .collect()
        };

        let cases = self.cases.read().unwrap_or_else(|e| e.into_inner());
        let mut candidates: Vec<(DateTime<Utc>, u64, Candidate)> = queued
            .into_iter()
            .filter_map(|record| {
                let (priority, created, sequence, config, cancelled) =
                    plans.get(&record.plan_id)?.clone();
                if cancelled {
                    return None;
                }
                let test_case = cases.get(&record.id)?.clone();
                Some((
                    created,
                    sequence,
                    Candidate {
                        record,
                        test_case,
                        priority,
                        config,
                    },
                ))
            })
            .collect();

        candidates.sort_by_key(|(created, sequence, c)| {
            (Reverse(c.priority), *created, *sequence, c.record.position)
        });
        candidates.into_iter().map(|(_, _, c)| c).collect()
    }

    /// Claims a queued record for dispatch onto `environment_id`.
    ///
    /// Returns `Ok(false)` if another caller already claimed it or the
    /// record is no longer queued. Exactly one concurrent caller wins.
    pub fn mark_dispatched(
        &self,
        record_id: &str,
        environment_id: &EnvironmentId,
    ) -> Result<bool, StoreError> {
        let handle = self.record_handle(record_id)?;
        let mut record = lock(&*handle);
        if record.state != RecordState::Queued {
            return Ok(false);
        }
        let mut next = record.clone();
        next.state = RecordState::EnvironmentPending;
        next.environment_id = Some(environment_id.clone());
        put_entity(self.persistence.as_ref(), EntityKind::Record, &next.id, &next)?;
        *record = next;
        debug!(record = %record_id, env = %environment_id, "Record dispatched");
        Ok(true)
    }

    /// Moves a dispatched record to `running`.
    pub fn mark_running(&self, record_id: &str) -> Result<ExecutionRecord, StoreError> {
        self.transition(record_id, RecordState::Running, |r| {
            r.started_at = Some(Utc::now());
        })
    }

    /// Returns a dispatched record to the queue without consuming a retry.
    pub fn revert_dispatch(&self, record_id: &str) -> Result<ExecutionRecord, StoreError> {
        self.transition(record_id, RecordState::Queued, |r| {
            r.environment_id = None;
        })
    }

    /// Writes a terminal outcome.
    pub fn mark_terminal(
        &self,
        record_id: &str,
        update: TerminalUpdate,
    ) -> Result<ExecutionRecord, StoreError> {
        if !update.state.is_terminal() {
            let current = self.get_record(record_id)?;
            return Err(StoreError::InvalidTransition {
                record: record_id.to_string(),
                from: current.state,
                to: update.state,
            });
        }
        let record = self.transition(record_id, update.state, |r| {
            r.finished_at = Some(Utc::now());
            r.exit_code = update.exit_code;
            r.failure = update.failure.clone();
            if let Some(artifacts) = update.artifacts.clone() {
                r.artifacts = artifacts;
            }
        })?;
        info!(
            record = %record.id,
            state = %record.state,
            exit_code = ?record.exit_code,
            failure = ?record.failure.as_ref().map(|f| f.to_string()),
            "Record finished"
        );
        Ok(record)
    }

    /// Re-queues a failed record, consuming one retry.
    pub fn retry(&self, record_id: &str) -> Result<ExecutionRecord, StoreError> {
        let record = self.transition(record_id, RecordState::Queued, |r| {
            r.retry_count += 1;
            r.queued_at = Utc::now();
            r.started_at = None;
            r.finished_at = None;
            r.exit_code = None;
            r.environment_id = None;
        })?;
        info!(record = %record.id, attempt = record.retry_count + 1, "Record re-queued for retry");
        Ok(record)
    }

    fn transition(
        &self,
        record_id: &str,
        to: RecordState,
        apply: impl FnOnce(&mut ExecutionRecord),
    ) -> Result<ExecutionRecord, StoreError> {
        let handle = self.record_handle(record_id)?;
        let mut record = lock(&*handle);
        if !record.state.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                record: record_id.to_string(),
                from: record.state,
                to,
            });
        }
        let mut next = record.clone();
        next.state = to;
        apply(&mut next);
        put_entity(self.persistence.as_ref(), EntityKind::Record, &next.id, &next)?;
        *record = next;
        Ok(record.clone())
    }

    /// Requests cancellation of a plan.
    ///
    /// Queued records are cancelled immediately. A plan that was never
    /// expanded gets one cancelled record per test case. Records holding an
    /// environment stay as they are until the orchestrator has stopped
    /// their runner. Returns the number of records cancelled here.
    pub fn request_cancel(&self, plan_id: &str) -> Result<usize, StoreError> {
        let plan = self.plan_handle(plan_id)?;
        {
            let mut plan = lock(&*plan);
            if plan.status.is_terminal() {
                return Ok(0);
            }
            let mut next = plan.clone();
            next.cancel_requested = true;

            if !next.expanded {
                let now = Utc::now();
                let cancelled = self.create_records(&next, |r| {
                    r.state = RecordState::Cancelled;
                    r.finished_at = Some(now);
                    r.failure = Some(Failure::new(
                        crate::model::FailureKind::Cancelled,
                        "plan cancelled before it started",
                    ));
                })?;
                next.expanded = true;
                next.status = PlanStatus::Cancelled;
                next.finished_at = Some(now);
                put_entity(self.persistence.as_ref(), EntityKind::Plan, &next.id, &next)?;
                *plan = next;
                info!(plan = %plan_id, cancelled, "Plan cancelled before it started");
                return Ok(cancelled);
            }

            put_entity(self.persistence.as_ref(), EntityKind::Plan, &next.id, &next)?;
            *plan = next;
        }

        let mut cancelled = 0;
        for record in self.list(&RecordFilter {
            plan_id: Some(plan_id.to_string()),
            states: Some(vec![RecordState::Queued]),
        }) {
            match self.mark_terminal(&record.id, TerminalUpdate::cancelled("plan cancelled")) {
                Ok(_) => cancelled += 1,
                // Dispatched concurrently; the orchestrator will stop it.
                Err(StoreError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        info!(plan = %plan_id, cancelled, "Plan cancellation requested");
        self.refresh_plan_status(plan_id)?;
        Ok(cancelled)
    }

    /// Recomputes a plan's lifecycle status from its records.
    pub fn refresh_plan_status(&self, plan_id: &str) -> Result<PlanStatus, StoreError> {
        let states: Vec<RecordState> = self
            .list(&RecordFilter::plan(plan_id))
            .into_iter()
            .map(|r| r.state)
            .collect();

        let plan = self.plan_handle(plan_id)?;
        let mut plan = lock(&*plan);
        if plan.status == PlanStatus::Held || !plan.expanded {
            return Ok(plan.status);
        }

        let any_active = states.iter().any(|s| s.is_active());
        let all_terminal = states.iter().all(|s| s.is_terminal());
        let any_failed = states
            .iter()
            .any(|s| matches!(s, RecordState::Failed | RecordState::TimedOut));
        let any_cancelled = states.contains(&RecordState::Cancelled);

        let next = if all_terminal {
            if any_failed {
                PlanStatus::Failed
            } else if any_cancelled || plan.cancel_requested {
                PlanStatus::Cancelled
            } else {
                PlanStatus::Completed
            }
        } else if any_active || plan.status == PlanStatus::Running {
            PlanStatus::Running
        } else {
            PlanStatus::Queued
        };

        if next != plan.status {
            if next == PlanStatus::Running && plan.started_at.is_none() {
                plan.started_at = Some(Utc::now());
            }
            if next.is_terminal() {
                plan.finished_at = Some(Utc::now());
                info!(plan = %plan.id, status = %next, "Plan finished");
            }
            plan.status = next;
            put_entity(self.persistence.as_ref(), EntityKind::Plan, &plan.id, &*plan)?;
        }
        Ok(plan.status)
    }

    /// Plans with an outstanding cancellation request.
    pub fn pending_cancellations(&self) -> Vec<PlanId> {
        let plans = self.plans.read().unwrap_or_else(|e| e.into_inner());
        plans
            .values()
            .filter_map(|p| {
                let p = lock(&**p);
                (p.cancel_requested && !p.status.is_terminal()).then(|| p.id.clone())
            })
            .collect()
    }

    pub fn get_plan(&self, plan_id: &str) -> Result<ExecutionPlan, StoreError> {
        let handle = self.plan_handle(plan_id)?;
        let plan = lock(&*handle).clone();
        Ok(plan)
    }

    pub fn get_record(&self, record_id: &str) -> Result<ExecutionRecord, StoreError> {
        let handle = self.record_handle(record_id)?;
        let record = lock(&*handle).clone();
        Ok(record)
    }

    /// The test case a record runs.
    pub fn test_case(&self, record_id: &str) -> Result<Arc<TestCase>, StoreError> {
        let cases = self.cases.read().unwrap_or_else(|e| e.into_inner());
        cases
            .get(record_id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownRecord(record_id.to_string()))
    }

    /// All plans, oldest first.
    pub fn plans(&self) -> Vec<ExecutionPlan> {
        let plans = self.plans.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<ExecutionPlan> = plans.values().map(|p| lock(&**p).clone()).collect();
        out.sort_by_key(|p| (p.created_at, p.sequence));
        out
    }

    /// Records matching `filter`, ordered by plan then position.
    pub fn list(&self, filter: &RecordFilter) -> Vec<ExecutionRecord> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<ExecutionRecord> = records
            .values()
            .filter_map(|r| {
                let r = lock(&**r);
                filter.accepts(&r).then(|| r.clone())
            })
            .collect();
        out.sort_by(|a, b| a.plan_id.cmp(&b.plan_id).then(a.position.cmp(&b.position)));
        out
    }

    /// Removes terminal records finished before `cutoff`, and plans left
    /// with no records that are themselves terminal.
    pub fn purge_terminal_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<PurgeSummary, StoreError> {
        let mut summary = PurgeSummary::default();

        let stale: Vec<RecordId> = self
            .list(&RecordFilter::default())
            .into_iter()
            .filter(|r| r.state.is_terminal() && r.finished_at.is_some_and(|t| t < cutoff))
            .map(|r| r.id)
            .collect();

        {
            let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
            let mut cases = self.cases.write().unwrap_or_else(|e| e.into_inner());
            for rid in &stale {
                self.persistence.delete(EntityKind::Record, rid)?;
                self.persistence.delete(EntityKind::TestCase, rid)?;
                records.remove(rid);
                cases.remove(rid);
                summary.records += 1;
            }
        }

        let live_plans: HashSet<PlanId> = self
            .list(&RecordFilter::default())
            .into_iter()
            .map(|r| r.plan_id)
            .collect();

        let mut plans = self.plans.write().unwrap_or_else(|e| e.into_inner());
        let doomed: Vec<PlanId> = plans
            .values()
            .filter_map(|p| {
                let p = lock(&**p);
                let old = p.finished_at.is_some_and(|t| t < cutoff);
                (p.status.is_terminal() && old && !live_plans.contains(&p.id))
                    .then(|| p.id.clone())
            })
            .collect();
        for plan_id in doomed {
            self.persistence.delete(EntityKind::Plan, &plan_id)?;
            plans.remove(&plan_id);
            summary.plans += 1;
        }

        if summary.records > 0 || summary.plans > 0 {
            info!(
                records = summary.records,
                plans = summary.plans,
                "Purged stale executions"
            );
        }
        Ok(summary)
    }

    fn plan_handle(&self, plan_id: &str) -> Result<Shared<ExecutionPlan>, StoreError> {
        let plans = self.plans.read().unwrap_or_else(|e| e.into_inner());
        plans
            .get(plan_id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownPlan(plan_id.to_string()))
    }

    fn record_handle(&self, record_id: &str) -> Result<Shared<ExecutionRecord>, StoreError> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records
            .get(record_id)
            .cloned()
            .ok_or_else(|| StoreError::UnknownRecord(record_id.to_string()))
    }
}

fn check_id(what: &str, id: &str) -> Result<(), StoreError> {
    if id.trim().is_empty() {
        return Err(StoreError::InvalidPlan(format!("{} is empty", what)));
    }
    if id.contains('/') {
        return Err(StoreError::InvalidPlan(format!(
            "{} '{}' must not contain '/'",
            what, id
        )));
    }
    Ok(())
}

/// Persisted form of a test case, keyed by the record that runs it.
#[derive(serde::Serialize, serde::Deserialize)]
struct StoredCase {
    record_id: RecordId,
    test_case: TestCase,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::persist::MemoryPersistence;
    use super::*;
    use crate::hardware::{Architecture, HardwareProfile};
    use crate::model::{FailureKind, TestType};

    pub(crate) fn case(id: &str, script: &str) -> TestCase {
        TestCase {
            id: id.to_string(),
            name: id.to_string(),
            test_type: TestType::Integration,
            target_subsystem: "drivers/gpio".to_string(),
            script: script.to_string(),
            hardware: HardwareProfile::new(Architecture::Aarch64, 512),
            estimated_duration_secs: None,
            metadata: Default::default(),
        }
    }

    fn store() -> (PlanStore, MemoryPersistence) {
        let persistence = MemoryPersistence::new();
        let store = PlanStore::open(Arc::new(persistence.clone())).unwrap();
        (store, persistence)
    }

    #[test]
    fn test_submit_rejects_duplicates() {
        let (store, _) = store();
        store
            .submit(PlanSubmission::new("p", vec![case("a", "")], 1))
            .unwrap();
        assert!(matches!(
            store.submit(PlanSubmission::new("p", vec![], 1)),
            Err(StoreError::DuplicatePlan(_))
        ));
        assert!(matches!(
            store.submit(PlanSubmission::new(
                "q",
                vec![case("a", ""), case("a", "")],
                1
            )),
            Err(StoreError::DuplicateTestCase { .. })
        ));
        let forever = ExecutionConfig {
            timeout_minutes: 0,
            ..Default::default()
        };
        assert!(matches!(
            store.submit(PlanSubmission::new("r", vec![case("a", "")], 1).with_config(forever)),
            Err(StoreError::InvalidPlan(_))
        ));
    }

    #[test]
    fn test_peek_next_orders_by_priority_then_fifo() {
        let (store, _) = store();
        store
            .submit(PlanSubmission::new("low", vec![case("a", ""), case("b", "")], 3))
            .unwrap();
        store
            .submit(PlanSubmission::new("high", vec![case("a", "")], 8))
            .unwrap();
        store
            .submit(PlanSubmission::new("low2", vec![case("a", "")], 3))
            .unwrap();
        for plan in store.unexpanded_plans() {
            store.expand(&plan).unwrap();
        }

        let order: Vec<String> = store.peek_next().into_iter().map(|c| c.record.id).collect();
        assert_eq!(order, vec!["high/a", "low/a", "low/b", "low2/a"]);
    }

    #[test]
    fn test_order_survives_reopen() {
        let (store, persistence) = store();
        store
            .submit(PlanSubmission::new("first", vec![case("a", "")], 1))
            .unwrap();
        store
            .submit(PlanSubmission::new("second", vec![case("a", "")], 1))
            .unwrap();
        for plan in store.unexpanded_plans() {
            store.expand(&plan).unwrap();
        }
        let before: Vec<String> = store.peek_next().into_iter().map(|c| c.record.id).collect();
        drop(store);

        let reopened = PlanStore::open(Arc::new(persistence)).unwrap();
        let after: Vec<String> = reopened
            .peek_next()
            .into_iter()
            .map(|c| c.record.id)
            .collect();
        assert_eq!(before, after);
        let third = reopened
            .submit(PlanSubmission::new("third", vec![], 1))
            .unwrap();
        assert_eq!(third.sequence, 2);
    }

    #[test]
    fn test_mark_dispatched_has_one_winner() {
        let (store, _) = store();
        store
            .submit(PlanSubmission::new("p", vec![case("a", "")], 1))
            .unwrap();
        store.expand("p").unwrap();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || store.mark_dispatched("p/a", &format!("env-{}", i)))
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(
            store.get_record("p/a").unwrap().state,
            RecordState::EnvironmentPending
        );
    }

    #[test]
    fn test_retry_is_the_only_backward_edge() {
        let (store, _) = store();
        store
            .submit(PlanSubmission::new("p", vec![case("a", "")], 1))
            .unwrap();
        store.expand("p").unwrap();
        store.mark_dispatched("p/a", &"env".to_string()).unwrap();
        store.mark_running("p/a").unwrap();
        store
            .mark_terminal(
                "p/a",
                TerminalUpdate::failed(Failure::new(FailureKind::ExecutionFailure, "exit 1")),
            )
            .unwrap();

        let retried = store.retry("p/a").unwrap();
        assert_eq!(retried.state, RecordState::Queued);
        assert_eq!(retried.retry_count, 1);
        assert!(retried.environment_id.is_none());

        assert!(matches!(
            store.mark_running("p/a"),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_cancel_held_plan() {
        let (store, persistence) = store();
        store
            .submit(PlanSubmission::new("p", vec![case("a", ""), case("b", "")], 1).held())
            .unwrap();
        assert!(store.unexpanded_plans().is_empty());
        assert_eq!(store.request_cancel("p").unwrap(), 2);
        assert_eq!(store.get_plan("p").unwrap().status, PlanStatus::Cancelled);
        assert!(matches!(
            store.start("p"),
            Err(StoreError::InvalidPlanState { .. })
        ));

        // Every test case still ends in exactly one terminal record.
        let records = store.list(&RecordFilter::plan("p"));
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| r.state == RecordState::Cancelled));
        assert_eq!(persistence.count(EntityKind::Record), 2);

        let report = crate::status::plan_report(&store.get_plan("p").unwrap(), &records);
        assert_eq!(report.queued_tests, 0);
        assert_eq!(report.cancelled_tests, 2);
        assert_eq!(report.total_tests, 2);
    }

    #[test]
    fn test_cancel_before_expansion_is_not_undone_by_expand() {
        let (store, _) = store();
        store
            .submit(PlanSubmission::new("p", vec![case("a", "")], 1))
            .unwrap();
        store.request_cancel("p").unwrap();

        assert!(store.unexpanded_plans().is_empty());
        assert_eq!(store.expand("p").unwrap(), 0);
        assert!(store.peek_next().is_empty());
        assert_eq!(store.get_record("p/a").unwrap().state, RecordState::Cancelled);
        assert_eq!(store.refresh_plan_status("p").unwrap(), PlanStatus::Cancelled);
    }

    #[test]
    fn test_ids_with_separator_are_rejected() {
        let (store, _) = store();
        assert!(matches!(
            store.submit(PlanSubmission::new("a/b", vec![case("c", "")], 1)),
            Err(StoreError::InvalidPlan(_))
        ));
        assert!(matches!(
            store.submit(PlanSubmission::new("a", vec![case("b/c", "")], 1)),
            Err(StoreError::InvalidPlan(_))
        ));
        assert!(matches!(
            store.submit(PlanSubmission::new("a", vec![case(" ", "")], 1)),
            Err(StoreError::InvalidPlan(_))
        ));

        // Nothing was half-submitted.
        store
            .submit(PlanSubmission::new("a", vec![case("b", "")], 1))
            .unwrap();
        store.expand("a").unwrap();
        assert_eq!(store.list(&RecordFilter::plan("a")).len(), 1);
    }

    #[test]
    fn test_concurrent_submit_of_one_id_has_one_winner() {
        let (store, persistence) = store();
        let store = Arc::new(store);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store.submit(PlanSubmission::new(
                        "p",
                        vec![case(&format!("t{}", i), "")],
                        1,
                    ))
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winners: Vec<&ExecutionPlan> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1);
        assert!(
            results
                .iter()
                .filter(|r| r.is_err())
                .all(|r| matches!(r, Err(StoreError::DuplicatePlan(_))))
        );
        assert_eq!(store.get_plan("p").unwrap().test_case_ids, winners[0].test_case_ids);
        assert_eq!(persistence.count(EntityKind::Plan), 1);
    }

    #[test]
    fn test_cancel_leaves_active_records_to_orchestrator() {
        let (store, _) = store();
        store
            .submit(PlanSubmission::new("p", vec![case("a", ""), case("b", "")], 1))
            .unwrap();
        store.expand("p").unwrap();
        store.mark_dispatched("p/a", &"env".to_string()).unwrap();
        store.mark_running("p/a").unwrap();

        assert_eq!(store.request_cancel("p").unwrap(), 1);
        assert_eq!(store.get_record("p/a").unwrap().state, RecordState::Running);
        assert_eq!(store.get_record("p/b").unwrap().state, RecordState::Cancelled);
        assert_eq!(store.pending_cancellations(), vec!["p".to_string()]);
        assert!(store.peek_next().is_empty());
    }

    #[test]
    fn test_plan_status_follows_records() {
        let (store, _) = store();
        store
            .submit(PlanSubmission::new("p", vec![case("a", ""), case("b", "")], 1))
            .unwrap();
        store.expand("p").unwrap();
        store.mark_dispatched("p/a", &"env".to_string()).unwrap();
        store.mark_running("p/a").unwrap();
        assert_eq!(store.refresh_plan_status("p").unwrap(), PlanStatus::Running);

        store
            .mark_terminal("p/a", TerminalUpdate::completed(0, Artifacts::default()))
            .unwrap();
        assert_eq!(store.refresh_plan_status("p").unwrap(), PlanStatus::Running);

        store.mark_dispatched("p/b", &"env".to_string()).unwrap();
        store.mark_running("p/b").unwrap();
        store
            .mark_terminal("p/b", TerminalUpdate::completed(0, Artifacts::default()))
            .unwrap();
        assert_eq!(store.refresh_plan_status("p").unwrap(), PlanStatus::Completed);
        assert!(store.get_plan("p").unwrap().finished_at.is_some());
    }

    #[test]
    fn test_purge_removes_old_terminal_records() {
        let (store, persistence) = store();
        store
            .submit(PlanSubmission::new("p", vec![case("a", "")], 1))
            .unwrap();
        store.expand("p").unwrap();
        store.request_cancel("p").unwrap();

        let none = store
            .purge_terminal_older_than(Utc::now() - chrono::Duration::hours(1))
            .unwrap();
        assert_eq!(none, PurgeSummary::default());

        let summary = store
            .purge_terminal_older_than(Utc::now() + chrono::Duration::seconds(1))
            .unwrap();
        assert_eq!(summary, PurgeSummary { records: 1, plans: 1 });
        assert_eq!(persistence.count(EntityKind::Record), 0);
        assert_eq!(persistence.count(EntityKind::Plan), 0);
    }

    #[test]
    fn test_empty_plan_completes_on_expand() {
        let (store, _) = store();
        store.submit(PlanSubmission::new("p", vec![], 1)).unwrap();
        store.expand("p").unwrap();
        assert_eq!(store.get_plan("p").unwrap().status, PlanStatus::Completed);
    }
}
