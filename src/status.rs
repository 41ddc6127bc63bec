//! Read-only projections of dispatcher state.
//!
//! Everything here is computed from the [`PlanStore`] on demand. Records
//! only move forward, and a plan that has started never reports `queued`
//! again, so two successive reads never show a regression.

use std::fmt;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::model::{ExecutionPlan, ExecutionRecord, PlanStatus, RecordState};
use crate::store::{PlanStore, RecordFilter, StoreError};

/// Lifecycle of the orchestrator loop itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorStatus {
    Stopped,
    Starting,
    Running,
    /// The last cycle failed; the loop is backing off.
    Degraded,
    ShuttingDown,
}

impl fmt::Display for OrchestratorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OrchestratorStatus::Stopped => "stopped",
            OrchestratorStatus::Starting => "starting",
            OrchestratorStatus::Running => "running",
            OrchestratorStatus::Degraded => "degraded",
            OrchestratorStatus::ShuttingDown => "shutting_down",
        };
        f.write_str(s)
    }
}

/// Shared cell holding the loop's [`OrchestratorStatus`].
#[derive(Debug, Clone)]
pub struct StatusCell(Arc<RwLock<OrchestratorStatus>>);

impl Default for StatusCell {
    fn default() -> Self {
        Self(Arc::new(RwLock::new(OrchestratorStatus::Stopped)))
    }
}

impl StatusCell {
    pub fn get(&self) -> OrchestratorStatus {
        *self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, status: OrchestratorStatus) {
        *self.0.write().unwrap_or_else(|e| e.into_inner()) = status;
    }
}

/// Progress of one plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanStatusReport {
    pub plan_id: String,
    pub test_plan_name: Option<String>,
    pub overall_status: PlanStatus,
    /// `completed_tests / total_tests`, 0 for an empty plan.
    pub progress: f64,
    pub total_tests: usize,
    pub completed_tests: usize,
    /// Failed and timed out.
    pub failed_tests: usize,
    pub cancelled_tests: usize,
    pub running_tests: usize,
    pub queued_tests: usize,
    pub created_by: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A plan that has not reached a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveExecution {
    pub plan_id: String,
    pub test_plan_name: Option<String>,
    pub overall_status: PlanStatus,
    pub total_tests: usize,
    pub completed_tests: usize,
    pub failed_tests: usize,
    pub created_by: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metrics {
    pub orchestrator_status: OrchestratorStatus,
    /// Records holding an environment.
    pub active_tests: usize,
    pub queued_tests: usize,
    /// Ready environments not reserved for a record.
    pub available_environments: usize,
}

/// Derives a plan's overall status from its records.
///
/// `running` if any record holds an environment, `failed` if all records
/// are terminal and any failed or timed out, `cancelled` if all are terminal
/// and any was cancelled, `completed` if all completed. A plan with queued
/// records reports `running` once it has started, `queued` before.
pub fn overall_status(plan: &ExecutionPlan, records: &[ExecutionRecord]) -> PlanStatus {
    if plan.status == PlanStatus::Held || !plan.expanded {
        return plan.status;
    }
    if records.iter().any(|r| r.state.is_active()) {
        return PlanStatus::Running;
    }
    if records.iter().all(|r| r.state.is_terminal()) {
        if records
            .iter()
            .any(|r| matches!(r.state, RecordState::Failed | RecordState::TimedOut))
        {
            return PlanStatus::Failed;
        }
        if plan.cancel_requested || records.iter().any(|r| r.state == RecordState::Cancelled) {
            return PlanStatus::Cancelled;
        }
        return PlanStatus::Completed;
    }
    if plan.started_at.is_some() || plan.status == PlanStatus::Running {
        PlanStatus::Running
    } else {
        PlanStatus::Queued
    }
}

fn count(records: &[ExecutionRecord], pred: impl Fn(RecordState) -> bool) -> usize {
    records.iter().filter(|r| pred(r.state)).count()
}

pub fn plan_report(plan: &ExecutionPlan, records: &[ExecutionRecord]) -> PlanStatusReport {
    // Before expansion the plan's test cases are the records-to-be.
    let total = if plan.expanded {
        records.len()
    } else {
        plan.test_case_ids.len()
    };
    let completed = count(records, |s| s == RecordState::Completed);
    PlanStatusReport {
        plan_id: plan.id.clone(),
        test_plan_name: plan.test_plan_name.clone(),
        overall_status: overall_status(plan, records),
        progress: if total == 0 {
            0.0
        } else {
            completed as f64 / total as f64
        },
        total_tests: total,
        completed_tests: completed,
        failed_tests: count(records, |s| {
            matches!(s, RecordState::Failed | RecordState::TimedOut)
        }),
        cancelled_tests: count(records, |s| s == RecordState::Cancelled),
        running_tests: count(records, |s| s.is_active()),
        queued_tests: if plan.expanded {
            count(records, |s| s == RecordState::Queued)
        } else {
            total
        },
        created_by: plan.created_by.clone(),
        started_at: plan.started_at,
        finished_at: plan.finished_at,
    }
}

/// `getExecutionStatus` for one plan.
pub fn execution_status(store: &PlanStore, plan_id: &str) -> Result<PlanStatusReport, StoreError> {
    let plan = store.get_plan(plan_id)?;
    let records = store.list(&RecordFilter::plan(plan_id));
    Ok(plan_report(&plan, &records))
}

/// Every plan, oldest first.
pub fn all_executions(store: &PlanStore) -> Vec<PlanStatusReport> {
    store
        .plans()
        .iter()
        .map(|plan| plan_report(plan, &store.list(&RecordFilter::plan(&plan.id))))
        .collect()
}

/// Plans that are not yet terminal, oldest first.
pub fn active_executions(store: &PlanStore) -> Vec<ActiveExecution> {
    all_executions(store)
        .into_iter()
        .filter(|r| !r.overall_status.is_terminal())
        .map(|r| ActiveExecution {
            plan_id: r.plan_id,
            test_plan_name: r.test_plan_name,
            overall_status: r.overall_status,
            total_tests: r.total_tests,
            completed_tests: r.completed_tests,
            failed_tests: r.failed_tests,
            created_by: r.created_by,
            started_at: r.started_at,
        })
        .collect()
}

pub fn metrics(
    store: &PlanStore,
    orchestrator_status: OrchestratorStatus,
    available_environments: usize,
) -> Metrics {
    let records = store.list(&RecordFilter::default());
    Metrics {
        orchestrator_status,
        active_tests: count(&records, |s| s.is_active()),
        queued_tests: count(&records, |s| s == RecordState::Queued),
        available_environments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Artifacts, Failure, FailureKind};
    use crate::store::persist::MemoryPersistence;
    use crate::store::tests::case;
    use crate::store::{PlanSubmission, TerminalUpdate};

    fn store() -> PlanStore {
        PlanStore::open(Arc::new(MemoryPersistence::new())).unwrap()
    }

    #[test]
    fn test_report_counts_and_progress() {
        let store = store();
        store
            .submit(
                PlanSubmission::new(
                    "p",
                    vec![case("a", ""), case("b", ""), case("c", ""), case("d", "")],
                    1,
                )
                .with_name("gpio"),
            )
            .unwrap();

        let report = execution_status(&store, "p").unwrap();
        assert_eq!(report.overall_status, PlanStatus::Queued);
        assert_eq!(report.total_tests, 4);
        assert_eq!(report.queued_tests, 4);

        store.expand("p").unwrap();
        for (rid, env) in [("p/a", "env-1"), ("p/b", "env-2")] {
            assert!(store.mark_dispatched(rid, &env.to_string()).unwrap());
            store.mark_running(rid).unwrap();
        }
        store.refresh_plan_status("p").unwrap();
        store
            .mark_terminal("p/a", TerminalUpdate::completed(0, Artifacts::default()))
            .unwrap();
        store
            .mark_terminal(
                "p/b",
                TerminalUpdate::failed(Failure::new(FailureKind::ExecutionFailure, "exit 1")),
            )
            .unwrap();
        store.refresh_plan_status("p").unwrap();

        let report = execution_status(&store, "p").unwrap();
        assert_eq!(report.overall_status, PlanStatus::Running);
        assert_eq!(report.completed_tests, 1);
        assert_eq!(report.failed_tests, 1);
        assert_eq!(report.queued_tests, 2);
        assert!((report.progress - 0.25).abs() < f64::EPSILON);
        assert_eq!(report.test_plan_name.as_deref(), Some("gpio"));

        let metrics = metrics(&store, OrchestratorStatus::Running, 3);
        assert_eq!(metrics.queued_tests, 2);
        assert_eq!(metrics.active_tests, 0);
        assert_eq!(metrics.available_environments, 3);
        assert_eq!(active_executions(&store).len(), 1);
    }

    #[test]
    fn test_cancelled_plan_is_not_active() {
        let store = store();
        store
            .submit(PlanSubmission::new("p", vec![case("a", ""), case("b", "")], 1))
            .unwrap();
        store.expand("p").unwrap();
        store.request_cancel("p").unwrap();

        let report = execution_status(&store, "p").unwrap();
        assert_eq!(report.overall_status, PlanStatus::Cancelled);
        assert!(active_executions(&store).is_empty());
    }

    #[test]
    fn test_status_cell() {
        let cell = StatusCell::default();
        assert_eq!(cell.get(), OrchestratorStatus::Stopped);
        cell.clone().set(OrchestratorStatus::Degraded);
        assert_eq!(cell.get(), OrchestratorStatus::Degraded);
    }
}
