//! Dispatch loop: plans in, runners out, results back.
//!
//! The [`Orchestrator`] owns a single decision loop. Each cycle it expands
//! new plans into records, settles finished runners, applies cancellations
//! and deadlines, reacts to health probes, and finally walks the queue in
//! priority order handing records to the [`EnvironmentPool`]. Scripts run
//! on spawned tasks, one per running record; provisioning, probes and
//! teardown also run off the loop, so a cycle never waits on a backend.
//!
//! # Architecture
//!
//! ```text
//!   OrchestratorHandle ── submit / start / cancel / force_poll ──┐
//!                                                               ▼
//!   PlanStore ◄──────── peek_next / mark_* ────────────── Orchestrator loop
//!                                                          │        ▲
//!                                acquire / release / probe │        │ outcome
//!                                                          ▼        │
//!                                                   EnvironmentPool │
//!                                                          │ lease  │
//!                                                          ▼        │
//!                                                   ExecutionRunner ┘
//! ```
//!
//! # Cycle
//!
//! 1. **Recovery** (first cycle only): records left `running` by a previous
//!    process are failed, its environments reclaimed, prewarm started
//! 2. **Expansion**: new plans become `queued` records
//! 3. **Settlement**: finished runners release their environment and write
//!    their terminal state; retryable failures are re-queued once
//! 4. **Cancellation**: runners of cancelled plans are asked to stop and
//!    forcibly reclaimed after the grace period
//! 5. **Deadlines**: runners past `timeout + grace` are aborted
//! 6. **Health**: stale environments are probed; an unhealthy busy
//!    environment fails its record and is torn down
//! 7. **Dispatch**: queued records, highest priority first, are matched to
//!    environments up to `dispatch.max_concurrent`
//!
//! A cycle that fails (for example because persistence is unreachable) is
//! retried with exponential backoff; the loop itself never exits on error.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kdispatch::config::load_config;
//! use kdispatch::orchestrator::Orchestrator;
//! use kdispatch::provider::local::LocalProvider;
//! use kdispatch::store::PlanSubmission;
//! use kdispatch::store::persist::MemoryPersistence;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("kdispatch.toml"))?;
//!     let provider = LocalProvider::new(Default::default());
//!     let orchestrator =
//!         Orchestrator::new(&config, provider, Arc::new(MemoryPersistence::new()))?;
//!     let handle = orchestrator.handle();
//!     let task = tokio::spawn(orchestrator.run());
//!
//!     handle.submit_plan(PlanSubmission::new("nightly", vec![], 5))?;
//!     handle.shutdown();
//!     task.await?;
//!     Ok(())
//! }
//! ```

pub mod pool;
pub mod retry;
pub mod runner;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, DispatchConfig};
use crate::model::{
    EnvironmentId, EnvironmentRecord, EnvironmentState, ExecutionConfig, ExecutionPlan,
    ExecutionRecord, Failure, FailureKind, Health, PlanId, RecordId, RecordState, TestCase,
};
use crate::provider::SandboxProvider;
use crate::status::{
    self, ActiveExecution, Metrics, OrchestratorStatus, PlanStatusReport, StatusCell,
};
use crate::store::persist::Persistence;
use crate::store::{PlanStore, PlanSubmission, PurgeSummary, RecordFilter, StoreError, TerminalUpdate};

pub use pool::{Acquire, EnvironmentPool, Lease, PoolError, PoolEvent, ReleaseOutcome};
pub use retry::{CycleBackoff, RetryPolicy};
pub use runner::{ExecutionOutcome, ExecutionRunner, OutputCallback};

/// A failure of the loop's own bookkeeping.
#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Why a runner was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Cancelled,
    Shutdown,
}

impl Stop {
    fn reason(self) -> &'static str {
        match self {
            Stop::Cancelled => "plan cancelled",
            Stop::Shutdown => "dispatcher shut down",
        }
    }
}

/// A running record and the task executing it.
struct InFlight {
    plan_id: PlanId,
    env_id: EnvironmentId,
    handle: JoinHandle<()>,
    cancel: CancellationToken,
    timeout: Duration,
    /// Orchestrator-level deadline: plan timeout plus grace.
    deadline: Instant,
    stop: Option<(Stop, Instant)>,
}

/// A terminal result waiting to be written.
///
/// Kept until both the pool and the store accepted it, so a failed cycle
/// retries it instead of losing it.
struct Settlement {
    record_id: RecordId,
    env_id: EnvironmentId,
    update: TerminalUpdate,
    release: ReleaseOutcome,
}

type Completion = (RecordId, ExecutionOutcome);

/// The scheduler proper.
///
/// Build it with [`new`](Self::new), take a [`handle`](Self::handle), then
/// drive it with [`run`](Self::run) (or [`run_cycle`](Self::run_cycle)
/// step by step).
pub struct Orchestrator<P: SandboxProvider> {
    config: DispatchConfig,
    /// The smaller of the concurrency and pool ceilings.
    parallelism: usize,
    store: Arc<PlanStore>,
    pool: EnvironmentPool<P>,
    runner: Arc<ExecutionRunner>,
    retry: RetryPolicy,
    backoff: CycleBackoff,
    status: StatusCell,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    in_flight: HashMap<RecordId, InFlight>,
    settlements: VecDeque<Settlement>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions: mpsc::UnboundedReceiver<Completion>,
    probes: HashMap<EnvironmentId, JoinHandle<Health>>,
    last_health_sweep: Option<Instant>,
    recovered: bool,
}

impl<P: SandboxProvider> Orchestrator<P> {
    /// Opens the store on `persistence` and builds the pool over `provider`.
    pub fn new(
        config: &Config,
        provider: P,
        persistence: Arc<dyn Persistence>,
    ) -> Result<Self, StoreError> {
        let store = Arc::new(PlanStore::open(persistence.clone())?);
        let pool = EnvironmentPool::new(
            provider,
            config.pool.clone(),
            persistence,
            Duration::from_secs(config.dispatch.probe_timeout_secs),
        );
        let wake = pool.notifier();
        let (completions_tx, completions) = mpsc::unbounded_channel();

        Ok(Self {
            backoff: CycleBackoff::new(
                Duration::from_millis(config.dispatch.poll_interval_ms),
                Duration::from_secs(config.dispatch.backoff_max_secs),
            ),
            config: config.dispatch.clone(),
            parallelism: config.effective_parallelism(),
            store,
            pool,
            runner: Arc::new(ExecutionRunner::new(config.runner.clone())),
            retry: RetryPolicy::default(),
            status: StatusCell::default(),
            wake,
            shutdown: CancellationToken::new(),
            in_flight: HashMap::new(),
            settlements: VecDeque::new(),
            completions_tx,
            completions,
            probes: HashMap::new(),
            last_health_sweep: None,
            recovered: false,
        })
    }

    /// Streams script output of every runner to `callback`.
    pub fn with_output_callback(mut self, callback: OutputCallback) -> Self {
        self.runner = Arc::new((*self.runner).clone().with_output_callback(callback));
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn handle(&self) -> OrchestratorHandle<P> {
        OrchestratorHandle {
            store: self.store.clone(),
            pool: self.pool.clone(),
            wake: self.wake.clone(),
            shutdown: self.shutdown.clone(),
            status: self.status.clone(),
        }
    }

    /// Runs cycles until [`OrchestratorHandle::shutdown`] is called, then
    /// stops all runners and tears every environment down.
    pub async fn run(mut self) {
        self.status.set(OrchestratorStatus::Starting);
        info!(
            parallelism = self.parallelism,
            max_environments = self.pool.capacity(),
            "Orchestrator started"
        );

        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            match self.run_cycle().await {
                Ok(()) => {
                    if self.backoff.consecutive_failures() > 0 {
                        info!("Dispatch cycle recovered");
                    }
                    self.backoff.reset();
                    self.status.set(OrchestratorStatus::Running);
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    error!(
                        failures = self.backoff.consecutive_failures(),
                        "Dispatch cycle failed: {}; retrying in {:?}", e, delay
                    );
                    self.status.set(OrchestratorStatus::Degraded);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.wake.notified() => {}
            }
        }

        self.status.set(OrchestratorStatus::ShuttingDown);
        self.drain().await;
        self.status.set(OrchestratorStatus::Stopped);
        info!("Orchestrator stopped");
    }

    /// Runs one decision cycle.
    pub async fn run_cycle(&mut self) -> Result<(), CycleError> {
        if !self.recovered {
            self.recover().await?;
            self.recovered = true;
        }

        self.expand_plans()?;
        self.collect_completions();
        self.handle_pool_events()?;
        self.apply_cancellations()?;
        self.enforce_deadlines();
        self.collect_probes().await;
        self.apply_settlements()?;
        self.schedule_probes();

        let store = self.store.clone();
        self.pool
            .retain_reservations(|rid| store.get_record(rid).is_ok_and(|r| r.state == RecordState::Queued));

        self.requeue_stranded()?;
        self.dispatch()?;
        Ok(())
    }

    /// Reconciles state persisted by a previous process.
    ///
    /// Nothing in this process runs those records, so each becomes
    /// `timed_out` if its timeout already elapsed and `failed` otherwise.
    async fn recover(&mut self) -> Result<(), CycleError> {
        let orphaned = self.store.list(&RecordFilter::states(&[
            RecordState::EnvironmentPending,
            RecordState::Running,
        ]));
        let mut plans = HashSet::new();

        for record in orphaned {
            if self.in_flight.contains_key(&record.id) {
                continue;
            }
            let plan = self.store.get_plan(&record.plan_id)?;
            let overdue = record.state == RecordState::Running
                && record
                    .started_at
                    .and_then(|started| (Utc::now() - started).to_std().ok())
                    .is_some_and(|elapsed| elapsed >= plan.config.timeout());

            let update = if overdue {
                TerminalUpdate::timed_out(Failure::new(
                    FailureKind::TimeoutExceeded,
                    "timeout elapsed while the dispatcher was down",
                ))
            } else {
                TerminalUpdate::failed(Failure::new(
                    FailureKind::OrchestratorRestart,
                    "no live runner after dispatcher restart",
                ))
            };
            warn!(record = %record.id, state = %record.state, "Reconciling orphaned record");
            self.store.mark_terminal(&record.id, update)?;
            plans.insert(record.plan_id);
        }

        for plan_id in plans {
            self.store.refresh_plan_status(&plan_id)?;
        }

        self.pool.recover().await?;
        self.pool.prewarm()?;
        Ok(())
    }

    fn expand_plans(&mut self) -> Result<(), CycleError> {
        for plan_id in self.store.unexpanded_plans() {
            let created = self.store.expand(&plan_id)?;
            info!(plan = %plan_id, records = created, "Plan accepted");
        }
        Ok(())
    }

    /// Turns finished runner tasks into settlements.
    fn collect_completions(&mut self) {
        // Tasks report before they finish, so anything finished now has
        // either reported already or panicked.
        let finished: Vec<RecordId> = self
            .in_flight
            .iter()
            .filter(|(_, f)| f.handle.is_finished())
            .map(|(rid, _)| rid.clone())
            .collect();

        while let Ok((rid, outcome)) = self.completions.try_recv() {
            if let Some(flight) = self.in_flight.remove(&rid) {
                debug!(record = %rid, "Runner {}", outcome.summary());
                let settlement = settle_outcome(&rid, &flight, outcome);
                self.settlements.push_back(settlement);
            }
        }

        for rid in finished {
            if let Some(flight) = self.in_flight.remove(&rid) {
                error!(record = %rid, "Runner task ended without an outcome");
                let settlement = settle_outcome(
                    &rid,
                    &flight,
                    ExecutionOutcome::Failed {
                        reason: "runner task panicked".to_string(),
                        artifacts: Default::default(),
                    },
                );
                self.settlements.push_back(settlement);
            }
        }
    }

    fn apply_settlements(&mut self) -> Result<(), CycleError> {
        while let Some(settlement) = self.settlements.pop_front() {
            if let Err(e) = self.settle(&settlement) {
                self.settlements.push_front(settlement);
                return Err(e);
            }
        }
        Ok(())
    }

    fn settle(&self, s: &Settlement) -> Result<(), CycleError> {
        self.pool.release(&s.env_id, s.release)?;

        let record = match self.store.mark_terminal(&s.record_id, s.update.clone()) {
            Ok(record) => record,
            // Written by an earlier attempt of this settlement.
            Err(StoreError::InvalidTransition { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        if record.state == RecordState::Failed
            && let Some(failure) = &record.failure
        {
            let plan = self.store.get_plan(&record.plan_id)?;
            if self
                .retry
                .should_retry(&plan.config, &record, failure, plan.cancel_requested)
            {
                self.store.retry(&record.id)?;
            }
        }

        self.store.refresh_plan_status(&record.plan_id)?;
        Ok(())
    }

    fn handle_pool_events(&mut self) -> Result<(), CycleError> {
        for event in self.pool.drain_events() {
            match event {
                PoolEvent::ProvisionFailed {
                    record_id: Some(rid),
                    reason,
                    ..
                } => {
                    let Ok(record) = self.store.get_record(&rid) else {
                        continue;
                    };
                    if record.state != RecordState::Queued {
                        continue;
                    }
                    self.store.mark_terminal(
                        &rid,
                        TerminalUpdate::failed(Failure::new(
                            FailureKind::ProvisioningFailure,
                            reason,
                        )),
                    )?;
                    self.store.refresh_plan_status(&record.plan_id)?;
                }
                PoolEvent::ProvisionFailed { record_id: None, .. } => {}
            }
        }
        Ok(())
    }

    fn apply_cancellations(&mut self) -> Result<(), CycleError> {
        let plans: HashSet<PlanId> = self.store.pending_cancellations().into_iter().collect();
        if plans.is_empty() {
            return Ok(());
        }

        let now = Instant::now();
        for (rid, flight) in self.in_flight.iter_mut() {
            if plans.contains(&flight.plan_id) && flight.stop.is_none() {
                info!(record = %rid, "Stopping runner of cancelled plan");
                flight.cancel.cancel();
                flight.stop = Some((Stop::Cancelled, now));
            }
        }

        for plan_id in &plans {
            // Retries re-queued after the cancellation request.
            for record in self
                .store
                .list(&RecordFilter::plan(plan_id.as_str()).with_states(&[RecordState::Queued]))
            {
                match self
                    .store
                    .mark_terminal(&record.id, TerminalUpdate::cancelled(Stop::Cancelled.reason()))
                {
                    Ok(_) | Err(StoreError::InvalidTransition { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            self.store.refresh_plan_status(plan_id)?;
        }
        Ok(())
    }

    /// Aborts runners past their deadline or past the grace period after a
    /// stop request. Their environments are torn down.
    fn enforce_deadlines(&mut self) {
        let now = Instant::now();
        let grace = Duration::from_secs(self.config.cancel_grace_secs);

        let overdue: Vec<RecordId> = self
            .in_flight
            .iter()
            .filter(|(_, f)| {
                now >= f.deadline || f.stop.is_some_and(|(_, at)| now >= at + grace)
            })
            .map(|(rid, _)| rid.clone())
            .collect();

        for rid in overdue {
            let Some(flight) = self.in_flight.remove(&rid) else {
                continue;
            };
            flight.cancel.cancel();
            flight.handle.abort();

            let update = match flight.stop {
                Some((stop, _)) => {
                    warn!(record = %rid, "Runner ignored stop request; reclaiming environment");
                    TerminalUpdate::cancelled(format!(
                        "{}; runner did not stop within {}s",
                        stop.reason(),
                        grace.as_secs()
                    ))
                }
                None => {
                    warn!(record = %rid, "Runner exceeded its deadline; reclaiming environment");
                    TerminalUpdate::timed_out(Failure::new(
                        FailureKind::TimeoutExceeded,
                        format!(
                            "exceeded the {}s timeout and did not stop within {}s",
                            flight.timeout.as_secs(),
                            grace.as_secs()
                        ),
                    ))
                }
            };
            self.settlements.push_back(Settlement {
                record_id: rid,
                env_id: flight.env_id,
                update,
                release: ReleaseOutcome::Unhealthy,
            });
        }
    }

    /// Starts probes for environments idle or busy beyond the staleness
    /// threshold, at most once per health-check interval.
    fn schedule_probes(&mut self) {
        let interval = Duration::from_secs(self.config.health_check_interval_secs);
        if self
            .last_health_sweep
            .is_some_and(|last| last.elapsed() < interval)
        {
            return;
        }
        self.last_health_sweep = Some(Instant::now());

        let stale_after = Duration::from_secs(self.config.stale_after_secs);
        for env_id in self.pool.stale_environments(stale_after) {
            if self.probes.contains_key(&env_id) {
                continue;
            }
            let pool = self.pool.clone();
            let wake = self.wake.clone();
            let id = env_id.clone();
            let handle = tokio::spawn(async move {
                let health = pool.health_check(&id).await;
                wake.notify_one();
                health
            });
            self.probes.insert(env_id, handle);
        }
    }

    async fn collect_probes(&mut self) {
        let finished: Vec<EnvironmentId> = self
            .probes
            .iter()
            .filter(|(_, h)| h.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for env_id in finished {
            let Some(handle) = self.probes.remove(&env_id) else {
                continue;
            };
            let health = handle.await.unwrap_or(Health::Unknown);
            if health == Health::Unhealthy {
                self.on_unhealthy(&env_id);
            }
        }
    }

    fn on_unhealthy(&mut self, env_id: &str) {
        let bound = self
            .in_flight
            .iter()
            .find(|(_, f)| f.env_id == env_id)
            .map(|(rid, _)| rid.clone());

        if let Some(rid) = bound
            && let Some(flight) = self.in_flight.remove(&rid)
        {
            warn!(env = %env_id, record = %rid, "Environment failed health check while busy");
            flight.cancel.cancel();
            flight.handle.abort();
            self.settlements.push_back(Settlement {
                record_id: rid,
                env_id: flight.env_id,
                update: TerminalUpdate::failed(Failure::new(
                    FailureKind::EnvironmentHealthFailure,
                    format!("environment {} failed its health check", env_id),
                )),
                release: ReleaseOutcome::Unhealthy,
            });
            return;
        }

        if self
            .pool
            .get(env_id)
            .is_some_and(|e| e.state == EnvironmentState::Ready)
        {
            warn!(env = %env_id, "Idle environment failed health check");
            self.pool.retire(env_id);
        }
    }

    /// Puts `environment_pending` records without a runner back in the
    /// queue, freeing the environment they were given. A launch that failed
    /// half-way leaves them behind; requeueing does not consume a retry.
    fn requeue_stranded(&mut self) -> Result<(), CycleError> {
        let pending = self
            .store
            .list(&RecordFilter::states(&[RecordState::EnvironmentPending]));
        for record in pending {
            if self.in_flight.contains_key(&record.id) {
                continue;
            }
            if let Some(env_id) = &record.environment_id
                && self
                    .pool
                    .get(env_id)
                    .is_some_and(|e| e.bound_record.as_deref() == Some(record.id.as_str()))
            {
                self.pool.release(env_id, ReleaseOutcome::Healthy)?;
            }
            warn!(record = %record.id, "Requeueing record whose launch did not complete");
            self.store.revert_dispatch(&record.id)?;
        }
        Ok(())
    }

    /// Hands queued records to the pool in priority order.
    fn dispatch(&mut self) -> Result<(), CycleError> {
        let mut capacity = self.parallelism.saturating_sub(self.in_flight.len());
        if capacity == 0 {
            return Ok(());
        }

        // Plans that may not start another record this cycle.
        let mut serialized: HashSet<PlanId> = HashSet::new();
        let active_plans: HashSet<PlanId> =
            self.in_flight.values().map(|f| f.plan_id.clone()).collect();

        for candidate in self.store.peek_next() {
            if capacity == 0 {
                break;
            }
            let record = &candidate.record;
            if !candidate.config.parallel_execution {
                if active_plans.contains(&record.plan_id) || serialized.contains(&record.plan_id)
                {
                    continue;
                }
                serialized.insert(record.plan_id.clone());
            }

            let acquired = self.pool.acquire(
                &record.id,
                &candidate.test_case.hardware,
                candidate.config.environment_preference.as_deref(),
            )?;
            match acquired {
                Acquire::Acquired(lease) => {
                    if self.launch(record, candidate.test_case.clone(), &candidate.config, lease)? {
                        capacity -= 1;
                    }
                }
                Acquire::Pending(env_id) => {
                    debug!(record = %record.id, env = %env_id, "Waiting for environment");
                }
                Acquire::Unavailable | Acquire::Unsatisfiable => {}
            }
        }
        Ok(())
    }

    /// Claims the record and starts its runner. Returns `false` if another
    /// caller claimed the record first.
    fn launch(
        &mut self,
        record: &ExecutionRecord,
        test_case: Arc<TestCase>,
        config: &ExecutionConfig,
        lease: Lease<P::Sandbox>,
    ) -> Result<bool, CycleError> {
        let dispatched = self.store.mark_dispatched(&record.id, &lease.env_id);
        if !matches!(dispatched, Ok(true)) {
            self.release_unlaunched(&lease.env_id);
            return dispatched.map_err(CycleError::from);
        }
        let record = match self.store.mark_running(&record.id) {
            Ok(record) => record,
            Err(e) => {
                self.release_unlaunched(&lease.env_id);
                // Otherwise the record stays environment_pending until
                // the next cycle requeues it.
                if let Err(revert) = self.store.revert_dispatch(&record.id) {
                    warn!(record = %record.id, "Failed to requeue record: {}", revert);
                }
                return Err(e.into());
            }
        };
        if let Err(e) = self.store.refresh_plan_status(&record.plan_id) {
            warn!(plan = %record.plan_id, "Failed to update plan status: {}", e);
        }

        info!(
            record = %record.id,
            env = %lease.env_id,
            template = %lease.template,
            attempt = record.retry_count + 1,
            "Test started"
        );

        let timeout = config.timeout();
        let cancel = CancellationToken::new();
        let runner = self.runner.clone();
        let tx = self.completions_tx.clone();
        let wake = self.wake.clone();
        let token = cancel.clone();
        let sandbox = lease.sandbox;
        let rid = record.id.clone();
        let plan_id = record.plan_id.clone();

        let handle = tokio::spawn(async move {
            let outcome = runner
                .run(sandbox.as_ref(), &record, &test_case, timeout, token)
                .await;
            let _ = tx.send((record.id.clone(), outcome));
            wake.notify_one();
        });

        let grace = Duration::from_secs(self.config.cancel_grace_secs);
        self.in_flight.insert(
            rid,
            InFlight {
                plan_id,
                env_id: lease.env_id,
                handle,
                cancel,
                timeout,
                deadline: Instant::now() + timeout + grace,
                stop: None,
            },
        );
        Ok(true)
    }

    /// Returns the environment of a record that never started running.
    fn release_unlaunched(&self, env_id: &str) {
        if let Err(e) = self.pool.release(env_id, ReleaseOutcome::Healthy) {
            warn!(env = %env_id, "Failed to release environment: {}", e);
        }
    }

    /// Stops every runner, waits up to the grace period, then tears all
    /// environments down.
    async fn drain(&mut self) {
        let now = Instant::now();
        for flight in self.in_flight.values_mut() {
            if flight.stop.is_none() {
                flight.cancel.cancel();
                flight.stop = Some((Stop::Shutdown, now));
            }
        }

        let deadline = now + Duration::from_secs(self.config.cancel_grace_secs);
        while !self.in_flight.is_empty() && Instant::now() < deadline {
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }
            self.collect_completions();
        }
        self.enforce_deadlines();
        for (_, flight) in self.in_flight.drain() {
            flight.handle.abort();
        }
        if let Err(e) = self.apply_settlements() {
            error!("Failed to record results during shutdown: {}", e);
        }

        for (_, probe) in self.probes.drain() {
            probe.abort();
        }
        self.pool.shutdown().await;
    }
}

/// Maps a runner outcome to the record's terminal state and what happens
/// to its environment.
fn settle_outcome(rid: &str, flight: &InFlight, outcome: ExecutionOutcome) -> Settlement {
    let release = if outcome.environment_reusable() {
        ReleaseOutcome::Healthy
    } else {
        ReleaseOutcome::Unhealthy
    };
    let update = match outcome {
        ExecutionOutcome::Completed {
            exit_code: 0,
            artifacts,
        } => TerminalUpdate::completed(0, artifacts),
        ExecutionOutcome::Completed {
            exit_code,
            artifacts,
        } => TerminalUpdate::failed(Failure::new(
            FailureKind::ExecutionFailure,
            format!("script exited with code {}", exit_code),
        ))
        .with_exit_code(Some(exit_code))
        .with_artifacts(artifacts),
        ExecutionOutcome::Failed { reason, artifacts } => {
            TerminalUpdate::failed(Failure::new(FailureKind::ExecutionFailure, reason))
                .with_artifacts(artifacts)
        }
        ExecutionOutcome::TimedOut { artifacts } => TerminalUpdate::timed_out(Failure::new(
            FailureKind::TimeoutExceeded,
            format!("exceeded the {}s timeout", flight.timeout.as_secs()),
        ))
        .with_artifacts(artifacts),
        ExecutionOutcome::Cancelled { artifacts } => {
            let reason = flight.stop.map(|(stop, _)| stop.reason()).unwrap_or("cancelled");
            TerminalUpdate::cancelled(reason).with_artifacts(artifacts)
        }
    };
    Settlement {
        record_id: rid.to_string(),
        env_id: flight.env_id.clone(),
        update,
        release,
    }
}

/// Thread-safe entry point for callers outside the loop.
///
/// Every mutating call wakes the loop so the change is picked up without
/// waiting for the next tick.
pub struct OrchestratorHandle<P: SandboxProvider> {
    store: Arc<PlanStore>,
    pool: EnvironmentPool<P>,
    wake: Arc<Notify>,
    shutdown: CancellationToken,
    status: StatusCell,
}

impl<P: SandboxProvider> Clone for OrchestratorHandle<P> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            pool: self.pool.clone(),
            wake: self.wake.clone(),
            shutdown: self.shutdown.clone(),
            status: self.status.clone(),
        }
    }
}

impl<P: SandboxProvider> OrchestratorHandle<P> {
    pub fn submit_plan(&self, submission: PlanSubmission) -> Result<ExecutionPlan, StoreError> {
        let plan = self.store.submit(submission)?;
        self.force_poll();
        Ok(plan)
    }

    /// Releases a plan submitted with [`PlanSubmission::held`].
    pub fn start_execution(&self, plan_id: &str) -> Result<ExecutionPlan, StoreError> {
        let plan = self.store.start(plan_id)?;
        self.force_poll();
        Ok(plan)
    }

    /// Cancels a plan: queued records immediately, running ones within the
    /// grace period. Returns the number of records cancelled immediately.
    pub fn cancel_execution(&self, plan_id: &str) -> Result<usize, StoreError> {
        let cancelled = self.store.request_cancel(plan_id)?;
        self.force_poll();
        Ok(cancelled)
    }

    /// Runs a cycle now instead of at the next tick.
    pub fn force_poll(&self) {
        self.wake.notify_one();
    }

    /// Removes terminal records older than `max_age_hours`.
    pub fn cleanup_stale_executions(&self, max_age_hours: u64) -> Result<PurgeSummary, StoreError> {
        let cutoff = i64::try_from(max_age_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let summary = self.store.purge_terminal_older_than(cutoff)?;
        info!(
            records = summary.records,
            plans = summary.plans,
            "Purged executions older than {}h",
            max_age_hours
        );
        Ok(summary)
    }

    pub fn execution_status(&self, plan_id: &str) -> Result<PlanStatusReport, StoreError> {
        status::execution_status(&self.store, plan_id)
    }

    pub fn list_active_executions(&self) -> Vec<ActiveExecution> {
        status::active_executions(&self.store)
    }

    /// Per-record detail of one plan.
    pub fn records(&self, plan_id: &str) -> Vec<ExecutionRecord> {
        self.store.list(&RecordFilter::plan(plan_id))
    }

    pub fn metrics(&self) -> Metrics {
        status::metrics(&self.store, self.status.get(), self.pool.available_count())
    }

    pub fn environments(&self) -> Vec<EnvironmentRecord> {
        self.pool.snapshot()
    }

    pub fn store(&self) -> &Arc<PlanStore> {
        &self.store
    }

    /// Asks the loop to stop. [`Orchestrator::run`] returns once runners
    /// are stopped and environments torn down.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
