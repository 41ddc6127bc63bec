//! Environment pool: the only owner of provisioned environments.
//!
//! Every environment lives in its own slot with its own lock, so acquiring,
//! releasing or probing one environment never waits on another. Slow
//! backend work (provisioning, teardown) runs on spawned tasks; the caller
//! gets an immediate answer and the orchestrator is woken through
//! [`notifier`](EnvironmentPool::notifier) when the work finishes.
//!
//! # Environment Lifecycle
//!
//! ```text
//! provisioning ──► ready ◄──► busy
//!      │             │          │ unhealthy release / destroy
//!      │             ▼          ▼
//!      └──────────► tearing_down ──► destroyed (slot removed)
//! ```
//!
//! An environment provisioned on behalf of a record is *reserved* for that
//! record until the record claims it or the reservation is dropped, so the
//! record that paid for provisioning is the one that gets it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::hardware::{self, EnvironmentTemplate, HardwareProfile};
use crate::model::{EnvironmentId, EnvironmentRecord, EnvironmentState, Health, RecordId};
use crate::provider::{ProviderError, Sandbox, SandboxProvider, SandboxSpec};
use crate::store::StoreError;
use crate::store::persist::{EntityKind, Persistence, load_entities, put_entity};

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Unknown environment: {0}")]
    UnknownEnvironment(EnvironmentId),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// Exclusive use of one environment for one record.
pub struct Lease<S> {
    pub env_id: EnvironmentId,
    pub template: String,
    pub sandbox: Arc<S>,
}

/// Answer to [`EnvironmentPool::acquire`].
pub enum Acquire<S> {
    /// A ready environment was claimed and is now `busy`.
    Acquired(Lease<S>),
    /// An environment is being provisioned for this record.
    Pending(EnvironmentId),
    /// The pool is at capacity.
    Unavailable,
    /// No catalog template can ever satisfy the requirement.
    Unsatisfiable,
}

/// How the environment came back from a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Healthy,
    Unhealthy,
}

/// Asynchronous results the orchestrator has to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    ProvisionFailed {
        env_id: EnvironmentId,
        record_id: Option<RecordId>,
        reason: String,
    },
}

struct SlotState<S> {
    record: EnvironmentRecord,
    sandbox: Option<Arc<S>>,
    /// Monotonic twin of `record.last_activity`.
    idle_since: Instant,
}

impl<S> SlotState<S> {
    fn touch(&mut self) {
        self.record.last_activity = Utc::now();
        self.idle_since = Instant::now();
    }
}

type Slot<S> = Arc<Mutex<SlotState<S>>>;

struct PoolInner<P: SandboxProvider> {
    provider: Arc<P>,
    config: PoolConfig,
    probe_timeout: Duration,
    persistence: Arc<dyn Persistence>,
    slots: RwLock<HashMap<EnvironmentId, Slot<P::Sandbox>>>,
    /// Serializes the capacity check with the slot insert of a provision.
    admission: Mutex<()>,
    events: Mutex<Vec<PoolEvent>>,
    unsatisfiable: Mutex<HashSet<RecordId>>,
    wake: Arc<Notify>,
}

/// Bounded set of environments created through a [`SandboxProvider`].
///
/// Cloning is cheap; clones share the same pool.
pub struct EnvironmentPool<P: SandboxProvider> {
    inner: Arc<PoolInner<P>>,
}

impl<P: SandboxProvider> Clone for EnvironmentPool<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl<P: SandboxProvider> EnvironmentPool<P> {
    pub fn new(
        provider: P,
        config: PoolConfig,
        persistence: Arc<dyn Persistence>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                provider: Arc::new(provider),
                config,
                probe_timeout,
                persistence,
                slots: RwLock::new(HashMap::new()),
                admission: Mutex::new(()),
                events: Mutex::new(Vec::new()),
                unsatisfiable: Mutex::new(HashSet::new()),
                wake: Arc::new(Notify::new()),
            }),
        }
    }

    /// Notified whenever provisioning or teardown finishes.
    pub fn notifier(&self) -> Arc<Notify> {
        self.inner.wake.clone()
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.max_environments
    }

    /// Destroys environments persisted by a previous process.
    ///
    /// Their handles died with that process, so they cannot be reused.
    /// Returns the number of environments reclaimed.
    pub async fn recover(&self) -> Result<usize, PoolError> {
        let stale: Vec<EnvironmentRecord> =
            load_entities(self.inner.persistence.as_ref(), EntityKind::Environment)?;
        let mut reclaimed = 0;
        for env in stale {
            if let Err(e) = self
                .inner
                .provider
                .reclaim(&env.id, env.remote_id.as_deref())
                .await
            {
                warn!(env = %env.id, "Failed to reclaim environment: {}", e);
            }
            self.inner
                .persistence
                .delete(EntityKind::Environment, &env.id)?;
            reclaimed += 1;
        }
        if reclaimed > 0 {
            info!("Reclaimed {} environments left by a previous run", reclaimed);
        }
        Ok(reclaimed)
    }

    /// Starts provisioning the `prewarm` environments of every template.
    pub fn prewarm(&self) -> Result<usize, PoolError> {
        let mut started = 0;
        for template in self.inner.config.catalog.clone() {
            for _ in 0..template.prewarm {
                if self.provision_within_capacity(&template, None)?.is_none() {
                    return Ok(started);
                }
                started += 1;
            }
        }
        if started > 0 {
            info!("Prewarming {} environments", started);
        }
        Ok(started)
    }

    /// Tries to give `record_id` an environment satisfying `requirement`.
    ///
    /// Never blocks on the backend: if a new environment is needed its
    /// provisioning is started and [`Acquire::Pending`] is returned.
    pub fn acquire(
        &self,
        record_id: &str,
        requirement: &HardwareProfile,
        preference: Option<&str>,
    ) -> Result<Acquire<P::Sandbox>, PoolError> {
        if let Some(lease) = self.claim_ready(record_id, requirement)? {
            return Ok(Acquire::Acquired(lease));
        }

        if let Some(env_id) = self.reservation_of(record_id) {
            return Ok(Acquire::Pending(env_id));
        }

        let Some(template) =
            hardware::select_template(requirement, &self.inner.config.catalog, preference).cloned()
        else {
            if lock(&self.inner.unsatisfiable).insert(record_id.to_string()) {
                warn!(
                    record = %record_id,
                    arch = %requirement.architecture,
                    memory_mb = requirement.memory_mb,
                    "No catalog template satisfies the hardware requirement; test stays queued"
                );
            }
            return Ok(Acquire::Unsatisfiable);
        };

        match self.provision_within_capacity(&template, Some(record_id))? {
            Some(env_id) => Ok(Acquire::Pending(env_id)),
            None => {
                self.evict_idle_mismatch(requirement);
                Ok(Acquire::Unavailable)
            }
        }
    }

    /// Claims the longest-idle ready environment usable by `record_id`.
    fn claim_ready(
        &self,
        record_id: &str,
        requirement: &HardwareProfile,
    ) -> Result<Option<Lease<P::Sandbox>>, PoolError> {
        let mut candidates: Vec<(bool, Instant, Slot<P::Sandbox>)> = self
            .slots()
            .into_iter()
            .filter_map(|slot| {
                let state = lock(&*slot);
                let r = &state.record;
                let usable = r.state == EnvironmentState::Ready
                    && r.health != Health::Unhealthy
                    && r.reserved_for.as_deref().is_none_or(|rid| rid == record_id)
                    && hardware::matches(requirement, &r.profile);
                let own = r.reserved_for.as_deref() == Some(record_id);
                let idle_since = state.idle_since;
                drop(state);
                usable.then_some((!own, idle_since, slot))
            })
            .collect();
        candidates.sort_by_key(|(not_own, idle_since, _)| (*not_own, *idle_since));

        for (_, _, slot) in candidates {
            let mut state = lock(&*slot);
            // Re-check under the slot lock; a teardown may have raced us.
            if state.record.state != EnvironmentState::Ready {
                continue;
            }
            let Some(sandbox) = state.sandbox.clone() else {
                continue;
            };
            let mut next = state.record.clone();
            next.state = EnvironmentState::Busy;
            next.bound_record = Some(record_id.to_string());
            next.reserved_for = None;
            next.last_activity = Utc::now();
            self.persist(&next)?;
            state.record = next;
            state.idle_since = Instant::now();
            let lease = Lease {
                env_id: state.record.id.clone(),
                template: state.record.template.clone(),
                sandbox,
            };
            drop(state);

            self.drop_reservation(record_id);
            lock(&self.inner.unsatisfiable).remove(record_id);
            debug!(env = %lease.env_id, record = %record_id, "Environment acquired");
            return Ok(Some(lease));
        }
        Ok(None)
    }

    fn reservation_of(&self, record_id: &str) -> Option<EnvironmentId> {
        self.slots().into_iter().find_map(|slot| {
            let state = lock(&*slot);
            (state.record.state == EnvironmentState::Provisioning
                && state.record.reserved_for.as_deref() == Some(record_id))
            .then(|| state.record.id.clone())
        })
    }

    /// Clears any reservation held for `record_id`.
    pub fn drop_reservation(&self, record_id: &str) {
        for slot in self.slots() {
            let mut state = lock(&*slot);
            if state.record.reserved_for.as_deref() == Some(record_id) {
                state.record.reserved_for = None;
                let record = state.record.clone();
                drop(state);
                if let Err(e) = self.persist(&record) {
                    warn!(env = %record.id, "Failed to persist environment: {}", e);
                }
            }
        }
    }

    /// Clears reservations whose record no longer wants an environment.
    pub fn retain_reservations(&self, keep: impl Fn(&str) -> bool) {
        let stale: Vec<RecordId> = self
            .slots()
            .into_iter()
            .filter_map(|slot| lock(&*slot).record.reserved_for.clone())
            .filter(|rid| !keep(rid))
            .collect();
        for rid in stale {
            debug!(record = %rid, "Dropping environment reservation");
            self.drop_reservation(&rid);
        }
    }

    /// Makes room for a different profile by tearing down one idle
    /// environment that cannot serve `requirement`.
    fn evict_idle_mismatch(&self, requirement: &HardwareProfile) {
        let victim = self
            .slots()
            .into_iter()
            .filter_map(|slot| {
                let state = lock(&*slot);
                let r = &state.record;
                (r.state == EnvironmentState::Ready
                    && r.reserved_for.is_none()
                    && !hardware::matches(requirement, &r.profile))
                .then(|| (state.idle_since, r.id.clone()))
            })
            .min();
        if let Some((_, env_id)) = victim {
            info!(env = %env_id, "Evicting idle environment to make room");
            self.destroy_in_background(&env_id, false);
        }
    }

    /// Starts provisioning from `template` unless the pool is full.
    ///
    /// Every provisioning path goes through here, so concurrent callers
    /// can never push the pool past its capacity.
    fn provision_within_capacity(
        &self,
        template: &EnvironmentTemplate,
        reserved_for: Option<&str>,
    ) -> Result<Option<EnvironmentId>, PoolError> {
        let _admission = lock(&self.inner.admission);
        if self.live_count() >= self.capacity() {
            return Ok(None);
        }
        self.provision(template, reserved_for).map(Some)
    }

    fn provision(
        &self,
        template: &EnvironmentTemplate,
        reserved_for: Option<&str>,
    ) -> Result<EnvironmentId, PoolError> {
        let simple = uuid::Uuid::new_v4().simple().to_string();
        let env_id = format!("env-{}", &simple[..12]);
        let now = Utc::now();
        let record = EnvironmentRecord {
            id: env_id.clone(),
            remote_id: None,
            template: template.name.clone(),
            profile: template.profile.clone(),
            state: EnvironmentState::Provisioning,
            health: Health::Unknown,
            last_activity: now,
            bound_record: None,
            reserved_for: reserved_for.map(str::to_string),
            created_at: now,
        };
        self.persist(&record)?;

        let slot: Slot<P::Sandbox> = Arc::new(Mutex::new(SlotState {
            record,
            sandbox: None,
            idle_since: Instant::now(),
        }));
        self.inner
            .slots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(env_id.clone(), slot.clone());

        info!(
            env = %env_id,
            template = %template.name,
            record = ?reserved_for,
            "Provisioning environment"
        );

        let spec = SandboxSpec {
            id: env_id.clone(),
            template: template.name.clone(),
            profile: template.profile.clone(),
        };
        let pool = self.clone();
        tokio::spawn(async move {
            let timeout = Duration::from_secs(pool.inner.config.provision_timeout_secs);
            let result = match tokio::time::timeout(
                timeout,
                pool.inner.provider.create_sandbox(&spec),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(format!(
                    "provisioning took longer than {:?}",
                    timeout
                ))),
            };
            pool.finish_provision(&spec.id, slot, result).await;
        });

        Ok(env_id)
    }

    async fn finish_provision(
        &self,
        env_id: &str,
        slot: Slot<P::Sandbox>,
        result: Result<P::Sandbox, ProviderError>,
    ) {
        match result {
            Ok(sandbox) => {
                let sandbox = Arc::new(sandbox);
                let orphaned = {
                    let mut state = lock(&*slot);
                    if state.record.state == EnvironmentState::Provisioning {
                        state.record.state = EnvironmentState::Ready;
                        state.record.health = Health::Healthy;
                        state.record.remote_id = sandbox.remote_id().map(str::to_string);
                        state.touch();
                        state.sandbox = Some(sandbox.clone());
                        if let Err(e) = self.persist(&state.record) {
                            warn!(env = %env_id, "Failed to persist environment: {}", e);
                        }
                        false
                    } else {
                        true
                    }
                };
                if orphaned {
                    // Destroyed while provisioning.
                    if let Err(e) = sandbox.terminate().await {
                        warn!(env = %env_id, "Failed to terminate orphaned environment: {}", e);
                    }
                } else {
                    info!(env = %env_id, "Environment ready");
                }
            }
            Err(e) => {
                let record_id = lock(&*slot).record.reserved_for.clone();
                error!(env = %env_id, record = ?record_id, "Provisioning failed: {}", e);
                self.remove_slot(env_id);
                lock(&self.inner.events).push(PoolEvent::ProvisionFailed {
                    env_id: env_id.to_string(),
                    record_id,
                    reason: e.to_string(),
                });
            }
        }
        self.inner.wake.notify_one();
    }

    /// Returns a busy environment to the pool.
    ///
    /// An environment that failed a health check while busy is torn down
    /// even when released as [`ReleaseOutcome::Healthy`].
    ///
    /// Idempotent: releasing an environment that is not `busy` (already
    /// released, torn down, or unknown) does nothing and returns `false`.
    pub fn release(&self, env_id: &str, outcome: ReleaseOutcome) -> Result<bool, PoolError> {
        let Some(slot) = self.slot(env_id) else {
            return Ok(false);
        };
        let mut state = lock(&*slot);
        if state.record.state != EnvironmentState::Busy {
            return Ok(false);
        }

        let outcome = if state.record.health == Health::Unhealthy {
            ReleaseOutcome::Unhealthy
        } else {
            outcome
        };
        match outcome {
            ReleaseOutcome::Healthy => {
                state.record.state = EnvironmentState::Ready;
                state.record.health = Health::Healthy;
                state.record.bound_record = None;
                state.touch();
                if let Err(e) = self.persist(&state.record) {
                    warn!(env = %env_id, "Failed to persist environment: {}", e);
                }
                debug!(env = %env_id, "Environment released");
                drop(state);
                self.inner.wake.notify_one();
            }
            ReleaseOutcome::Unhealthy => {
                state.record.health = Health::Unhealthy;
                drop(state);
                warn!(env = %env_id, "Environment released unhealthy; tearing down");
                self.destroy_in_background(env_id, self.inner.config.reprovision_on_failure);
            }
        }
        Ok(true)
    }

    /// Tears down an idle environment that failed its health check,
    /// replacing it if `reprovision_on_failure` is set. Busy environments
    /// are left to [`release`](Self::release).
    pub fn retire(&self, env_id: &str) -> bool {
        let Some(slot) = self.slot(env_id) else {
            return false;
        };
        {
            let mut state = lock(&*slot);
            if state.record.state != EnvironmentState::Ready {
                return false;
            }
            state.record.health = Health::Unhealthy;
        }
        self.destroy_in_background(env_id, self.inner.config.reprovision_on_failure);
        true
    }

    /// Probes one environment, bounded by the probe timeout.
    ///
    /// A successful probe counts as activity.
    pub async fn health_check(&self, env_id: &str) -> Health {
        let Some(slot) = self.slot(env_id) else {
            return Health::Unknown;
        };
        let Some(sandbox) = lock(&*slot).sandbox.clone() else {
            return Health::Unknown;
        };

        let health = match tokio::time::timeout(self.inner.probe_timeout, sandbox.probe()).await {
            Ok(Ok(true)) => Health::Healthy,
            Ok(Ok(false)) => Health::Unhealthy,
            Ok(Err(e)) => {
                warn!(env = %env_id, "Health probe failed: {}", e);
                Health::Unhealthy
            }
            Err(_) => {
                warn!(env = %env_id, "Health probe timed out");
                Health::Unhealthy
            }
        };

        let mut state = lock(&*slot);
        if matches!(
            state.record.state,
            EnvironmentState::Ready | EnvironmentState::Busy
        ) {
            state.record.health = health;
            if health == Health::Healthy {
                state.touch();
            }
            if let Err(e) = self.persist(&state.record) {
                warn!(env = %env_id, "Failed to persist environment: {}", e);
            }
        }
        health
    }

    /// Tears an environment down and removes it. Safe on unknown or
    /// already-destroyed ids.
    pub async fn destroy(&self, env_id: &str) -> Result<(), PoolError> {
        let Some(sandbox) = self.begin_teardown(env_id) else {
            return Ok(());
        };
        let result = match sandbox {
            Some(sandbox) => sandbox.terminate().await,
            None => Ok(()),
        };
        self.remove_slot(env_id);
        info!(env = %env_id, "Environment destroyed");
        self.inner.wake.notify_one();
        result.map_err(PoolError::from)
    }

    /// [`destroy`](Self::destroy) on a spawned task, optionally followed by
    /// provisioning a replacement from the same template.
    pub fn destroy_in_background(&self, env_id: &str, replace: bool) {
        let template = self
            .slot(env_id)
            .map(|slot| lock(&*slot).record.template.clone());
        let pool = self.clone();
        let env_id = env_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = pool.destroy(&env_id).await {
                warn!(env = %env_id, "Teardown failed: {}", e);
            }
            if !replace {
                return;
            }
            let template = template.and_then(|name| {
                pool.inner
                    .config
                    .catalog
                    .iter()
                    .find(|t| t.name == name)
                    .cloned()
            });
            let Some(template) = template else {
                return;
            };
            match pool.provision_within_capacity(&template, None) {
                Ok(Some(_)) => {}
                Ok(None) => {
                    debug!(template = %template.name, "Pool is full; no replacement started")
                }
                Err(e) => {
                    warn!(template = %template.name, "Failed to start replacement: {}", e)
                }
            }
        });
    }

    /// Marks the slot as tearing down and takes its sandbox.
    ///
    /// Returns `None` if there is nothing to tear down.
    fn begin_teardown(&self, env_id: &str) -> Option<Option<Arc<P::Sandbox>>> {
        let slot = self.slot(env_id)?;
        let mut state = lock(&*slot);
        if matches!(
            state.record.state,
            EnvironmentState::TearingDown | EnvironmentState::Destroyed
        ) {
            return None;
        }
        state.record.state = EnvironmentState::TearingDown;
        state.record.bound_record = None;
        state.record.reserved_for = None;
        if let Err(e) = self.persist(&state.record) {
            warn!(env = %env_id, "Failed to persist environment: {}", e);
        }
        Some(state.sandbox.take())
    }

    fn remove_slot(&self, env_id: &str) {
        let removed = self
            .inner
            .slots
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(env_id);
        if let Some(slot) = removed {
            lock(&*slot).record.state = EnvironmentState::Destroyed;
        }
        if let Err(e) = self
            .inner
            .persistence
            .delete(EntityKind::Environment, env_id)
        {
            warn!(env = %env_id, "Failed to delete environment: {}", e);
        }
    }

    /// Tears every environment down. Used at shutdown.
    pub async fn shutdown(&self) {
        let ids: Vec<EnvironmentId> = self.snapshot().into_iter().map(|e| e.id).collect();
        for env_id in ids {
            if let Err(e) = self.destroy(&env_id).await {
                warn!(env = %env_id, "Failed to terminate environment: {}", e);
            }
        }
    }

    /// Events produced since the last call.
    pub fn drain_events(&self) -> Vec<PoolEvent> {
        std::mem::take(&mut *lock(&self.inner.events))
    }

    /// Environments whose last activity is older than `stale_after`.
    pub fn stale_environments(&self, stale_after: Duration) -> Vec<EnvironmentId> {
        self.slots()
            .into_iter()
            .filter_map(|slot| {
                let state = lock(&*slot);
                (matches!(
                    state.record.state,
                    EnvironmentState::Ready | EnvironmentState::Busy
                ) && state.idle_since.elapsed() >= stale_after)
                    .then(|| state.record.id.clone())
            })
            .collect()
    }

    /// Current state of every environment.
    pub fn snapshot(&self) -> Vec<EnvironmentRecord> {
        let mut out: Vec<EnvironmentRecord> = self
            .slots()
            .into_iter()
            .map(|slot| lock(&*slot).record.clone())
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }

    pub fn get(&self, env_id: &str) -> Option<EnvironmentRecord> {
        self.slot(env_id).map(|slot| lock(&*slot).record.clone())
    }

    /// Ready environments not reserved for any record.
    pub fn available_count(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|e| e.state == EnvironmentState::Ready && e.reserved_for.is_none())
            .count()
    }

    /// Environments counted against capacity.
    pub fn live_count(&self) -> usize {
        self.snapshot()
            .iter()
            .filter(|e| e.state != EnvironmentState::Destroyed)
            .count()
    }

    fn slots(&self) -> Vec<Slot<P::Sandbox>> {
        self.inner
            .slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn slot(&self, env_id: &str) -> Option<Slot<P::Sandbox>> {
        self.inner
            .slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(env_id)
            .cloned()
    }

    fn persist(&self, record: &EnvironmentRecord) -> Result<(), StoreError> {
        put_entity(
            self.inner.persistence.as_ref(),
            EntityKind::Environment,
            &record.id,
            record,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::Architecture;
    use crate::provider::fake::FakeProvider;
    use crate::store::persist::MemoryPersistence;

    fn template(name: &str, arch: Architecture, memory_mb: u64) -> EnvironmentTemplate {
        EnvironmentTemplate {
            name: name.to_string(),
            prewarm: 0,
            profile: HardwareProfile::new(arch, memory_mb),
        }
    }

    fn pool(
        provider: FakeProvider,
        max: usize,
        catalog: Vec<EnvironmentTemplate>,
    ) -> (EnvironmentPool<FakeProvider>, MemoryPersistence) {
        pool_with(
            provider,
            PoolConfig {
                max_environments: max,
                reprovision_on_failure: false,
                provision_timeout_secs: 60,
                catalog,
            },
        )
    }

    fn pool_with(
        provider: FakeProvider,
        config: PoolConfig,
    ) -> (EnvironmentPool<FakeProvider>, MemoryPersistence) {
        let persistence = MemoryPersistence::new();
        let pool = EnvironmentPool::new(
            provider,
            config,
            Arc::new(persistence.clone()),
            Duration::from_secs(5),
        );
        (pool, persistence)
    }

    async fn acquire_ready(
        pool: &EnvironmentPool<FakeProvider>,
        record: &str,
        req: &HardwareProfile,
    ) -> Lease<crate::provider::fake::FakeSandbox> {
        loop {
            match pool.acquire(record, req, None).unwrap() {
                Acquire::Acquired(lease) => return lease,
                Acquire::Pending(_) => pool.notifier().notified().await,
                Acquire::Unavailable => tokio::task::yield_now().await,
                Acquire::Unsatisfiable => panic!("unsatisfiable"),
            }
        }
    }

    fn arm() -> HardwareProfile {
        HardwareProfile::new(Architecture::Aarch64, 512)
    }

    #[tokio::test]
    async fn test_acquire_provisions_then_claims_reserved_environment() {
        let (pool, persistence) = pool(
            FakeProvider::new(),
            2,
            vec![template("arm", Architecture::Aarch64, 1024)],
        );

        let env_id = match pool.acquire("p/a", &arm(), None).unwrap() {
            Acquire::Pending(id) => id,
            _ => panic!("expected provisioning"),
        };
        // A second record does not steal the reservation.
        pool.notifier().notified().await;
        assert!(matches!(
            pool.acquire("p/b", &arm(), None).unwrap(),
            Acquire::Pending(_)
        ));
        let lease = acquire_ready(&pool, "p/a", &arm()).await;
        assert_eq!(lease.env_id, env_id);

        let env = pool.get(&env_id).unwrap();
        assert_eq!(env.state, EnvironmentState::Busy);
        assert_eq!(env.bound_record.as_deref(), Some("p/a"));
        assert_eq!(persistence.count(EntityKind::Environment), 2);
    }

    #[tokio::test]
    async fn test_unsatisfiable_requirement() {
        let (pool, _) = pool(
            FakeProvider::new(),
            2,
            vec![template("x86", Architecture::X86_64, 1024)],
        );
        assert!(matches!(
            pool.acquire("p/a", &arm(), None).unwrap(),
            Acquire::Unsatisfiable
        ));
        assert_eq!(pool.live_count(), 0);
    }

    #[tokio::test]
    async fn test_capacity_ceiling() {
        let (pool, _) = pool(
            FakeProvider::new(),
            1,
            vec![template("arm", Architecture::Aarch64, 1024)],
        );
        assert!(matches!(
            pool.acquire("p/a", &arm(), None).unwrap(),
            Acquire::Pending(_)
        ));
        assert!(matches!(
            pool.acquire("p/b", &arm(), None).unwrap(),
            Acquire::Unavailable
        ));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (pool, _) = pool(
            FakeProvider::new(),
            1,
            vec![template("arm", Architecture::Aarch64, 1024)],
        );
        let lease = acquire_ready(&pool, "p/a", &arm()).await;

        assert!(pool.release(&lease.env_id, ReleaseOutcome::Healthy).unwrap());
        let once = pool.get(&lease.env_id).unwrap();
        assert!(!pool.release(&lease.env_id, ReleaseOutcome::Healthy).unwrap());
        assert!(!pool.release(&lease.env_id, ReleaseOutcome::Unhealthy).unwrap());
        let twice = pool.get(&lease.env_id).unwrap();

        assert_eq!(once, twice);
        assert_eq!(twice.state, EnvironmentState::Ready);
        assert!(!pool.release("env-unknown", ReleaseOutcome::Healthy).unwrap());
    }

    #[tokio::test]
    async fn test_longest_idle_environment_is_preferred() {
        let (pool, _) = pool(
            FakeProvider::new(),
            2,
            vec![template("arm", Architecture::Aarch64, 1024)],
        );
        let first = acquire_ready(&pool, "p/a", &arm()).await;
        let second = acquire_ready(&pool, "p/b", &arm()).await;
        pool.release(&first.env_id, ReleaseOutcome::Healthy).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        pool.release(&second.env_id, ReleaseOutcome::Healthy).unwrap();

        let next = acquire_ready(&pool, "p/c", &arm()).await;
        assert_eq!(next.env_id, first.env_id);
    }

    #[tokio::test]
    async fn test_unhealthy_release_tears_down() {
        let provider = FakeProvider::new();
        let (pool, _) = pool(
            provider.clone(),
            1,
            vec![template("arm", Architecture::Aarch64, 1024)],
        );
        let lease = acquire_ready(&pool, "p/a", &arm()).await;

        assert!(pool.release(&lease.env_id, ReleaseOutcome::Unhealthy).unwrap());
        while pool.get(&lease.env_id).is_some() {
            pool.notifier().notified().await;
        }
        assert_eq!(provider.state().terminated, vec![lease.env_id.clone()]);
        pool.destroy(&lease.env_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_health_check_overrides_healthy_release() {
        let provider = FakeProvider::new();
        let (pool, _) = pool(
            provider.clone(),
            1,
            vec![template("arm", Architecture::Aarch64, 1024)],
        );
        let lease = acquire_ready(&pool, "p/a", &arm()).await;
        provider.mark_unhealthy(&lease.env_id);
        assert_eq!(pool.health_check(&lease.env_id).await, Health::Unhealthy);

        // The run itself finished cleanly.
        assert!(pool.release(&lease.env_id, ReleaseOutcome::Healthy).unwrap());
        assert_ne!(
            pool.get(&lease.env_id).map(|e| e.state),
            Some(EnvironmentState::Ready)
        );
        while pool.get(&lease.env_id).is_some() {
            pool.notifier().notified().await;
        }
        assert_eq!(provider.state().terminated, vec![lease.env_id.clone()]);

        let next = acquire_ready(&pool, "p/b", &arm()).await;
        assert_ne!(next.env_id, lease.env_id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_replacement_and_acquire_share_capacity() {
        let (pool, _) = pool_with(
            FakeProvider::new(),
            PoolConfig {
                max_environments: 1,
                reprovision_on_failure: true,
                provision_timeout_secs: 60,
                catalog: vec![template("arm", Architecture::Aarch64, 1024)],
            },
        );

        for round in 0..20 {
            let lease = acquire_ready(&pool, &format!("p/a{}", round), &arm()).await;
            let contender = {
                let pool = pool.clone();
                tokio::spawn(async move {
                    acquire_ready(&pool, &format!("p/b{}", round), &arm()).await
                })
            };
            pool.release(&lease.env_id, ReleaseOutcome::Unhealthy).unwrap();

            let lease = contender.await.unwrap();
            assert!(pool.live_count() <= 1, "round {}: {:?}", round, pool.snapshot());
            pool.release(&lease.env_id, ReleaseOutcome::Healthy).unwrap();
        }
    }

    #[tokio::test]
    async fn test_health_check_reports_probe() {
        let provider = FakeProvider::new();
        let (pool, _) = pool(
            provider.clone(),
            1,
            vec![template("arm", Architecture::Aarch64, 1024)],
        );
        let lease = acquire_ready(&pool, "p/a", &arm()).await;

        assert_eq!(pool.health_check(&lease.env_id).await, Health::Healthy);
        provider.mark_unhealthy(&lease.env_id);
        assert_eq!(pool.health_check(&lease.env_id).await, Health::Unhealthy);
        assert_eq!(pool.health_check("env-missing").await, Health::Unknown);
    }

    #[tokio::test]
    async fn test_provision_failure_is_reported_not_retried() {
        let provider = FakeProvider::new();
        provider.state().fail_creates = 1;
        let (pool, _) = pool(
            provider.clone(),
            1,
            vec![template("arm", Architecture::Aarch64, 1024)],
        );

        let env_id = match pool.acquire("p/a", &arm(), None).unwrap() {
            Acquire::Pending(id) => id,
            _ => panic!("expected provisioning"),
        };
        pool.notifier().notified().await;

        let events = pool.drain_events();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            PoolEvent::ProvisionFailed { env_id: id, record_id: Some(r), .. }
                if *id == env_id && r == "p/a"
        ));
        assert_eq!(pool.live_count(), 0);
        assert!(provider.state().created.is_empty());
    }

    #[tokio::test]
    async fn test_idle_mismatch_is_evicted_at_capacity() {
        let provider = FakeProvider::new();
        let (pool, _) = pool(
            provider.clone(),
            1,
            vec![
                template("x86", Architecture::X86_64, 1024),
                template("arm", Architecture::Aarch64, 1024),
            ],
        );
        let x86 = HardwareProfile::new(Architecture::X86_64, 512);
        let lease = acquire_ready(&pool, "p/x", &x86).await;
        pool.release(&lease.env_id, ReleaseOutcome::Healthy).unwrap();

        assert!(matches!(
            pool.acquire("p/a", &arm(), None).unwrap(),
            Acquire::Unavailable
        ));
        let lease = acquire_ready(&pool, "p/a", &arm()).await;
        assert_eq!(pool.get(&lease.env_id).unwrap().template, "arm");
        assert_eq!(provider.state().terminated.len(), 1);
    }

    #[tokio::test]
    async fn test_recover_reclaims_persisted_environments() {
        let provider = FakeProvider::new();
        let (pool, persistence) = pool(provider.clone(), 1, vec![]);
        put_entity(
            &persistence,
            EntityKind::Environment,
            "env-old",
            &EnvironmentRecord {
                id: "env-old".to_string(),
                remote_id: Some("vm-7".to_string()),
                template: "arm".to_string(),
                profile: arm(),
                state: EnvironmentState::Busy,
                health: Health::Healthy,
                last_activity: Utc::now(),
                bound_record: Some("p/a".to_string()),
                reserved_for: None,
                created_at: Utc::now(),
            },
        )
        .unwrap();

        assert_eq!(pool.recover().await.unwrap(), 1);
        assert_eq!(provider.state().reclaimed, vec!["env-old".to_string()]);
        assert_eq!(persistence.count(EntityKind::Environment), 0);
    }
}
