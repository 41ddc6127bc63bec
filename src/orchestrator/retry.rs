//! Retry decisions for records and backoff for failing cycles.

use std::time::Duration;

use rand::Rng;

use crate::model::{ExecutionConfig, ExecutionRecord, Failure};

/// Decides whether a failed record goes back to the queue.
///
/// A record is retried only when its plan enables `retry_failed`, the
/// failure kind is retryable (timeouts, cancellations, provisioning and
/// restart failures never are), the plan is not being cancelled, and the
/// record has retries left.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 1 }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn should_retry(
        &self,
        config: &ExecutionConfig,
        record: &ExecutionRecord,
        failure: &Failure,
        plan_cancelling: bool,
    ) -> bool {
        config.retry_failed
            && !plan_cancelling
            && failure.kind.is_retryable()
            && record.retry_count < self.max_retries
    }
}

/// Exponential backoff with full jitter for consecutive failed cycles.
#[derive(Debug)]
pub struct CycleBackoff {
    base: Duration,
    max: Duration,
    failures: u32,
}

impl CycleBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            failures: 0,
        }
    }

    /// Records a failure and returns how long to wait before the next cycle.
    pub fn next_delay(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        let exp = self.failures.saturating_sub(1).min(16);
        let ceiling = self.base.saturating_mul(1 << exp).min(self.max);
        let jitter_ms = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64 / 2);
        (ceiling / 2 + Duration::from_millis(jitter_ms)).min(self.max)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }
}
