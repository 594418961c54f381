//! Executor - runs a job's stage under its retry policy and deadline.
//!
//! One executor task per job, so at most one attempt of a job is ever
//! running. Attempts are strictly sequential: attempt N+1 is only started
//! after attempt N produced an outcome and the backoff delay elapsed.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::recovery::with_recovery_async;
use super::registry::JobRegistry;
use super::retry::backoff_delay;
use super::types::{Job, JobFailure};
use crate::commbus::{CommBus, Event};
use crate::events::{self, job_event};
use crate::stage::{StageError, StagePayload, StageRegistry, StageResult};
use crate::types::JobId;

/// Scheduler-wide counters, shared by the dispatcher and executor tasks.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub submitted: AtomicU64,
    pub attempts: AtomicU64,
    pub retries: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub timed_out: AtomicU64,
    pub canceled: AtomicU64,
    pub running: AtomicUsize,
    pub waiting: AtomicUsize,
}

/// Point-in-time scheduler statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub submitted: u64,
    pub attempts: u64,
    pub retries: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub canceled: u64,
    /// Jobs with an attempt in flight.
    pub running: usize,
    /// Admitted jobs waiting for an execution slot.
    pub waiting: usize,
    pub max_concurrent_jobs: usize,
}

impl Counters {
    pub fn snapshot(&self, max_concurrent_jobs: usize) -> SchedulerStats {
        SchedulerStats {
            submitted: self.submitted.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            canceled: self.canceled.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            waiting: self.waiting.load(Ordering::Relaxed),
            max_concurrent_jobs,
        }
    }
}

/// Outcome of a single attempt, before it is applied to the job record.
enum AttemptOutcome {
    Finished(StageResult),
    DeadlineExceeded,
}

/// Stage runner shared by every executor task.
#[derive(Debug, Clone)]
pub(crate) struct Executor {
    pub registry: Arc<JobRegistry>,
    pub stages: Arc<StageRegistry>,
    pub bus: Arc<CommBus>,
    pub counters: Arc<Counters>,
    pub shutdown: CancellationToken,
}

impl Executor {
    /// Drive `job_id` to a terminal state.
    pub async fn run(&self, job_id: JobId) {
        loop {
            let Some(job) = self.begin_attempt(&job_id).await else {
                return;
            };

            self.counters.running.fetch_add(1, Ordering::Relaxed);
            let outcome = self.run_attempt(&job).await;
            self.counters.running.fetch_sub(1, Ordering::Relaxed);

            match outcome {
                AttemptOutcome::DeadlineExceeded => {
                    self.finish_timeout(&job_id).await;
                    return;
                }
                AttemptOutcome::Finished(Ok(context)) => {
                    self.finish_success(&job_id, context.into_value()).await;
                    return;
                }
                AttemptOutcome::Finished(Err(err)) => {
                    if err.is_retryable() && job.attempts_remaining() {
                        if !self.schedule_retry(&job, &err).await {
                            return;
                        }
                    } else {
                        self.finish_failure(&job, err).await;
                        return;
                    }
                }
            }
        }
    }

    /// QUEUED → RUNNING, or TIMEOUT if the deadline already passed.
    /// Returns `None` when the job must not run (canceled, timed out, gone).
    async fn begin_attempt(&self, job_id: &JobId) -> Option<Job> {
        let now = Utc::now();
        let update = self
            .registry
            .update(job_id, |job| {
                if job.deadline_elapsed(now) {
                    job.time_out()?;
                    return Ok(false);
                }
                job.begin_attempt()?;
                Ok(true)
            })
            .await;

        match update {
            Ok((true, job)) => {
                self.counters.attempts.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    job_id = %job.id,
                    stage = %job.stage,
                    attempt = job.attempt,
                    max_attempts = job.max_attempts(),
                    "job_attempt_started"
                );
                self.publish(job_event(events::JOB_STARTED, &job, None)).await;
                Some(job)
            }
            Ok((false, job)) => {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(job_id = %job.id, "job_deadline_elapsed_before_attempt");
                self.publish(job_event(events::JOB_FAILED, &job, None)).await;
                None
            }
            Err(e) => {
                tracing::debug!(job_id = %job_id, error = %e, "job_not_runnable");
                None
            }
        }
    }

    async fn run_attempt(&self, job: &Job) -> AttemptOutcome {
        let stage = match self.stages.get(&job.stage) {
            Ok(stage) => stage,
            Err(e) => return AttemptOutcome::Finished(Err(StageError::fatal(e.to_string()))),
        };
        let payload = match StagePayload::from_value(&job.payload) {
            Ok(payload) => payload,
            Err(e) => return AttemptOutcome::Finished(Err(StageError::fatal(e.to_string()))),
        };

        let operation = format!("stage:{}", job.stage);
        let attempt = with_recovery_async(stage.run(payload.context, &payload.options), &operation);

        let contained = match job.time_to_deadline(Utc::now()) {
            Some(remaining) => match tokio::time::timeout(remaining, attempt).await {
                Ok(result) => result,
                Err(_) => return AttemptOutcome::DeadlineExceeded,
            },
            None => attempt.await,
        };

        // A panic inside the stage is permanent
        AttemptOutcome::Finished(
            contained.unwrap_or_else(|panic| Err(StageError::fatal(panic.to_string()))),
        )
    }

    /// RUNNING → QUEUED, then sleep the backoff. Returns false when the job
    /// should stop (canceled while running, or kernel shutdown).
    async fn schedule_retry(&self, job: &Job, err: &StageError) -> bool {
        let policy = &job.constraints.retry_policy;
        let mut delay = backoff_delay(policy, job.attempt);
        if let Some(remaining) = job.time_to_deadline(Utc::now()) {
            delay = delay.min(remaining);
        }

        if let Err(e) = self.registry.update(&job.id, |j| j.enqueue()).await {
            tracing::debug!(job_id = %job.id, error = %e, "retry_skipped");
            return false;
        }
        self.counters.retries.fetch_add(1, Ordering::Relaxed);

        tracing::warn!(
            job_id = %job.id,
            stage = %job.stage,
            attempt = job.attempt,
            max_attempts = job.max_attempts(),
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "job_attempt_failed_retrying"
        );

        // Shutdown wins over an already-elapsed backoff
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {
                if let Ok(((), job)) = self.registry.update(&job.id, |j| j.cancel()).await {
                    self.counters.canceled.fetch_add(1, Ordering::Relaxed);
                    self.publish(job_event(events::JOB_CANCELED, &job, Some("kernel shutdown"))).await;
                }
                false
            }
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn finish_success(&self, job_id: &JobId, result: serde_json::Value) {
        match self.registry.update(job_id, |job| job.succeed(result)).await {
            Ok(((), job)) => {
                self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    job_id = %job.id,
                    stage = %job.stage,
                    attempt = job.attempt,
                    duration_ms = job.duration().map(|d| d.as_millis() as u64),
                    "job_succeeded"
                );
                self.publish(job_event(events::JOB_COMPLETED, &job, None)).await;
            }
            // Canceled or timed out while the attempt was in flight
            Err(e) => tracing::debug!(job_id = %job_id, error = %e, "late_result_ignored"),
        }
    }

    async fn finish_failure(&self, job: &Job, err: StageError) {
        let failure = JobFailure {
            message: err.reason().to_string(),
            retryable: err.is_retryable(),
            attempt: job.attempt,
        };
        match self.registry.update(&job.id, |j| j.fail(failure)).await {
            Ok(((), job)) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    job_id = %job.id,
                    stage = %job.stage,
                    attempt = job.attempt,
                    error = %err,
                    "job_failed"
                );
                self.publish(job_event(events::JOB_FAILED, &job, None)).await;
            }
            Err(e) => tracing::debug!(job_id = %job.id, error = %e, "late_failure_ignored"),
        }
    }

    async fn finish_timeout(&self, job_id: &JobId) {
        match self.registry.update(job_id, |job| job.time_out()).await {
            Ok(((), job)) => {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(job_id = %job.id, stage = %job.stage, attempt = job.attempt, "job_timed_out");
                self.publish(job_event(events::JOB_FAILED, &job, None)).await;
            }
            Err(e) => tracing::debug!(job_id = %job_id, error = %e, "timeout_ignored"),
        }
    }

    async fn publish(&self, event: Event) {
        if let Err(e) = self.bus.publish(event).await {
            tracing::warn!(error = %e, "lifecycle_event_publish_failed");
        }
    }
}
