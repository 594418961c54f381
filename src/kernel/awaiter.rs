//! Awaiter - polling completion protocol.
//!
//! Reads the registry at a fixed cadence until the job is terminal or the
//! caller's bound elapses. Never mutates a job.

use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::registry::JobRegistry;
use super::types::{Job, JobStatus};
use crate::types::{Error, JobId, Result};
use crate::validation::validate_positive_duration;

#[derive(Debug, Clone)]
pub struct Awaiter {
    registry: Arc<JobRegistry>,
    default_poll_interval: Duration,
}

impl Awaiter {
    pub fn new(registry: Arc<JobRegistry>, default_poll_interval: Duration) -> Self {
        Self {
            registry,
            default_poll_interval,
        }
    }

    pub fn default_poll_interval(&self) -> Duration {
        self.default_poll_interval
    }

    /// Wait for `id` to finish and return its result.
    ///
    /// - `succeeded` → `Ok(result)`
    /// - `failed` → [`Error::StageFailed`] with the stage's message
    /// - `timeout`, or the job's own deadline already elapsed → [`Error::Timeout`]
    /// - `canceled` → [`Error::Cancelled`]
    /// - still running when `timeout` elapses → [`Error::AwaitTimeout`]
    ///
    /// `poll_interval` of `None` uses the configured default. A `timeout` too
    /// large to represent as an instant (e.g. `Duration::MAX`) waits without
    /// a bound.
    pub async fn await_job(
        &self,
        id: &JobId,
        timeout: Duration,
        poll_interval: Option<Duration>,
    ) -> Result<Value> {
        let poll_interval = poll_interval.unwrap_or(self.default_poll_interval);
        validate_positive_duration(poll_interval, "poll_interval")?;

        let started = Instant::now();
        let give_up = started.checked_add(timeout);

        loop {
            let job = self.registry.get(id).await?;
            if let Some(outcome) = Self::outcome(&job) {
                tracing::debug!(
                    job_id = %id,
                    status = %job.status,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "await_resolved"
                );
                return outcome;
            }

            let nap = match give_up {
                Some(give_up) => {
                    let now = Instant::now();
                    if now >= give_up {
                        return Err(Error::await_timeout(format!(
                            "job {} still {} after {:?}",
                            id, job.status, timeout
                        )));
                    }
                    poll_interval.min(give_up - now)
                }
                None => poll_interval,
            };
            tokio::time::sleep(nap).await;
        }
    }

    /// Terminal outcome for `job`, or `None` while it is still live.
    fn outcome(job: &Job) -> Option<Result<Value>> {
        match job.status {
            JobStatus::Succeeded => Some(Ok(job.result.clone().unwrap_or(Value::Null))),
            JobStatus::Failed => {
                let message = job
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "stage failed".to_string());
                Some(Err(Error::stage_failed(job.id.as_str(), message)))
            }
            JobStatus::Timeout => Some(Err(Error::timeout(format!(
                "job {} exceeded its deadline",
                job.id
            )))),
            JobStatus::Canceled => Some(Err(Error::cancelled(format!("job {} was canceled", job.id)))),
            JobStatus::Pending | JobStatus::Queued | JobStatus::Running => {
                if job.deadline_elapsed(Utc::now()) {
                    Some(Err(Error::timeout(format!(
                        "job {} passed its deadline while {}",
                        job.id, job.status
                    ))))
                } else {
                    None
                }
            }
        }
    }
}
