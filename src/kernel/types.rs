//! Kernel types: JobStatus, Priority, Job, and the submission spec.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::types::{Error, JobId, Result, TenantId};

/// Job lifecycle state.
///
/// State transitions:
/// ```text
/// PENDING → QUEUED → RUNNING → {SUCCEEDED | FAILED | TIMEOUT | CANCELED}
///              ↑        │
///              └────────┘  (retry after backoff)
/// ```
/// Any non-terminal state may also move to TIMEOUT or CANCELED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    Timeout,
    Canceled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Timeout,
        JobStatus::Canceled,
    ];

    /// Check if this is a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Timeout | JobStatus::Canceled
        )
    }

    /// Check if transition is valid.
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        match (self, to) {
            // Terminal states are final
            (from, _) if from.is_terminal() => false,
            // Deadline and cancellation apply to every live state
            (_, JobStatus::Timeout) | (_, JobStatus::Canceled) => true,
            (JobStatus::Pending, JobStatus::Queued) => true,
            (JobStatus::Queued, JobStatus::Running) => true,
            (JobStatus::Running, JobStatus::Queued) => true, // Retry
            (JobStatus::Running, JobStatus::Succeeded) => true,
            (JobStatus::Running, JobStatus::Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Timeout => "timeout",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scheduling priority. Advisory only: it orders jobs waiting for an
/// execution slot and nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Realtime,
    Interactive,
    Batch,
    Offline,
}

impl Priority {
    /// Get heap priority value (lower = higher priority).
    pub fn to_heap_value(self) -> i32 {
        match self {
            Priority::Realtime => 0,
            Priority::Interactive => 1,
            Priority::Batch => 2,
            Priority::Offline => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Realtime => "realtime",
            Priority::Interactive => "interactive",
            Priority::Batch => "batch",
            Priority::Offline => "offline",
        }
    }
}

/// Job classification. Used for defaults, filtering and telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    ExperimentStep,
    TrainingStep,
}

impl JobKind {
    pub fn default_priority(self) -> Priority {
        match self {
            JobKind::ExperimentStep => Priority::Interactive,
            JobKind::TrainingStep => Priority::Batch,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobKind::ExperimentStep => "experiment_step",
            JobKind::TrainingStep => "training_step",
        }
    }
}

/// Declared resource requirement. Stored on the job for placement hints;
/// the dispatcher keeps no capacity accounting against it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
}

/// Backoff curve between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    /// Single attempt, no retry.
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffKind::Fixed,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffKind::Exponential,
            base_delay,
            max_delay,
            jitter: false,
        }
    }

    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: BackoffKind::Fixed,
            base_delay: delay,
            max_delay: delay,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::validation("retry_policy.max_attempts must be positive"));
        }
        if self.base_delay > self.max_delay {
            return Err(Error::validation(
                "retry_policy.base_delay exceeds retry_policy.max_delay",
            ));
        }
        Ok(())
    }
}

/// Retry and deadline constraints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    pub retry_policy: RetryPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

/// Terminal stage error preserved on a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub message: String,
    pub retryable: bool,
    pub attempt: u32,
}

/// The unit-of-work record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    // Identity
    pub id: JobId,
    pub kind: JobKind,
    pub tenant_id: TenantId,
    pub namespace: String,
    pub stage: String,

    // Scheduling
    pub priority: Priority,
    pub payload: Value,
    pub resources: ResourceRequest,
    pub constraints: Constraints,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,

    // Mutable state
    pub status: JobStatus,
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobFailure>,

    // Timing
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn max_attempts(&self) -> u32 {
        self.constraints.retry_policy.max_attempts
    }

    pub fn attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts()
    }

    /// True once the job's own deadline has passed.
    pub fn deadline_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.constraints.deadline.is_some_and(|d| now >= d)
    }

    /// Time left until the deadline, `None` when unbounded.
    pub fn time_to_deadline(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.constraints
            .deadline
            .map(|d| (d - now).to_std().unwrap_or(Duration::ZERO))
    }

    /// Wall-clock run time from the first attempt to the terminal outcome.
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => (end - start).to_std().ok(),
            _ => None,
        }
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    fn transition(&mut self, to: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::state_transition(format!(
                "job {}: cannot move from {} to {}",
                self.id, self.status, to
            )));
        }
        self.status = to;
        Ok(())
    }

    /// PENDING/RUNNING → QUEUED.
    pub fn enqueue(&mut self) -> Result<()> {
        self.transition(JobStatus::Queued)
    }

    /// QUEUED → RUNNING, counting the attempt.
    pub fn begin_attempt(&mut self) -> Result<u32> {
        if !self.attempts_remaining() {
            return Err(Error::state_transition(format!(
                "job {}: all {} attempts used",
                self.id,
                self.max_attempts()
            )));
        }
        self.transition(JobStatus::Running)?;
        self.attempt += 1;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
        Ok(self.attempt)
    }

    pub fn succeed(&mut self, result: Value) -> Result<()> {
        self.transition(JobStatus::Succeeded)?;
        self.result = Some(result);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn fail(&mut self, failure: JobFailure) -> Result<()> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(failure);
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn time_out(&mut self) -> Result<()> {
        self.transition(JobStatus::Timeout)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.transition(JobStatus::Canceled)?;
        self.completed_at = Some(Utc::now());
        Ok(())
    }
}

/// Submission input. Turned into a [`Job`] by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub kind: JobKind,
    pub tenant_id: String,
    pub namespace: String,
    pub stage: String,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub resources: ResourceRequest,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl JobSpec {
    /// New spec with the namespace defaulting to the stage name.
    pub fn new(kind: JobKind, tenant_id: impl Into<String>, stage: impl Into<String>) -> Self {
        let stage = stage.into();
        Self {
            kind,
            tenant_id: tenant_id.into(),
            namespace: stage.clone(),
            stage,
            priority: None,
            payload: Value::Null,
            resources: ResourceRequest::default(),
            retry_policy: None,
            timeout: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
