//! Scheduler - job submission, admission and dispatch.
//!
//! `submit` validates a [`JobSpec`], records the job as `pending`, publishes
//! `job.submitted` and hands the id to the dispatcher task without waiting for
//! execution. The dispatcher marks admitted jobs `queued`, orders them by
//! priority then submission time, and spawns one executor task per job as
//! execution slots free up.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::executor::{Counters, Executor, SchedulerStats};
use super::registry::{JobRegistry, ListFilter};
use super::types::{Constraints, Job, JobKind, JobSpec, JobStatus, RetryPolicy};
use crate::commbus::{CommBus, Event};
use crate::events::{self, job_event};
use crate::stage::{StagePayload, StageRegistry};
use crate::types::{DispatchConfig, Error, JobId, Result, TenantId};
use crate::validation::{validate_non_empty, validate_positive, validate_positive_duration};

/// Entry in the dispatcher's wait queue.
#[derive(Debug, Clone, PartialEq, Eq)]
struct PriorityItem {
    id: JobId,
    priority: i32,             // Lower = higher priority
    created_at: DateTime<Utc>, // FIFO within same priority
}

impl Ord for PriorityItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is max-heap, so reverse both keys
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
    }
}

impl PartialOrd for PriorityItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Job scheduler. Owns the dispatcher task; shared behind an `Arc`.
#[derive(Debug)]
pub struct Scheduler {
    config: DispatchConfig,
    registry: Arc<JobRegistry>,
    stages: Arc<StageRegistry>,
    bus: Arc<CommBus>,
    counters: Arc<Counters>,
    submit_tx: mpsc::UnboundedSender<PriorityItem>,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Build the scheduler and spawn its dispatcher. Must be called from
    /// within a Tokio runtime.
    pub fn start(
        config: DispatchConfig,
        registry: Arc<JobRegistry>,
        stages: Arc<StageRegistry>,
        bus: Arc<CommBus>,
    ) -> Result<Arc<Self>> {
        validate_positive(config.max_concurrent_jobs as u64, "max_concurrent_jobs")?;

        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(Counters::default());
        let shutdown = CancellationToken::new();

        let executor = Executor {
            registry: registry.clone(),
            stages: stages.clone(),
            bus: bus.clone(),
            counters: counters.clone(),
            shutdown: shutdown.clone(),
        };
        let dispatcher = Dispatcher {
            rx: submit_rx,
            queue: BinaryHeap::new(),
            slots: Arc::new(Semaphore::new(config.max_concurrent_jobs)),
            executor,
        };
        let handle = tokio::spawn(dispatcher.run());

        tracing::info!(
            max_concurrent_jobs = config.max_concurrent_jobs,
            stages = stages.len(),
            "scheduler_started"
        );

        Ok(Arc::new(Self {
            config,
            registry,
            stages,
            bus,
            counters,
            submit_tx,
            shutdown,
            dispatcher: Mutex::new(Some(handle)),
        }))
    }

    /// Submit a job. Returns as soon as the job is recorded.
    pub async fn submit(&self, spec: JobSpec) -> Result<JobId> {
        if self.shutdown.is_cancelled() || self.submit_tx.is_closed() {
            return Err(Error::cancelled("scheduler is shut down"));
        }

        let job = self.build_job(spec)?;
        let id = job.id.clone();
        let item = PriorityItem {
            id: id.clone(),
            priority: job.priority.to_heap_value(),
            created_at: job.created_at,
        };

        self.registry.insert(job.clone()).await?;

        tracing::info!(
            job_id = %id,
            tenant_id = %job.tenant_id,
            stage = %job.stage,
            kind = job.kind.as_str(),
            priority = job.priority.as_str(),
            "job_submitted"
        );
        self.publish(job_event(events::JOB_SUBMITTED, &job, None)).await;

        if self.submit_tx.send(item).is_err() {
            // Dispatcher is gone; nothing will ever run this job.
            self.withdraw(&id).await;
            return Err(Error::cancelled("scheduler is shut down"));
        }
        self.counters.submitted.fetch_add(1, AtomicOrdering::Relaxed);

        Ok(id)
    }

    /// Take back a job the dispatcher never received: close it out with
    /// `job.canceled`, then drop it from the registry.
    async fn withdraw(&self, id: &JobId) {
        match self.registry.update(id, |j| j.cancel()).await {
            Ok(((), job)) => {
                self.publish(job_event(events::JOB_CANCELED, &job, Some("scheduler is shut down")))
                    .await;
            }
            Err(e) => tracing::warn!(job_id = %id, error = %e, "withdraw_cancel_failed"),
        }
        if let Err(e) = self.registry.remove(id).await {
            tracing::warn!(job_id = %id, error = %e, "withdraw_remove_failed");
        }
        tracing::warn!(job_id = %id, "job_withdrawn_dispatcher_closed");
    }

    /// Validate a spec and turn it into a `pending` job.
    fn build_job(&self, spec: JobSpec) -> Result<Job> {
        validate_non_empty(&spec.tenant_id, "tenant_id")?;
        validate_non_empty(&spec.namespace, "namespace")?;
        validate_non_empty(&spec.stage, "stage")?;

        if !self.config.tenants.is_empty() && !self.config.tenants.contains(&spec.tenant_id) {
            return Err(Error::validation(format!(
                "tenant not accepted: {}",
                spec.tenant_id
            )));
        }

        let stage = self
            .stages
            .get(&spec.stage)
            .map_err(|_| Error::validation(format!("unknown stage: {}", spec.stage)))?;

        let mut payload = StagePayload::from_value(&spec.payload)?;
        let schema = stage.describe(&payload.options);
        schema.validate(&payload.options)?;
        schema.apply_defaults(&mut payload.options);

        let resources = spec.resources;
        if let Some(cpus) = resources.cpus {
            validate_positive(u64::from(cpus), "resources.cpus")?;
        }
        if let Some(memory_mb) = resources.memory_mb {
            validate_positive(memory_mb, "resources.memory_mb")?;
        }
        if let Some(accelerator) = &resources.accelerator {
            validate_non_empty(accelerator, "resources.accelerator")?;
        }

        let retry_policy = spec
            .retry_policy
            .unwrap_or_else(|| self.default_retry_policy(spec.kind));
        retry_policy.validate()?;

        let now = Utc::now();
        let deadline = match spec.timeout {
            Some(timeout) => {
                validate_positive_duration(timeout, "timeout")?;
                let timeout = chrono::Duration::from_std(timeout)
                    .map_err(|e| Error::validation(format!("timeout out of range: {}", e)))?;
                Some(now + timeout)
            }
            None => None,
        };

        let tenant_id = TenantId::from_string(spec.tenant_id).map_err(Error::validation)?;

        Ok(Job {
            id: JobId::new(),
            kind: spec.kind,
            tenant_id,
            namespace: spec.namespace,
            stage: spec.stage,
            priority: spec.priority.unwrap_or_else(|| spec.kind.default_priority()),
            payload: payload.to_value()?,
            resources,
            constraints: Constraints {
                retry_policy,
                deadline,
            },
            metadata: spec.metadata,
            status: JobStatus::Pending,
            attempt: 0,
            result: None,
            error: None,
            created_at: now,
            started_at: None,
            completed_at: None,
        })
    }

    fn default_retry_policy(&self, kind: JobKind) -> RetryPolicy {
        match kind {
            JobKind::ExperimentStep => RetryPolicy::once(),
            JobKind::TrainingStep => RetryPolicy::exponential(
                self.config.training_max_attempts,
                self.config.default_base_delay,
                self.config.default_max_delay,
            ),
        }
    }

    /// Snapshot of a job.
    pub async fn get(&self, id: &JobId) -> Result<Job> {
        self.registry.get(id).await
    }

    /// A tenant's jobs matching `filter`, oldest first.
    pub async fn list(&self, tenant_id: &TenantId, filter: &ListFilter) -> Vec<Job> {
        self.registry.list(tenant_id, filter).await
    }

    /// Cancel a live job. A running attempt is not interrupted; its result is
    /// discarded when it arrives.
    pub async fn cancel(&self, id: &JobId) -> Result<Job> {
        let ((), job) = self.registry.update(id, |job| job.cancel()).await?;
        self.counters.canceled.fetch_add(1, AtomicOrdering::Relaxed);
        tracing::info!(job_id = %id, stage = %job.stage, "job_canceled");
        self.publish(job_event(events::JOB_CANCELED, &job, Some("canceled by caller")))
            .await;
        Ok(job)
    }

    pub fn stats(&self) -> SchedulerStats {
        self.counters.snapshot(self.config.max_concurrent_jobs)
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop admitting work. Jobs still waiting for a slot, or sleeping
    /// between attempts, are canceled. Attempts already running finish.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let handle = self.dispatcher.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "dispatcher_join_failed");
            }
        }
        tracing::info!("scheduler_stopped");
    }

    async fn publish(&self, event: Event) {
        if let Err(e) = self.bus.publish(event).await {
            tracing::warn!(error = %e, "lifecycle_event_publish_failed");
        }
    }
}

enum Wake {
    Stop,
    Submitted(Option<PriorityItem>),
    Slot(OwnedSemaphorePermit),
}

/// Dispatcher task state.
struct Dispatcher {
    rx: mpsc::UnboundedReceiver<PriorityItem>,
    queue: BinaryHeap<PriorityItem>,
    slots: Arc<Semaphore>,
    executor: Executor,
}

impl Dispatcher {
    async fn run(mut self) {
        let shutdown = self.executor.shutdown.clone();

        loop {
            let wake = if self.queue.is_empty() {
                tokio::select! {
                    _ = shutdown.cancelled() => Wake::Stop,
                    item = self.rx.recv() => Wake::Submitted(item),
                }
            } else {
                let slots = self.slots.clone();
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => Wake::Stop,
                    item = self.rx.recv() => Wake::Submitted(item),
                    permit = slots.acquire_owned() => match permit {
                        Ok(permit) => Wake::Slot(permit),
                        Err(_) => Wake::Stop,
                    },
                }
            };

            match wake {
                Wake::Stop | Wake::Submitted(None) => break,
                Wake::Submitted(Some(item)) => self.admit(item).await,
                Wake::Slot(permit) => {
                    let Some(next) = self.queue.pop() else { continue };
                    self.set_waiting();

                    let executor = self.executor.clone();
                    tokio::spawn(async move {
                        executor.run(next.id).await;
                        drop(permit);
                    });
                }
            }
        }

        self.drain().await;
        tracing::debug!("dispatcher_stopped");
    }

    /// PENDING → QUEUED, then wait for a slot.
    async fn admit(&mut self, item: PriorityItem) {
        match self
            .executor
            .registry
            .update(&item.id, |job| job.enqueue())
            .await
        {
            Ok(_) => {
                tracing::debug!(job_id = %item.id, priority = item.priority, "job_queued");
                self.queue.push(item);
                self.set_waiting();
            }
            // Canceled before admission
            Err(e) => tracing::debug!(job_id = %item.id, error = %e, "job_not_admitted"),
        }
    }

    /// Cancel everything that never got a slot.
    async fn drain(&mut self) {
        self.rx.close();
        while let Ok(item) = self.rx.try_recv() {
            self.queue.push(item);
        }

        while let Some(item) = self.queue.pop() {
            if let Ok(((), job)) = self
                .executor
                .registry
                .update(&item.id, |job| job.cancel())
                .await
            {
                self.executor
                    .counters
                    .canceled
                    .fetch_add(1, AtomicOrdering::Relaxed);
                let event = job_event(events::JOB_CANCELED, &job, Some("kernel shutdown"));
                if let Err(e) = self.executor.bus.publish(event).await {
                    tracing::warn!(error = %e, "lifecycle_event_publish_failed");
                }
            }
        }
        self.set_waiting();
    }

    fn set_waiting(&self) {
        self.executor
            .counters
            .waiting
            .store(self.queue.len(), AtomicOrdering::Relaxed);
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queued", &self.queue.len())
            .field("available_slots", &self.slots.available_permits())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::types::{Priority, ResourceRequest};
    use crate::stage::{FieldType, FnStage, StageContext, StageError, StageSchema};
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn stages() -> Arc<StageRegistry> {
        let echo = FnStage::new("proposer", |ctx: StageContext, _opts| async move { Ok(ctx) })
            .with_schema(
                StageSchema::new("proposer", "echo").optional(
                    "samples",
                    FieldType::Int,
                    Some(json!(4)),
                ),
            );
        let strict = FnStage::new("challenger", |ctx: StageContext, _opts| async move { Ok(ctx) })
            .with_schema(StageSchema::new("challenger", "").required("model", FieldType::String));
        let flaky = FnStage::new("flaky", |_ctx: StageContext, _opts| async move {
            Err(StageError::retryable("transient"))
        });
        Arc::new(
            StageRegistry::new()
                .with(echo)
                .unwrap()
                .with(strict)
                .unwrap()
                .with(flaky)
                .unwrap(),
        )
    }

    fn scheduler(config: DispatchConfig) -> Arc<Scheduler> {
        Scheduler::start(
            config,
            Arc::new(JobRegistry::new()),
            stages(),
            Arc::new(CommBus::new()),
        )
        .unwrap()
    }

    fn spec(stage: &str) -> JobSpec {
        JobSpec::new(JobKind::ExperimentStep, "lab", stage)
    }

    #[test]
    fn test_priority_item_ordering() {
        let now = Utc::now();
        let mut heap = BinaryHeap::new();
        let later = now + chrono::Duration::seconds(1);
        let batch = PriorityItem { id: JobId::new(), priority: 2, created_at: now };
        let first = PriorityItem { id: JobId::new(), priority: 1, created_at: now };
        let second = PriorityItem { id: JobId::new(), priority: 1, created_at: later };
        heap.push(batch.clone());
        heap.push(second.clone());
        heap.push(first.clone());

        assert_eq!(heap.pop().unwrap(), first);
        assert_eq!(heap.pop().unwrap(), second);
        assert_eq!(heap.pop().unwrap(), batch);
    }

    #[tokio::test]
    async fn test_submit_applies_defaults() {
        let sched = scheduler(DispatchConfig::default());

        let id = sched.submit(spec("proposer")).await.unwrap();
        let job = sched.get(&id).await.unwrap();

        assert_eq!(job.priority, Priority::Interactive);
        assert_eq!(job.max_attempts(), 1);
        assert!(job.constraints.deadline.is_none());
        assert_eq!(job.namespace, "proposer");
        assert_eq!(job.payload["options"]["samples"], 4);
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn test_training_step_defaults() {
        let config = DispatchConfig {
            training_max_attempts: 5,
            ..DispatchConfig::default()
        };
        let sched = scheduler(config);

        let id = sched
            .submit(JobSpec::new(JobKind::TrainingStep, "lab", "proposer"))
            .await
            .unwrap();
        let job = sched.get(&id).await.unwrap();

        assert_eq!(job.priority, Priority::Batch);
        assert_eq!(job.max_attempts(), 5);
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn test_timeout_sets_deadline() {
        let sched = scheduler(DispatchConfig::default());
        let before = Utc::now();

        let id = sched
            .submit(spec("proposer").with_timeout(Duration::from_secs(30)))
            .await
            .unwrap();
        let deadline = sched.get(&id).await.unwrap().constraints.deadline.unwrap();

        assert!(deadline >= before + chrono::Duration::seconds(30));
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn test_validation_errors_create_nothing() {
        let config = DispatchConfig {
            tenants: vec!["lab".to_string()],
            ..DispatchConfig::default()
        };
        let sched = scheduler(config);

        let bad = vec![
            spec("proposer").with_namespace(""),
            JobSpec::new(JobKind::ExperimentStep, "", "proposer"),
            JobSpec::new(JobKind::ExperimentStep, "intruder", "proposer"),
            spec("no-such-stage"),
            spec("proposer").with_payload(json!([1, 2])),
            spec("challenger"),
            spec("challenger").with_payload(json!({"options": {"model": 7}})),
            spec("proposer").with_resources(ResourceRequest {
                cpus: Some(0),
                ..ResourceRequest::default()
            }),
            spec("proposer").with_resources(ResourceRequest {
                memory_mb: Some(0),
                ..ResourceRequest::default()
            }),
            spec("proposer").with_resources(ResourceRequest {
                accelerator: Some(" ".to_string()),
                ..ResourceRequest::default()
            }),
            spec("proposer").with_retry_policy(RetryPolicy::fixed(0, Duration::ZERO)),
            spec("proposer").with_retry_policy(RetryPolicy::exponential(
                3,
                Duration::from_secs(10),
                Duration::from_secs(1),
            )),
            spec("proposer").with_timeout(Duration::ZERO),
        ];

        for bad_spec in bad {
            let err = sched.submit(bad_spec).await.unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "unexpected: {err}");
        }

        assert_eq!(sched.registry().count().await, 0);
        assert_eq!(sched.stats().submitted, 0);
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_rejected() {
        let sched = scheduler(DispatchConfig::default());
        sched.shutdown().await;

        assert!(sched.is_shut_down());
        let err = sched.submit(spec("proposer")).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_submit_without_dispatcher_creates_nothing() {
        let sched = scheduler(DispatchConfig::default());
        let (_sub, mut rx) = sched
            .bus
            .subscribe("watcher", vec![events::JOB_SUBMITTED.to_string()])
            .await
            .unwrap();

        let handle = sched.dispatcher.lock().await.take().unwrap();
        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        let err = sched.submit(spec("proposer")).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
        assert_eq!(sched.registry().count().await, 0);
        assert_eq!(sched.stats().submitted, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_withdraw_pairs_submitted_with_canceled() {
        let sched = scheduler(DispatchConfig::default());
        let (_sub, mut rx) = sched
            .bus
            .subscribe("watcher", vec![events::JOB_CANCELED.to_string()])
            .await
            .unwrap();

        let job = sched.build_job(spec("proposer")).unwrap();
        let id = job.id.clone();
        sched.registry().insert(job).await.unwrap();

        sched.withdraw(&id).await;

        assert!(matches!(sched.get(&id).await, Err(Error::NotFound(_))));
        let event = rx.try_recv().unwrap();
        assert_eq!(event.payload["job_id"], json!(id.as_str()));
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_terminal_job_rejected() {
        let sched = scheduler(DispatchConfig::default());
        let id = sched.submit(spec("proposer")).await.unwrap();

        let canceled = sched.cancel(&id).await;
        // The job may already have succeeded; either way a second cancel fails.
        if let Ok(job) = canceled {
            assert_eq!(job.status, JobStatus::Canceled);
        }
        let err = sched.cancel(&id).await.unwrap_err();
        assert!(matches!(err, Error::StateTransition(_)));
        sched.shutdown().await;
    }

    #[tokio::test]
    async fn test_zero_slots_rejected() {
        let config = DispatchConfig {
            max_concurrent_jobs: 0,
            ..DispatchConfig::default()
        };
        let err = Scheduler::start(
            config,
            Arc::new(JobRegistry::new()),
            stages(),
            Arc::new(CommBus::new()),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_shutdown_beats_zero_backoff() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let calls = Arc::new(AtomicU32::new(0));
        let gated = {
            let gate = gate.clone();
            let calls = calls.clone();
            FnStage::new("gated", move |_ctx: StageContext, _opts| {
                let gate = gate.clone();
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, AtomicOrdering::SeqCst);
                    gate.notified().await;
                    Err(StageError::retryable("transient"))
                }
            })
        };
        let sched = Scheduler::start(
            DispatchConfig::default(),
            Arc::new(JobRegistry::new()),
            Arc::new(StageRegistry::new().with(gated).unwrap()),
            Arc::new(CommBus::new()),
        )
        .unwrap();

        let id = sched
            .submit(spec("gated").with_retry_policy(RetryPolicy::fixed(5, Duration::ZERO)))
            .await
            .unwrap();
        for _ in 0..100 {
            if sched.get(&id).await.unwrap().status == JobStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // The attempt fails after shutdown; its zero-length backoff is ready at once
        sched.shutdown().await;
        gate.notify_one();

        for _ in 0..100 {
            if sched.get(&id).await.unwrap().is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let job = sched.get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
        assert_eq!(job.attempt, 1);
        assert_eq!(calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_backoff() {
        let sched = scheduler(DispatchConfig::default());
        let id = sched
            .submit(spec("flaky").with_retry_policy(RetryPolicy::fixed(5, Duration::from_secs(60))))
            .await
            .unwrap();

        // Wait for the first attempt to fail and the job to go back to queued
        for _ in 0..100 {
            let job = sched.get(&id).await.unwrap();
            if job.attempt == 1 && job.status == JobStatus::Queued {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        sched.shutdown().await;
        for _ in 0..100 {
            if sched.get(&id).await.unwrap().is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let job = sched.get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
        assert_eq!(job.attempt, 1);
    }
}
