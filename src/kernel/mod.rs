//! Kernel - owns the job registry, event bus, stages and scheduler.
//!
//! `Kernel::start` wires the subsystems together, spawns the dispatcher and
//! the job reaper, and attaches the telemetry bridge. Subsystems are shared
//! through `Arc` handles, not a global.

pub mod awaiter;
pub mod cleanup;
mod executor;
pub mod recovery;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod types;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::commbus::CommBus;
use crate::events::TelemetryBridge;
use crate::pipeline::{Orchestrator, OrchestratorSettings};
use crate::stage::StageRegistry;
use crate::types::{Config, JobId, Result, TenantId};

pub use awaiter::Awaiter;
pub use cleanup::{CleanupStats, JobReaper};
pub use executor::SchedulerStats;
pub use registry::{JobRegistry, ListFilter, RegistryStats};
pub use scheduler::Scheduler;
pub use types::{
    BackoffKind, Constraints, Job, JobFailure, JobKind, JobSpec, JobStatus, Priority,
    ResourceRequest, RetryPolicy,
};

/// Combined kernel statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelStats {
    pub scheduler: SchedulerStats,
    pub registry: RegistryStats,
}

#[derive(Debug)]
pub struct Kernel {
    config: Config,
    registry: Arc<JobRegistry>,
    bus: Arc<CommBus>,
    stages: Arc<StageRegistry>,
    scheduler: Arc<Scheduler>,
    awaiter: Awaiter,
    telemetry: TelemetryBridge,
    reaper: Mutex<JobReaper>,
}

impl Kernel {
    /// Validate `config` and start every subsystem. Must be called from
    /// within a Tokio runtime.
    pub async fn start(config: Config, stages: StageRegistry) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(JobRegistry::new());
        let bus = Arc::new(CommBus::new());
        let stages = Arc::new(stages);

        let scheduler = Scheduler::start(
            config.dispatch.clone(),
            registry.clone(),
            stages.clone(),
            bus.clone(),
        )?;
        let awaiter = Awaiter::new(registry.clone(), config.dispatch.poll_interval);

        let telemetry = TelemetryBridge::new(bus.clone(), config.telemetry.clone());
        telemetry.attach().await?;

        let mut reaper = JobReaper::new(registry.clone(), config.cleanup.clone());
        reaper.start();

        tracing::info!(
            stages = ?stages.names(),
            max_concurrent_jobs = config.dispatch.max_concurrent_jobs,
            "kernel_started"
        );

        Ok(Self {
            config,
            registry,
            bus,
            stages,
            scheduler,
            awaiter,
            telemetry,
            reaper: Mutex::new(reaper),
        })
    }

    // =========================================================================
    // Jobs
    // =========================================================================

    pub async fn submit(&self, spec: JobSpec) -> Result<JobId> {
        self.scheduler.submit(spec).await
    }

    pub async fn get(&self, id: &JobId) -> Result<Job> {
        self.scheduler.get(id).await
    }

    pub async fn list(&self, tenant_id: &TenantId, filter: &ListFilter) -> Vec<Job> {
        self.scheduler.list(tenant_id, filter).await
    }

    pub async fn cancel(&self, id: &JobId) -> Result<Job> {
        self.scheduler.cancel(id).await
    }

    /// Wait for a job's result. `poll_interval` of `None` uses
    /// `dispatch.poll_interval`.
    pub async fn await_job(
        &self,
        id: &JobId,
        timeout: Duration,
        poll_interval: Option<Duration>,
    ) -> Result<Value> {
        self.awaiter.await_job(id, timeout, poll_interval).await
    }

    pub async fn stats(&self) -> KernelStats {
        KernelStats {
            scheduler: self.scheduler.stats(),
            registry: self.registry.stats().await,
        }
    }

    // =========================================================================
    // Pipelines
    // =========================================================================

    /// Orchestrator submitting stage jobs to this kernel.
    pub fn orchestrator(&self, mut settings: OrchestratorSettings) -> Orchestrator {
        if settings.source.is_empty() {
            settings.source = self.config.telemetry.source.clone();
        }
        Orchestrator::new(self.scheduler.clone(), self.awaiter.clone(), settings)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<CommBus> {
        &self.bus
    }

    pub fn stages(&self) -> &Arc<StageRegistry> {
        &self.stages
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn awaiter(&self) -> &Awaiter {
        &self.awaiter
    }

    pub fn telemetry_bridge(&self) -> &TelemetryBridge {
        &self.telemetry
    }

    /// Stop the scheduler, the reaper and every telemetry handler.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        self.reaper.lock().await.stop();
        self.telemetry.detach_all().await;
        tracing::info!("kernel_stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{FnStage, StageContext};

    fn stages() -> StageRegistry {
        StageRegistry::new()
            .with(FnStage::new("proposer", |ctx: StageContext, _opts| async move {
                Ok(ctx.with("proposals", serde_json::json!(["p1"])))
            }))
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_submit_await_shutdown() {
        let kernel = Kernel::start(Config::default(), stages()).await.unwrap();
        assert!(kernel.telemetry_bridge().is_attached("dialectic-telemetry").await);

        let id = kernel
            .submit(JobSpec::new(JobKind::ExperimentStep, "lab", "proposer"))
            .await
            .unwrap();
        let result = kernel
            .await_job(&id, Duration::from_secs(5), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(result["proposals"][0], "p1");

        let stats = kernel.stats().await;
        assert_eq!(stats.scheduler.submitted, 1);
        assert_eq!(stats.scheduler.succeeded, 1);
        assert_eq!(stats.registry.count(JobStatus::Succeeded), 1);

        kernel.shutdown().await;
        assert!(kernel.scheduler().is_shut_down());
        assert!(!kernel.telemetry_bridge().is_attached("dialectic-telemetry").await);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = Config::default();
        config.dispatch.max_concurrent_jobs = 0;
        assert!(Kernel::start(config, stages()).await.is_err());
    }

    #[tokio::test]
    async fn test_orchestrator_inherits_source_marker() {
        let kernel = Kernel::start(Config::default(), stages()).await.unwrap();
        let orchestrator = kernel.orchestrator(OrchestratorSettings {
            source: String::new(),
            ..OrchestratorSettings::default()
        });
        assert_eq!(orchestrator.settings().source, "dialectic");
        kernel.shutdown().await;
    }
}
