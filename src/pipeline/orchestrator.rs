//! Orchestrator - runs an experiment's stages as kernel jobs.
//!
//! Sequential mode threads each stage's output into the next stage and halts
//! on the first failure. Parallel mode submits every stage against the same
//! initial context, waits for all of them, and reports every failure.

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::experiment::{Experiment, StageDef};
use super::{PipelineError, StageFailure};
use crate::kernel::awaiter::Awaiter;
use crate::kernel::scheduler::Scheduler;
use crate::kernel::types::{JobKind, JobSpec};
use crate::stage::{StageContext, StageOptions, StagePayload};
use crate::types::{Error, ExperimentId, JobId, Result};

/// How stage jobs are submitted and awaited.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Tenant every stage job is submitted under.
    pub tenant_id: String,
    /// `metadata.source` marker on stage jobs.
    pub source: String,
    /// Upper bound on waiting for a single stage job.
    pub await_timeout: Duration,
    /// Awaiter cadence; `None` uses the kernel default.
    pub poll_interval: Option<Duration>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            tenant_id: "dialectic".to_string(),
            source: "dialectic".to_string(),
            await_timeout: Duration::from_secs(3600),
            poll_interval: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineMode {
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
    Skipped,
    NotRun,
}

/// Per-stage outcome.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
}

impl StageReport {
    fn without_job(name: &str, status: StageStatus) -> Self {
        Self {
            name: name.to_string(),
            job_id: None,
            status,
            output: None,
            error: None,
            duration: None,
        }
    }
}

/// Result of running an experiment. Stage reports are kept even when the
/// run failed.
#[derive(Debug, Serialize)]
pub struct PipelineRun {
    pub experiment_id: ExperimentId,
    pub mode: PipelineMode,
    pub stages: Vec<StageReport>,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    #[serde(skip)]
    pub error: Option<PipelineError>,
}

impl PipelineRun {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn report(&self, stage: &str) -> Option<&StageReport> {
        self.stages.iter().find(|r| r.name == stage)
    }

    pub fn output(&self, stage: &str) -> Option<&Value> {
        self.report(stage).and_then(|r| r.output.as_ref())
    }

    /// Output of the last stage that produced one.
    pub fn final_output(&self) -> Option<&Value> {
        self.stages.iter().rev().find_map(|r| r.output.as_ref())
    }

    pub fn count(&self, status: StageStatus) -> usize {
        self.stages.iter().filter(|r| r.status == status).count()
    }

    pub fn into_result(mut self) -> std::result::Result<Self, PipelineError> {
        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

/// Outcome of one stage job.
struct StageOutcome {
    job_id: Option<JobId>,
    result: Result<Value>,
    duration: Duration,
}

#[derive(Debug, Clone)]
pub struct Orchestrator {
    scheduler: Arc<Scheduler>,
    awaiter: Awaiter,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(scheduler: Arc<Scheduler>, awaiter: Awaiter, settings: OrchestratorSettings) -> Self {
        Self {
            scheduler,
            awaiter,
            settings,
        }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub async fn run(
        &self,
        experiment: &Experiment,
        initial: StageContext,
        mode: PipelineMode,
    ) -> PipelineRun {
        match mode {
            PipelineMode::Sequential => self.run_sequential(experiment, initial).await,
            PipelineMode::Parallel => self.run_parallel(experiment, initial).await,
        }
    }

    /// Run stages in order. Each stage runs against the previous stage's
    /// output; the first failure halts the run.
    pub async fn run_sequential(&self, experiment: &Experiment, initial: StageContext) -> PipelineRun {
        let started = Instant::now();
        tracing::info!(
            experiment_id = %experiment.id(),
            experiment = %experiment.name(),
            stages = experiment.stages().len(),
            "sequential_run_started"
        );

        let mut context = initial;
        let mut upstream_skipped = false;
        let mut reports = Vec::with_capacity(experiment.stages().len());
        let mut error = None;

        for (index, def) in experiment.stages().iter().enumerate() {
            if def.skip || (upstream_skipped && !def.inputs.is_empty()) {
                tracing::info!(experiment_id = %experiment.id(), stage = %def.name, "stage_skipped");
                reports.push(StageReport::without_job(&def.name, StageStatus::Skipped));
                upstream_skipped = true;
                continue;
            }

            let outcome = match bind_inputs(def, &context) {
                Ok(options) => self.run_stage(experiment, def, context.clone(), options).await,
                Err(e) => StageOutcome {
                    job_id: None,
                    result: Err(e),
                    duration: Duration::ZERO,
                },
            };
            let next = outcome
                .result
                .and_then(|value| StageContext::from_value(value.clone()).map(|ctx| (value, ctx)));

            match next {
                Ok((value, next_context)) => {
                    reports.push(StageReport {
                        name: def.name.clone(),
                        job_id: outcome.job_id,
                        status: StageStatus::Succeeded,
                        output: Some(value),
                        error: None,
                        duration: Some(outcome.duration),
                    });
                    context = next_context;
                    upstream_skipped = false;
                }
                Err(e) => {
                    tracing::warn!(
                        experiment_id = %experiment.id(),
                        stage = %def.name,
                        error = %e,
                        "sequential_run_halted"
                    );
                    reports.push(StageReport {
                        name: def.name.clone(),
                        job_id: outcome.job_id,
                        status: StageStatus::Failed,
                        output: None,
                        error: Some(e.to_string()),
                        duration: Some(outcome.duration),
                    });
                    reports.extend(
                        experiment.stages()[index + 1..]
                            .iter()
                            .map(|rest| StageReport::without_job(&rest.name, StageStatus::NotRun)),
                    );
                    error = Some(PipelineError::stage(&def.name, e));
                    break;
                }
            }
        }

        self.finish(experiment, PipelineMode::Sequential, reports, error, started)
    }

    /// Run every non-skipped stage concurrently against `initial` and wait
    /// for all of them. Input bindings do not apply in this mode.
    pub async fn run_parallel(&self, experiment: &Experiment, initial: StageContext) -> PipelineRun {
        let started = Instant::now();
        tracing::info!(
            experiment_id = %experiment.id(),
            experiment = %experiment.name(),
            stages = experiment.stages().len(),
            "parallel_run_started"
        );

        let runs = experiment.stages().iter().map(|def| {
            let context = initial.clone();
            async move {
                if def.skip {
                    return None;
                }
                Some(self.run_stage(experiment, def, context, def.options.clone()).await)
            }
        });
        let outcomes = join_all(runs).await;

        let mut reports = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        for (def, outcome) in experiment.stages().iter().zip(outcomes) {
            let Some(outcome) = outcome else {
                reports.push(StageReport::without_job(&def.name, StageStatus::Skipped));
                continue;
            };
            match outcome.result {
                Ok(value) => reports.push(StageReport {
                    name: def.name.clone(),
                    job_id: outcome.job_id,
                    status: StageStatus::Succeeded,
                    output: Some(value),
                    error: None,
                    duration: Some(outcome.duration),
                }),
                Err(e) => {
                    failures.push(StageFailure::new(
                        &def.name,
                        outcome.job_id.as_ref().map(|id| id.to_string()),
                        &e,
                    ));
                    reports.push(StageReport {
                        name: def.name.clone(),
                        job_id: outcome.job_id,
                        status: StageStatus::Failed,
                        output: None,
                        error: Some(e.to_string()),
                        duration: Some(outcome.duration),
                    });
                }
            }
        }

        let error = (!failures.is_empty()).then(|| PipelineError::Composite(failures));
        self.finish(experiment, PipelineMode::Parallel, reports, error, started)
    }

    /// Submit one stage job and wait for it.
    async fn run_stage(
        &self,
        experiment: &Experiment,
        def: &StageDef,
        context: StageContext,
        options: StageOptions,
    ) -> StageOutcome {
        let started = Instant::now();

        let job_id = match self.submit_stage(experiment, def, context, options).await {
            Ok(id) => id,
            Err(e) => {
                return StageOutcome {
                    job_id: None,
                    result: Err(e),
                    duration: started.elapsed(),
                }
            }
        };
        tracing::debug!(experiment_id = %experiment.id(), stage = %def.name, job_id = %job_id, "stage_job_submitted");

        let result = self
            .awaiter
            .await_job(&job_id, self.settings.await_timeout, self.settings.poll_interval)
            .await;

        // The run gives up on this stage; its job must not finish behind it
        if let Err(Error::AwaitTimeout(_)) = &result {
            match self.scheduler.cancel(&job_id).await {
                Ok(_) => tracing::warn!(
                    experiment_id = %experiment.id(),
                    stage = %def.name,
                    job_id = %job_id,
                    "stage_job_abandoned"
                ),
                Err(e) => tracing::debug!(job_id = %job_id, error = %e, "stage_job_cancel_skipped"),
            }
        }

        StageOutcome {
            job_id: Some(job_id),
            result,
            duration: started.elapsed(),
        }
    }

    async fn submit_stage(
        &self,
        experiment: &Experiment,
        def: &StageDef,
        context: StageContext,
        options: StageOptions,
    ) -> Result<JobId> {
        let payload = StagePayload::new(context, options).to_value()?;

        let mut spec = JobSpec::new(JobKind::ExperimentStep, &self.settings.tenant_id, &def.stage)
            .with_namespace(&def.name)
            .with_payload(payload)
            .with_resources(def.resources.clone())
            .with_metadata("source", self.settings.source.as_str())
            .with_metadata("experiment_id", experiment.id().as_str())
            .with_metadata("stage_name", def.name.as_str());
        if let Some(priority) = def.priority {
            spec = spec.with_priority(priority);
        }
        if let Some(timeout) = def.timeout {
            spec = spec.with_timeout(timeout);
        }
        if let Some(policy) = &def.retry_policy {
            spec = spec.with_retry_policy(policy.clone());
        }

        self.scheduler.submit(spec).await
    }

    fn finish(
        &self,
        experiment: &Experiment,
        mode: PipelineMode,
        stages: Vec<StageReport>,
        error: Option<PipelineError>,
        started: Instant,
    ) -> PipelineRun {
        let run = PipelineRun {
            experiment_id: experiment.id().clone(),
            mode,
            stages,
            duration: started.elapsed(),
            error,
        };
        tracing::info!(
            experiment_id = %run.experiment_id,
            mode = ?run.mode,
            succeeded = run.count(StageStatus::Succeeded),
            failed = run.count(StageStatus::Failed),
            skipped = run.count(StageStatus::Skipped),
            duration_ms = run.duration.as_millis() as u64,
            "pipeline_run_finished"
        );
        run
    }
}

/// Options for `def`: its static options plus every bound input resolved
/// against the previous context.
fn bind_inputs(def: &StageDef, previous: &StageContext) -> Result<StageOptions> {
    let mut options = def.options.clone();
    if def.inputs.is_empty() {
        return Ok(options);
    }

    let output = previous.clone().into_value();
    for binding in &def.inputs {
        let value = binding.resolve(&output).ok_or_else(|| {
            Error::validation(format!(
                "stage '{}' input '{}' not found in previous output",
                def.name, binding.from
            ))
        })?;
        options.insert(binding.into.clone(), value.clone());
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bind_inputs_injects_values() {
        let def = StageDef::new("challenger")
            .with_option("temperature", 0.2)
            .with_input("proposals", "claims");
        let previous = StageContext::new().with("proposals", json!(["a", "b"]));

        let options = bind_inputs(&def, &previous).unwrap();
        assert_eq!(options["claims"], json!(["a", "b"]));
        assert_eq!(options["temperature"], 0.2);
    }

    #[test]
    fn test_bind_inputs_missing_field_names_stage() {
        let def = StageDef::new("synthesizer").with_input("critiques", "critiques");
        let err = bind_inputs(&def, &StageContext::new()).unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("synthesizer"));
        assert!(err.to_string().contains("critiques"));
    }

    #[test]
    fn test_pipeline_run_accessors() {
        let run = PipelineRun {
            experiment_id: ExperimentId::new(),
            mode: PipelineMode::Sequential,
            stages: vec![
                StageReport {
                    name: "proposer".into(),
                    job_id: None,
                    status: StageStatus::Succeeded,
                    output: Some(json!({"n": 1})),
                    error: None,
                    duration: None,
                },
                StageReport::without_job("challenger", StageStatus::Skipped),
            ],
            duration: Duration::from_millis(5),
            error: None,
        };

        assert!(run.is_success());
        assert_eq!(run.final_output(), Some(&json!({"n": 1})));
        assert_eq!(run.count(StageStatus::Skipped), 1);
        assert!(run.output("challenger").is_none());
        assert!(run.into_result().is_ok());
    }
}
