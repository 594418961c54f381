//! Experiment pipelines.
//!
//! An [`Experiment`] is an ordered list of [`StageDef`]s. The [`Orchestrator`]
//! runs it either sequentially, threading each stage's output into the next,
//! or in parallel against one shared initial context. Every stage run is a
//! kernel job, so stages inherit the scheduler's retry and deadline handling.

pub mod experiment;
pub mod orchestrator;

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::types::Error;

pub use experiment::{Experiment, ExperimentBuilder, InputBinding, StageDef};
pub use orchestrator::{
    Orchestrator, OrchestratorSettings, PipelineMode, PipelineRun, StageReport, StageStatus,
};

/// One failed stage of a parallel run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// [`Error::code`] of the underlying error.
    pub code: String,
    pub message: String,
}

impl StageFailure {
    pub fn new(stage: impl Into<String>, job_id: Option<String>, error: &Error) -> Self {
        Self {
            stage: stage.into(),
            job_id,
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.stage, self.message)
    }
}

/// Pipeline failure.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Sequential run halted at `stage`.
    #[error("stage '{stage}' failed: {source}")]
    Stage {
        stage: String,
        #[source]
        source: Box<Error>,
    },

    /// Parallel run with one or more failed stages.
    #[error("{} stage(s) failed: {}", .0.len(), join_failures(.0))]
    Composite(Vec<StageFailure>),
}

impl PipelineError {
    pub fn stage(stage: impl Into<String>, source: Error) -> Self {
        Self::Stage {
            stage: stage.into(),
            source: Box::new(source),
        }
    }

    /// Names of the failed stages.
    pub fn failed_stages(&self) -> Vec<&str> {
        match self {
            PipelineError::Stage { stage, .. } => vec![stage.as_str()],
            PipelineError::Composite(failures) => failures.iter().map(|f| f.stage.as_str()).collect(),
        }
    }
}

fn join_failures(failures: &[StageFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_error_display_names_stage() {
        let err = PipelineError::stage("challenger", Error::timeout("job j1 exceeded its deadline"));
        assert_eq!(err.failed_stages(), vec!["challenger"]);
        assert!(err.to_string().starts_with("stage 'challenger' failed"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_composite_lists_every_failure() {
        let err = PipelineError::Composite(vec![
            StageFailure::new("proposer", None, &Error::validation("bad options")),
            StageFailure::new("synthesizer", Some("j3".into()), &Error::stage_failed("j3", "boom")),
        ]);

        assert_eq!(err.failed_stages(), vec!["proposer", "synthesizer"]);
        let text = err.to_string();
        assert!(text.starts_with("2 stage(s) failed"));
        assert!(text.contains("synthesizer: stage failed (job j3): boom"));
    }

    #[test]
    fn test_failure_keeps_error_code() {
        let failure = StageFailure::new("proposer", None, &Error::cancelled("job j1 was canceled"));
        assert_eq!(failure.code, "cancelled");
    }

    #[test]
    fn test_converts_into_crate_error() {
        let err: Error = PipelineError::Composite(vec![]).into();
        assert_eq!(err.code(), "pipeline");
    }
}
