//! Experiment definition: an ordered, immutable list of stage definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::time::Duration;

use crate::kernel::types::{Priority, ResourceRequest, RetryPolicy};
use crate::stage::StageOptions;
use crate::types::{Error, ExperimentId, Result};
use crate::validation::validate_non_empty;

/// Stages wired by [`Experiment::dialectic`].
pub const DIALECTIC_STAGES: [&str; 3] = ["proposer", "challenger", "synthesizer"];

/// Injects a field of the previous stage's output as an option.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputBinding {
    /// `/`-separated path into the previous output, e.g. `proposals` or
    /// `summary/best`.
    pub from: String,
    /// Option key the value is injected under.
    pub into: String,
}

impl InputBinding {
    pub fn new(from: impl Into<String>, into: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            into: into.into(),
        }
    }

    /// Look the bound field up in `output`.
    pub fn resolve<'a>(&self, output: &'a Value) -> Option<&'a Value> {
        if self.from.starts_with('/') {
            output.pointer(&self.from)
        } else {
            output.pointer(&format!("/{}", self.from))
        }
    }
}

/// One stage of an experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDef {
    /// Unique name within the experiment. Also the job namespace.
    pub name: String,
    /// Registered stage to run.
    pub stage: String,
    #[serde(default)]
    pub options: StageOptions,
    #[serde(default)]
    pub skip: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<InputBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub resources: ResourceRequest,
}

impl StageDef {
    /// Stage definition running the registered stage of the same name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            stage: name.clone(),
            name,
            options: StageOptions::new(),
            skip: false,
            inputs: Vec::new(),
            priority: None,
            timeout: None,
            retry_policy: None,
            resources: ResourceRequest::default(),
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = stage.into();
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn skipped(mut self) -> Self {
        self.skip = true;
        self
    }

    pub fn with_input(mut self, from: impl Into<String>, into: impl Into<String>) -> Self {
        self.inputs.push(InputBinding::new(from, into));
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_resources(mut self, resources: ResourceRequest) -> Self {
        self.resources = resources;
        self
    }
}

/// Experiment definition. Immutable once built; deserialized definitions
/// go through the same validation as [`ExperimentBuilder::build`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "ExperimentRecord")]
pub struct Experiment {
    id: ExperimentId,
    name: String,
    version: u32,
    tags: Vec<String>,
    owner: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    stages: Vec<StageDef>,
}

impl Experiment {
    pub fn builder(name: impl Into<String>) -> ExperimentBuilder {
        ExperimentBuilder::new(name)
    }

    /// The default proposer → challenger → synthesizer experiment.
    pub fn dialectic(name: impl Into<String>) -> Result<Self> {
        DIALECTIC_STAGES
            .iter()
            .fold(Self::builder(name), |b, stage| b.stage(StageDef::new(*stage)))
            .build()
    }

    pub fn id(&self) -> &ExperimentId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn stages(&self) -> &[StageDef] {
        &self.stages
    }

    pub fn stage(&self, name: &str) -> Option<&StageDef> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    fn validate(&self) -> Result<()> {
        validate_non_empty(&self.name, "experiment name")?;
        if self.stages.is_empty() {
            return Err(Error::validation(format!(
                "experiment '{}' has no stages",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for def in &self.stages {
            validate_non_empty(&def.name, "stage name")?;
            validate_non_empty(&def.stage, "stage reference")?;
            if !seen.insert(def.name.as_str()) {
                return Err(Error::validation(format!(
                    "duplicate stage name in experiment '{}': {}",
                    self.name, def.name
                )));
            }
            for binding in &def.inputs {
                validate_non_empty(&binding.from, "input binding source")?;
                validate_non_empty(&binding.into, "input binding target")?;
            }
        }
        Ok(())
    }
}

/// Unvalidated wire form of an [`Experiment`].
#[derive(Deserialize)]
struct ExperimentRecord {
    id: ExperimentId,
    name: String,
    version: u32,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    owner: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    stages: Vec<StageDef>,
}

impl TryFrom<ExperimentRecord> for Experiment {
    type Error = Error;

    fn try_from(record: ExperimentRecord) -> Result<Self> {
        let experiment = Self {
            id: record.id,
            name: record.name,
            version: record.version,
            tags: record.tags,
            owner: record.owner,
            created_at: record.created_at,
            updated_at: record.updated_at,
            stages: record.stages,
        };
        experiment.validate()?;
        Ok(experiment)
    }
}

/// Builder for [`Experiment`].
#[derive(Debug, Clone)]
pub struct ExperimentBuilder {
    name: String,
    version: u32,
    tags: Vec<String>,
    owner: Option<String>,
    stages: Vec<StageDef>,
}

impl ExperimentBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 1,
            tags: Vec::new(),
            owner: None,
            stages: Vec::new(),
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn stage(mut self, def: StageDef) -> Self {
        self.stages.push(def);
        self
    }

    pub fn build(self) -> Result<Experiment> {
        let now = Utc::now();
        let experiment = Experiment {
            id: ExperimentId::new(),
            name: self.name,
            version: self.version,
            tags: self.tags,
            owner: self.owner,
            created_at: now,
            updated_at: now,
            stages: self.stages,
        };
        experiment.validate()?;
        Ok(experiment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dialectic_default_stages() {
        let exp = Experiment::dialectic("baseline").unwrap();
        assert_eq!(exp.stage_names(), vec!["proposer", "challenger", "synthesizer"]);
        assert_eq!(exp.version(), 1);
        assert_eq!(exp.stage("challenger").unwrap().stage, "challenger");
    }

    #[test]
    fn test_builder_metadata() {
        let exp = Experiment::builder("ablation")
            .version(3)
            .tag("nightly")
            .owner("research")
            .stage(StageDef::new("proposer").with_option("samples", 8))
            .build()
            .unwrap();

        assert_eq!(exp.tags(), ["nightly".to_string()]);
        assert_eq!(exp.owner(), Some("research"));
        assert_eq!(exp.stages()[0].options["samples"], 8);
        assert_eq!(exp.created_at(), exp.updated_at());
    }

    #[test]
    fn test_validation() {
        assert!(Experiment::builder("").stage(StageDef::new("a")).build().is_err());
        assert!(Experiment::builder("empty").build().is_err());

        let err = Experiment::builder("dup")
            .stage(StageDef::new("proposer"))
            .stage(StageDef::new("proposer"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate stage name"));

        assert!(Experiment::builder("bad-binding")
            .stage(StageDef::new("challenger").with_input("", "proposals"))
            .build()
            .is_err());
    }

    #[test]
    fn test_deserialize_rejects_invalid_definitions() {
        let exp = Experiment::dialectic("stored").unwrap();
        let mut raw = serde_json::to_value(&exp).unwrap();
        let loaded: Experiment = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(loaded.stage_names(), exp.stage_names());

        raw["stages"] = json!([]);
        let err = serde_json::from_value::<Experiment>(raw.clone()).unwrap_err();
        assert!(err.to_string().contains("has no stages"));

        let proposer = serde_json::to_value(StageDef::new("proposer")).unwrap();
        raw["stages"] = json!([proposer.clone(), proposer]);
        let err = serde_json::from_value::<Experiment>(raw).unwrap_err();
        assert!(err.to_string().contains("duplicate stage name"));
    }

    #[test]
    fn test_input_binding_resolves_paths() {
        let output = json!({"proposals": [1, 2], "summary": {"best": "p2"}});

        assert_eq!(
            InputBinding::new("proposals", "items").resolve(&output),
            Some(&json!([1, 2]))
        );
        assert_eq!(
            InputBinding::new("summary/best", "winner").resolve(&output),
            Some(&json!("p2"))
        );
        assert_eq!(
            InputBinding::new("/summary/best", "winner").resolve(&output),
            Some(&json!("p2"))
        );
        assert!(InputBinding::new("missing", "x").resolve(&output).is_none());
    }

    #[test]
    fn test_stage_def_deserializes_with_defaults() {
        let def: StageDef = serde_json::from_value(json!({
            "name": "challenger",
            "stage": "critic",
            "timeout": "30s",
            "inputs": [{"from": "proposals", "into": "proposals"}],
        }))
        .unwrap();

        assert_eq!(def.stage, "critic");
        assert_eq!(def.timeout, Some(Duration::from_secs(30)));
        assert!(!def.skip);
        assert_eq!(def.inputs.len(), 1);
    }
}
