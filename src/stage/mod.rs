//! Stage capability interface.
//!
//! A stage is one named unit of pipeline work. Everything inside a stage
//! (datasets, metrics, model calls) is opaque to the kernel; it only sees the
//! `describe`/`run` contract and the tagged [`StageError`] that decides whether
//! a failure is worth retrying.

pub mod registry;
pub mod schema;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::types::{Error, Result};

pub use registry::StageRegistry;
pub use schema::{FieldType, StageSchema};

/// Stage options map.
pub type StageOptions = Map<String, Value>;

/// Outcome of one stage run.
pub type StageResult = std::result::Result<StageContext, StageError>;

/// Failure reported by a stage. The stage, not the scheduler, decides
/// whether the failure is transient.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum StageError {
    #[error("retryable: {0}")]
    Retryable(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl StageError {
    pub fn retryable(reason: impl Into<String>) -> Self {
        Self::Retryable(reason.into())
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self::Fatal(reason.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, StageError::Retryable(_))
    }

    pub fn reason(&self) -> &str {
        match self {
            StageError::Retryable(r) | StageError::Fatal(r) => r,
        }
    }
}

/// Context threaded through a pipeline: a JSON object stages read from and
/// return an updated copy of.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageContext(Map<String, Value>);

impl StageContext {
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Build from a JSON value. `null` yields an empty context.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::new()),
            Value::Object(map) => Ok(Self(map)),
            other => Err(Error::validation(format!(
                "stage context must be an object, got {}",
                other
            ))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for StageContext {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Job payload shape for stage jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StagePayload {
    #[serde(default)]
    pub context: StageContext,
    #[serde(default)]
    pub options: StageOptions,
}

impl StagePayload {
    pub fn new(context: StageContext, options: StageOptions) -> Self {
        Self { context, options }
    }

    /// Decode a job payload. `null` is an empty payload.
    pub fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone())
            .map_err(|e| Error::validation(format!("malformed stage payload: {e}")))
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// The stage capability: describe options, run against a context.
#[async_trait]
pub trait Stage: Send + Sync + fmt::Debug {
    /// Registry name.
    fn name(&self) -> &str;

    /// Option schema, used for validation and introspection.
    fn describe(&self, options: &StageOptions) -> StageSchema;

    /// Run once. Called again on retryable failures, up to the job's policy.
    async fn run(&self, context: StageContext, options: &StageOptions) -> StageResult;
}

type StageFn = dyn Fn(StageContext, StageOptions) -> BoxFuture<'static, StageResult> + Send + Sync;

/// Closure-backed stage.
#[derive(Clone)]
pub struct FnStage {
    name: String,
    schema: StageSchema,
    func: Arc<StageFn>,
}

impl FnStage {
    pub fn new<F, Fut>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(StageContext, StageOptions) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StageResult> + Send + 'static,
    {
        let name = name.into();
        let func: Arc<StageFn> = Arc::new(
            move |ctx: StageContext, opts: StageOptions| -> BoxFuture<'static, StageResult> {
                Box::pin(func(ctx, opts))
            },
        );
        Self {
            schema: StageSchema::new(name.clone(), ""),
            name,
            func,
        }
    }

    pub fn with_schema(mut self, schema: StageSchema) -> Self {
        self.schema = schema;
        self
    }
}

impl fmt::Debug for FnStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStage").field("name", &self.name).finish()
    }
}

#[async_trait]
impl Stage for FnStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn describe(&self, _options: &StageOptions) -> StageSchema {
        self.schema.clone()
    }

    async fn run(&self, context: StageContext, options: &StageOptions) -> StageResult {
        (self.func)(context, options.clone()).await
    }
}
