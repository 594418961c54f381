//! Stage registry - concrete stages registered by name.

use std::collections::HashMap;
use std::sync::Arc;

use super::{Stage, StageOptions, StageSchema};
use crate::types::{Error, Result};

/// Name → stage lookup. Built before the kernel starts, read-only afterwards.
#[derive(Debug, Default)]
pub struct StageRegistry {
    stages: HashMap<String, Arc<dyn Stage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            stages: HashMap::new(),
        }
    }

    /// Register a stage. Duplicate names are rejected.
    pub fn register(&mut self, stage: Arc<dyn Stage>) -> Result<()> {
        let name = stage.name().to_string();
        if name.trim().is_empty() {
            return Err(Error::validation("stage name cannot be empty"));
        }
        if self.stages.contains_key(&name) {
            return Err(Error::validation(format!(
                "stage already registered: {}",
                name
            )));
        }
        tracing::debug!(stage = %name, "stage registered");
        self.stages.insert(name, stage);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, stage: impl Stage + 'static) -> Result<Self> {
        self.register(Arc::new(stage))?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Stage>> {
        self.stages
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("unknown stage: {}", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stages.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.stages.keys().cloned().collect();
        names.sort();
        names
    }

    /// Every stage's schema for empty options, sorted by name.
    pub fn describe_all(&self) -> Vec<StageSchema> {
        let empty = StageOptions::new();
        self.names()
            .iter()
            .filter_map(|name| self.stages.get(name))
            .map(|stage| stage.describe(&empty))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
