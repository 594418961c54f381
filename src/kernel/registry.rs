//! Job registry - keyed job store shared by scheduler, executor and awaiter.
//!
//! The registry is the only shared mutable structure in the kernel. Every
//! mutation runs as one closure under the write lock, so a concurrent reader
//! sees either the old job or the fully updated one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::types::{Job, JobKind, JobStatus};
use crate::types::{Error, JobId, Result, TenantId};

/// Listing filters. Tenant is always required separately.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListFilter {
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub kind: Option<JobKind>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl ListFilter {
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, job: &Job) -> bool {
        if let Some(ns) = &self.namespace {
            if &job.namespace != ns {
                return false;
            }
        }
        if let Some(status) = self.status {
            if job.status != status {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if job.kind != kind {
                return false;
            }
        }
        true
    }
}

/// Aggregate registry statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total: usize,
    pub by_status: HashMap<JobStatus, usize>,
    pub tenants: usize,
}

impl RegistryStats {
    pub fn count(&self, status: JobStatus) -> usize {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

/// In-memory job registry.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    /// Insert a freshly built job. Ids are unique; a clash is an internal error.
    pub async fn insert(&self, job: Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            return Err(Error::internal(format!("duplicate job id: {}", job.id)));
        }
        jobs.insert(job.id.clone(), job);
        Ok(())
    }

    /// Get a snapshot of a job.
    pub async fn get(&self, id: &JobId) -> Result<Job> {
        self.jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("unknown job: {}", id)))
    }

    /// Apply `f` to a job atomically and return the updated snapshot.
    ///
    /// Terminal jobs are rejected before `f` runs. If `f` fails the job is
    /// left untouched.
    pub async fn update<F, T>(&self, id: &JobId, f: F) -> Result<(T, Job)>
    where
        F: FnOnce(&mut Job) -> Result<T>,
    {
        let mut jobs = self.jobs.write().await;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| Error::not_found(format!("unknown job: {}", id)))?;

        if job.is_terminal() {
            return Err(Error::state_transition(format!(
                "job {} is {} and can no longer change",
                id, job.status
            )));
        }

        let mut draft = job.clone();
        let out = f(&mut draft)?;
        *job = draft;
        Ok((out, job.clone()))
    }

    /// List a tenant's jobs, oldest first.
    pub async fn list(&self, tenant_id: &TenantId, filter: &ListFilter) -> Vec<Job> {
        let jobs = self.jobs.read().await;
        let mut matching: Vec<Job> = jobs
            .values()
            .filter(|job| &job.tenant_id == tenant_id && filter.matches(job))
            .cloned()
            .collect();
        matching.sort_by_key(|job| job.created_at);
        if let Some(limit) = filter.limit {
            matching.truncate(limit);
        }
        matching
    }

    /// Count jobs.
    pub async fn count(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Count jobs by status.
    pub async fn count_by_status(&self, status: JobStatus) -> usize {
        self.jobs
            .read()
            .await
            .values()
            .filter(|job| job.status == status)
            .count()
    }

    pub async fn stats(&self) -> RegistryStats {
        let jobs = self.jobs.read().await;
        let mut stats = RegistryStats {
            total: jobs.len(),
            ..RegistryStats::default()
        };
        let mut tenants = std::collections::HashSet::new();
        for job in jobs.values() {
            *stats.by_status.entry(job.status).or_insert(0) += 1;
            tenants.insert(&job.tenant_id);
        }
        stats.tenants = tenants.len();
        stats
    }

    /// Remove terminal jobs that completed before `cutoff`. Returns the count.
    pub async fn prune_terminal(&self, cutoff: DateTime<Utc>) -> usize {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| {
            !(job.is_terminal() && job.completed_at.is_some_and(|done| done < cutoff))
        });
        before - jobs.len()
    }

    /// Remove a job completely.
    pub async fn remove(&self, id: &JobId) -> Result<Job> {
        self.jobs
            .write()
            .await
            .remove(id)
            .ok_or_else(|| Error::not_found(format!("unknown job: {}", id)))
    }
}
