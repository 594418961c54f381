//! Background cleanup of finished jobs.
//!
//! JobReaper periodically removes terminal jobs whose `completed_at` is older
//! than the configured retention, so a long-running kernel does not grow its
//! registry without bound. Live jobs are never touched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::interval;

use super::registry::JobRegistry;
use crate::types::{CleanupConfig, Error, Result};

/// Statistics from a cleanup cycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CleanupStats {
    /// Number of terminal jobs removed
    pub jobs_removed: usize,
    /// Jobs left in the registry after the cycle
    pub jobs_retained: usize,
    /// When cleanup cycle completed
    pub completed_at: Option<DateTime<Utc>>,
}

/// JobReaper handles background garbage collection of terminal jobs.
#[derive(Debug)]
pub struct JobReaper {
    registry: Arc<JobRegistry>,
    config: CleanupConfig,
    stop_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl JobReaper {
    pub fn new(registry: Arc<JobRegistry>, config: CleanupConfig) -> Self {
        Self {
            registry,
            config,
            stop_tx: None,
        }
    }

    /// Start the cleanup loop in the background.
    /// Returns immediately; cleanup runs in a spawned task.
    pub fn start(&mut self) -> tokio::task::JoinHandle<()> {
        let registry = self.registry.clone();
        let config = self.config.clone();
        let (stop_tx, mut stop_rx) = tokio::sync::oneshot::channel();
        self.stop_tx = Some(stop_tx);

        tokio::spawn(async move {
            let mut ticker = interval(config.interval);
            // The first tick fires immediately; nothing can be stale yet.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = Self::run_cycle(&registry, &config).await {
                            tracing::error!(error = %e, "cleanup_cycle_failed");
                        }
                    }
                    _ = &mut stop_rx => {
                        tracing::info!("job_reaper_stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the cleanup loop.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Run a single cleanup cycle.
    pub async fn run_cycle(registry: &JobRegistry, config: &CleanupConfig) -> Result<CleanupStats> {
        let retention = chrono::Duration::from_std(config.job_retention)
            .map_err(|e| Error::internal(format!("job retention out of range: {}", e)))?;
        let cutoff = Utc::now() - retention;

        let jobs_removed = registry.prune_terminal(cutoff).await;
        let jobs_retained = registry.count().await;

        tracing::debug!(jobs_removed, jobs_retained, "cleanup_cycle_completed");

        Ok(CleanupStats {
            jobs_removed,
            jobs_retained,
            completed_at: Some(Utc::now()),
        })
    }
}

impl Drop for JobReaper {
    fn drop(&mut self) {
        self.stop();
    }
}
