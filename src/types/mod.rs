//! Core types for the dispatch kernel.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (JobId, ExperimentId, TenantId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for dispatch, cleanup and telemetry

mod config;
mod errors;
mod ids;

pub use config::{CleanupConfig, Config, DispatchConfig, ObservabilityConfig, TelemetryConfig};
pub use errors::{Error, Result};
pub use ids::{ExperimentId, JobId, TenantId};
