//! # Dialectic Core - experiment pipeline and job dispatch kernel
//!
//! Runs a proposer → challenger → synthesizer pipeline (or any ordered list
//! of named stages) where every stage executes as a schedulable, retryable
//! kernel job:
//! - Job submission with validation, priorities and resource annotations
//! - Retry with fixed or exponential backoff, per-job deadlines
//! - Polling completion protocol
//! - Sequential and parallel pipeline orchestration
//! - Telemetry bridge re-emitting lifecycle events as `dialectic.*` events
//!
//! ## Architecture
//!
//! ```text
//!   Orchestrator ──submit──▶ Scheduler ──spawn──▶ Executor ──run──▶ Stage
//!        │                      │                    │
//!        └──await──▶ Awaiter    ▼                    ▼
//!                        JobRegistry ◀──── state transitions
//!                                                     │
//!                      CommBus ◀── job.* events ──────┘
//!                         │
//!                         └──▶ TelemetryBridge ──▶ dialectic.* events
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod commbus;
pub mod events;
pub mod kernel;
pub mod pipeline;
pub mod stage;
pub mod types;

// Internal utilities
pub mod observability;
pub mod validation;

pub use kernel::Kernel;
pub use types::{Config, Error, Result};
