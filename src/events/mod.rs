//! Event infrastructure - job lifecycle events and their telemetry translation.
//!
//! The scheduler publishes `job.*` events on the [`CommBus`](crate::commbus::CommBus).
//! The telemetry bridge re-emits the ones owned by this system under the
//! pipeline's `dialectic.*` vocabulary.

pub mod bridge;
pub mod translation;

use serde_json::{json, Map, Value};
use std::time::Duration;

use crate::commbus::Event;
use crate::kernel::types::{Job, JobStatus};

pub use bridge::{BridgeHandle, TelemetryBridge};
pub use translation::{translate_job_event, BridgeFilter, TelemetryEvent};

pub const JOB_SUBMITTED: &str = "job.submitted";
pub const JOB_STARTED: &str = "job.started";
pub const JOB_COMPLETED: &str = "job.completed";
pub const JOB_FAILED: &str = "job.failed";
pub const JOB_CANCELED: &str = "job.canceled";

pub const EXPERIMENT_SUBMITTED: &str = "dialectic.experiment.submitted";
pub const STAGE_STARTED: &str = "dialectic.stage.started";
pub const STAGE_COMPLETED: &str = "dialectic.stage.completed";
pub const STAGE_FAILED: &str = "dialectic.stage.failed";

/// Publisher name stamped on kernel lifecycle events.
pub const KERNEL_SOURCE: &str = "kernel";

/// Build a lifecycle event for `job`.
///
/// `duration_ms` is filled from the job when it is terminal. `error` overrides
/// the job's stored failure message (used for timeouts, which carry none).
pub fn job_event(event_type: &str, job: &Job, error: Option<&str>) -> Event {
    let mut payload = json!({
        "job_id": job.id.as_str(),
        "tenant_id": job.tenant_id.as_str(),
        "namespace": job.namespace,
        "stage": job.stage,
        "priority": job.priority.as_str(),
        "kind": job.kind.as_str(),
        "status": job.status.as_str(),
        "attempt": job.attempt,
        "metadata": job.metadata.iter().map(|(k, v)| (k.clone(), v.clone())).collect::<Map<String, Value>>(),
    });

    if let Some(obj) = payload.as_object_mut() {
        if let Some(duration) = job.duration() {
            obj.insert("duration_ms".to_string(), json!(duration_ms(duration)));
        }
        let message = error
            .map(str::to_string)
            .or_else(|| job.error.as_ref().map(|e| e.message.clone()))
            .or_else(|| (job.status == JobStatus::Timeout).then(|| "deadline exceeded".to_string()));
        if let Some(message) = message {
            obj.insert("error".to_string(), json!(message));
        }
    }

    Event::new(event_type, payload, KERNEL_SOURCE)
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
