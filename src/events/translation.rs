//! Event translation - kernel `job.*` events → `dialectic.*` telemetry events.
//!
//! Pure deterministic mapping, no I/O.
//!
//! Translation rules:
//!   job.submitted → dialectic.experiment.submitted
//!   job.started   → dialectic.stage.started
//!   job.completed → dialectic.stage.completed
//!   job.failed    → dialectic.stage.failed
//!   (all others)  → None (not bridged)
//!
//! Jobs are bridged only when their tenant is listed in the filter or their
//! `metadata.source` matches the filter's source marker.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    EXPERIMENT_SUBMITTED, JOB_COMPLETED, JOB_FAILED, JOB_STARTED, JOB_SUBMITTED, STAGE_COMPLETED,
    STAGE_FAILED, STAGE_STARTED,
};
use crate::types::{Error, Result, TelemetryConfig};

/// Which jobs the bridge owns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeFilter {
    pub tenants: Vec<String>,
    pub source: String,
}

impl BridgeFilter {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            tenants: Vec::new(),
            source: source.into(),
        }
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenants.push(tenant.into());
        self
    }

    pub fn matches(&self, tenant_id: &str, source: Option<&str>) -> bool {
        self.tenants.iter().any(|t| t == tenant_id)
            || source.is_some_and(|s| !self.source.is_empty() && s == self.source)
    }
}

impl From<&TelemetryConfig> for BridgeFilter {
    fn from(config: &TelemetryConfig) -> Self {
        Self {
            tenants: config.tenants.clone(),
            source: config.source.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Measurements {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetryMetadata {
    pub job_id: String,
    pub tenant_id: String,
    pub namespace: String,
    pub priority: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experiment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Normalized telemetry record re-emitted by the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_name: String,
    pub measurements: Measurements,
    pub metadata: TelemetryMetadata,
}

/// Translate a kernel lifecycle event.
///
/// `Ok(None)` for events that are not bridged (unknown type, or a job this
/// system does not own). A bridged event type whose payload lacks the job
/// identity fields is an error.
pub fn translate_job_event(
    event_type: &str,
    payload: &Value,
    filter: &BridgeFilter,
) -> Result<Option<TelemetryEvent>> {
    let event_name = match event_type {
        JOB_SUBMITTED => EXPERIMENT_SUBMITTED,
        JOB_STARTED => STAGE_STARTED,
        JOB_COMPLETED => STAGE_COMPLETED,
        JOB_FAILED => STAGE_FAILED,
        // job.canceled and anything else stays inside the kernel
        _ => return Ok(None),
    };

    let job_id = required_str(payload, "job_id", event_type)?;
    let tenant_id = required_str(payload, "tenant_id", event_type)?;

    let metadata = payload.get("metadata");
    let meta_str = |key: &str| {
        metadata
            .and_then(|m| m.get(key))
            .and_then(Value::as_str)
            .map(str::to_string)
    };

    if !filter.matches(&tenant_id, meta_str("source").as_deref()) {
        return Ok(None);
    }

    let str_field = |key: &str| {
        payload
            .get(key)
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string()
    };

    Ok(Some(TelemetryEvent {
        event_name: event_name.to_string(),
        measurements: Measurements {
            duration_ms: payload.get("duration_ms").and_then(Value::as_u64),
        },
        metadata: TelemetryMetadata {
            job_id,
            tenant_id,
            namespace: str_field("namespace"),
            priority: str_field("priority"),
            kind: str_field("kind"),
            experiment_id: meta_str("experiment_id"),
            stage_name: meta_str("stage_name"),
            error: payload
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
    }))
}

fn required_str(payload: &Value, key: &str, event_type: &str) -> Result<String> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| Error::validation(format!("{} event missing {}", event_type, key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn filter() -> BridgeFilter {
        BridgeFilter::new("dialectic")
    }

    fn payload(source: &str) -> Value {
        json!({
            "job_id": "job-1",
            "tenant_id": "lab",
            "namespace": "challenger",
            "stage": "challenger",
            "priority": "interactive",
            "kind": "experiment_step",
            "status": "running",
            "attempt": 1,
            "metadata": {
                "source": source,
                "experiment_id": "exp-9",
                "stage_name": "challenger",
            },
        })
    }

    #[test]
    fn test_job_submitted() {
        let event = translate_job_event("job.submitted", &payload("dialectic"), &filter())
            .unwrap()
            .unwrap();

        assert_eq!(event.event_name, "dialectic.experiment.submitted");
        assert_eq!(event.metadata.job_id, "job-1");
        assert_eq!(event.metadata.tenant_id, "lab");
        assert_eq!(event.metadata.namespace, "challenger");
        assert_eq!(event.metadata.experiment_id.as_deref(), Some("exp-9"));
        assert_eq!(event.measurements.duration_ms, None);
    }

    #[test]
    fn test_job_started() {
        let event = translate_job_event("job.started", &payload("dialectic"), &filter())
            .unwrap()
            .unwrap();
        assert_eq!(event.event_name, "dialectic.stage.started");
        assert_eq!(event.metadata.stage_name.as_deref(), Some("challenger"));
        assert_eq!(event.metadata.priority, "interactive");
        assert_eq!(event.metadata.kind, "experiment_step");
    }

    #[test]
    fn test_job_completed_carries_duration() {
        let mut p = payload("dialectic");
        p["status"] = json!("succeeded");
        p["duration_ms"] = json!(1250);

        let event = translate_job_event("job.completed", &p, &filter())
            .unwrap()
            .unwrap();
        assert_eq!(event.event_name, "dialectic.stage.completed");
        assert_eq!(event.measurements.duration_ms, Some(1250));
        assert!(event.metadata.error.is_none());
    }

    #[test]
    fn test_job_failed_carries_error() {
        let mut p = payload("dialectic");
        p["status"] = json!("timeout");
        p["error"] = json!("deadline exceeded");

        let event = translate_job_event("job.failed", &p, &filter())
            .unwrap()
            .unwrap();
        assert_eq!(event.event_name, "dialectic.stage.failed");
        assert_eq!(event.metadata.error.as_deref(), Some("deadline exceeded"));
    }

    #[test]
    fn test_foreign_source_filtered() {
        let result = translate_job_event("job.started", &payload("other-system"), &filter()).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_listed_tenant_bridged_without_source() {
        let mut p = payload("other-system");
        p["metadata"] = json!({});

        assert!(translate_job_event("job.started", &p, &filter())
            .unwrap()
            .is_none());

        let by_tenant = filter().with_tenant("lab");
        let event = translate_job_event("job.started", &p, &by_tenant)
            .unwrap()
            .unwrap();
        assert_eq!(event.metadata.experiment_id, None);
    }

    #[test]
    fn test_unknown_event_filtered() {
        let p = payload("dialectic");
        assert!(translate_job_event("job.canceled", &p, &filter()).unwrap().is_none());
        assert!(translate_job_event("internal.debug", &p, &filter()).unwrap().is_none());
    }

    #[test]
    fn test_missing_job_id_is_error() {
        let err = translate_job_event("job.started", &json!({"tenant_id": "lab"}), &filter())
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("job_id"));
    }

    #[test]
    fn test_filter_from_config() {
        let config = TelemetryConfig {
            tenants: vec!["lab".to_string()],
            ..TelemetryConfig::default()
        };
        let filter = BridgeFilter::from(&config);
        assert_eq!(filter.source, "dialectic");
        assert!(filter.matches("lab", None));
        assert!(!filter.matches("elsewhere", None));
    }
}
