//! Telemetry bridge - subscribes to kernel lifecycle events and re-emits the
//! ones this system owns as `dialectic.*` telemetry.
//!
//! Handlers are keyed by name. Attaching under a name that is already
//! attached replaces the earlier handler, so one name never emits an event
//! twice. A failure while translating or re-emitting one event is logged and
//! dropped; it never reaches the publisher or stops the handler.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::translation::{translate_job_event, BridgeFilter};
use super::{JOB_COMPLETED, JOB_FAILED, JOB_STARTED, JOB_SUBMITTED};
use crate::commbus::{CommBus, Event, Subscription};
use crate::types::{Result, TelemetryConfig};
use crate::validation::validate_non_empty;

/// Publisher name stamped on re-emitted telemetry events.
pub const BRIDGE_SOURCE: &str = "telemetry-bridge";

/// Receipt for an attached handler.
#[derive(Debug, Clone)]
pub struct BridgeHandle {
    pub handler_name: String,
    pub subscription: Subscription,
    /// Whether an earlier handler with the same name was replaced.
    pub replaced: bool,
}

#[derive(Debug)]
pub struct TelemetryBridge {
    bus: Arc<CommBus>,
    config: TelemetryConfig,
    handlers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TelemetryBridge {
    pub fn new(bus: Arc<CommBus>, config: TelemetryConfig) -> Self {
        Self {
            bus,
            config,
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Attach under the configured handler name.
    pub async fn attach(&self) -> Result<BridgeHandle> {
        let name = self.config.handler_name.clone();
        self.attach_as(&name).await
    }

    /// Attach under `handler_name`, replacing any handler already using it.
    pub async fn attach_as(&self, handler_name: &str) -> Result<BridgeHandle> {
        validate_non_empty(handler_name, "handler_name")?;

        let mut handlers = self.handlers.lock().await;
        let replaced = match handlers.remove(handler_name) {
            Some(previous) => {
                previous.abort();
                true
            }
            None => false,
        };

        let event_types = [JOB_SUBMITTED, JOB_STARTED, JOB_COMPLETED, JOB_FAILED]
            .iter()
            .map(|t| t.to_string())
            .collect();
        let (subscription, mut rx) = self.bus.subscribe(handler_name, event_types).await?;

        let bus = self.bus.clone();
        let filter = BridgeFilter::from(&self.config);
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                forward(&bus, &event, &filter).await;
            }
        });
        handlers.insert(handler_name.to_string(), task);

        tracing::info!(handler = %handler_name, replaced, "telemetry_bridge_attached");

        Ok(BridgeHandle {
            handler_name: handler_name.to_string(),
            subscription,
            replaced,
        })
    }

    /// Detach `handler_name`. Returns whether it was attached.
    pub async fn detach(&self, handler_name: &str) -> bool {
        let task = self.handlers.lock().await.remove(handler_name);
        let subscribed = self.bus.unsubscribe_id(handler_name).await;
        if let Some(task) = &task {
            task.abort();
        }

        let detached = task.is_some() || subscribed;
        if detached {
            tracing::info!(handler = %handler_name, "telemetry_bridge_detached");
        }
        detached
    }

    /// Detach every handler.
    pub async fn detach_all(&self) {
        let names: Vec<String> = self.handlers.lock().await.keys().cloned().collect();
        for name in names {
            self.detach(&name).await;
        }
    }

    pub async fn is_attached(&self, handler_name: &str) -> bool {
        self.handlers.lock().await.contains_key(handler_name)
    }

    pub async fn handler_count(&self) -> usize {
        self.handlers.lock().await.len()
    }
}

/// Translate one lifecycle event and re-emit it. Errors stay here.
async fn forward(bus: &CommBus, event: &Event, filter: &BridgeFilter) {
    let telemetry = match translate_job_event(&event.event_type, &event.payload, filter) {
        Ok(Some(telemetry)) => telemetry,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(event_type = %event.event_type, error = %e, "telemetry_translation_failed");
            return;
        }
    };

    tracing::info!(
        event = %telemetry.event_name,
        job_id = %telemetry.metadata.job_id,
        stage = telemetry.metadata.stage_name.as_deref().unwrap_or(""),
        experiment_id = telemetry.metadata.experiment_id.as_deref().unwrap_or(""),
        duration_ms = telemetry.measurements.duration_ms,
        error = telemetry.metadata.error.as_deref(),
        "telemetry_event"
    );

    let payload = match serde_json::to_value(&telemetry) {
        Ok(payload) => payload,
        Err(e) => {
            tracing::warn!(event = %telemetry.event_name, error = %e, "telemetry_encode_failed");
            return;
        }
    };
    if let Err(e) = bus
        .publish(Event::new(telemetry.event_name.clone(), payload, BRIDGE_SOURCE))
        .await
    {
        tracing::warn!(event = %telemetry.event_name, error = %e, "telemetry_emit_failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::STAGE_STARTED;
    use serde_json::json;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn started(job_id: &str) -> Event {
        Event::new(
            JOB_STARTED,
            json!({
                "job_id": job_id,
                "tenant_id": "lab",
                "namespace": "proposer",
                "priority": "interactive",
                "kind": "experiment_step",
                "metadata": {"source": "dialectic", "stage_name": "proposer"},
            }),
            "kernel",
        )
    }

    async fn listen(bus: &CommBus) -> tokio::sync::mpsc::UnboundedReceiver<Event> {
        let (_sub, rx) = bus
            .subscribe("listener", vec![STAGE_STARTED.to_string()])
            .await
            .unwrap();
        rx
    }

    #[tokio::test]
    async fn test_attach_forwards_owned_events() {
        let bus = Arc::new(CommBus::new());
        let bridge = TelemetryBridge::new(bus.clone(), TelemetryConfig::default());
        let mut rx = listen(&bus).await;

        let handle = bridge.attach().await.unwrap();
        assert_eq!(handle.handler_name, "dialectic-telemetry");
        assert!(!handle.replaced);

        bus.publish(started("job-1")).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type, "dialectic.stage.started");
        assert_eq!(event.source, BRIDGE_SOURCE);
        assert_eq!(event.payload["metadata"]["job_id"], "job-1");
    }

    #[tokio::test]
    async fn test_double_attach_does_not_duplicate() {
        let bus = Arc::new(CommBus::new());
        let bridge = TelemetryBridge::new(bus.clone(), TelemetryConfig::default());
        let mut rx = listen(&bus).await;

        bridge.attach().await.unwrap();
        let second = bridge.attach().await.unwrap();
        assert!(second.replaced);
        assert_eq!(bridge.handler_count().await, 1);

        bus.publish(started("job-1")).await.unwrap();

        assert!(tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .is_some());
        assert!(
            tokio::time::timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err(),
            "event emitted twice"
        );
    }

    #[tokio::test]
    async fn test_detach_stops_forwarding() {
        let bus = Arc::new(CommBus::new());
        let bridge = TelemetryBridge::new(bus.clone(), TelemetryConfig::default());
        let mut rx = listen(&bus).await;

        bridge.attach().await.unwrap();
        assert!(bridge.detach("dialectic-telemetry").await);
        assert!(!bridge.is_attached("dialectic-telemetry").await);
        assert!(!bridge.detach("dialectic-telemetry").await);

        bus.publish(started("job-1")).await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_translation_failure_is_logged_and_swallowed() {
        let bus = CommBus::new();
        let mut rx = listen(&bus).await;
        let filter = BridgeFilter::new("dialectic");

        let malformed = Event::new(JOB_STARTED, json!({"tenant_id": "lab"}), "kernel");
        forward(&bus, &malformed, &filter).await;
        assert!(logs_contain("telemetry_translation_failed"));

        forward(&bus, &started("job-2"), &filter).await;
        assert_eq!(rx.recv().await.unwrap().payload["metadata"]["job_id"], "job-2");
    }

    #[tokio::test]
    async fn test_empty_handler_name_rejected() {
        let bridge = TelemetryBridge::new(Arc::new(CommBus::new()), TelemetryConfig::default());
        assert!(bridge.attach_as("  ").await.is_err());
    }
}
