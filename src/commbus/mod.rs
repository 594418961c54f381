//! Communication bus for job lifecycle and telemetry events.
//!
//! Pub/sub with fan-out: the scheduler publishes job lifecycle events, the
//! telemetry bridge consumes them and publishes normalized stage events back.
//! Subscribers are keyed by a stable id; subscribing again under the same id
//! replaces the earlier registration, so one id never receives an event twice.

use crate::types::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

// =============================================================================
// Message Types
// =============================================================================

/// Event message for pub/sub pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub payload: Value,
    pub timestamp_ms: i64,
    /// Component that published the event.
    pub source: String,
}

impl Event {
    pub fn new(event_type: impl Into<String>, payload: Value, source: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            timestamp_ms: Utc::now().timestamp_millis(),
            source: source.into(),
        }
    }
}

// =============================================================================
// Subscriber Management
// =============================================================================

/// Subscriber handle for receiving events.
#[derive(Debug)]
struct Subscriber {
    id: String,
    tx: mpsc::UnboundedSender<Event>,
}

/// Subscription receipt for managing subscriptions.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub event_types: Vec<String>,
}

// =============================================================================
// CommBus - In-Memory Message Bus
// =============================================================================

/// In-memory event bus.
#[derive(Debug)]
pub struct CommBus {
    /// Event subscribers: event_type -> list of subscribers
    subscribers: Arc<RwLock<HashMap<String, Vec<Subscriber>>>>,

    /// Statistics
    stats: Arc<RwLock<BusStats>>,
}

/// Statistics about bus usage.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct BusStats {
    pub events_published: u64,
    pub events_delivered: u64,
    pub active_subscribers: usize,
}

impl CommBus {
    /// Create a new CommBus instance.
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(BusStats::default())),
        }
    }

    // =========================================================================
    // Event Pub/Sub
    // =========================================================================

    /// Publish an event to all subscribers of its type.
    ///
    /// Returns the number of subscribers it was delivered to. Closed
    /// subscriber channels are skipped.
    pub async fn publish(&self, event: Event) -> Result<usize> {
        let subscribers = self.subscribers.read().await;

        let interested = subscribers
            .get(&event.event_type)
            .map(|subs| subs.as_slice())
            .unwrap_or(&[]);

        let mut delivered = 0;
        for subscriber in interested {
            if subscriber.tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        drop(subscribers);

        let mut stats = self.stats.write().await;
        stats.events_published += 1;
        stats.events_delivered += delivered as u64;

        tracing::debug!(
            event_type = %event.event_type,
            delivered,
            "event published"
        );

        Ok(delivered)
    }

    /// Subscribe to event types under `subscriber_id`.
    ///
    /// Any earlier subscription with the same id is dropped first, closing its
    /// receiver.
    pub async fn subscribe(
        &self,
        subscriber_id: impl Into<String>,
        event_types: Vec<String>,
    ) -> Result<(Subscription, mpsc::UnboundedReceiver<Event>)> {
        let subscriber_id = subscriber_id.into();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut subscribers = self.subscribers.write().await;
        let replaced = remove_subscriber(&mut subscribers, &subscriber_id);

        for event_type in &event_types {
            let subs = subscribers.entry(event_type.clone()).or_default();
            if !subs.iter().any(|s| s.id == subscriber_id) {
                subs.push(Subscriber {
                    id: subscriber_id.clone(),
                    tx: tx.clone(),
                });
            }
        }

        let active = count_subscribers(&subscribers);
        drop(subscribers);
        self.stats.write().await.active_subscribers = active;

        tracing::debug!(
            subscriber = %subscriber_id,
            ?event_types,
            replaced,
            "subscriber registered"
        );

        Ok((
            Subscription {
                id: subscriber_id,
                event_types,
            },
            rx,
        ))
    }

    /// Unsubscribe from events.
    pub async fn unsubscribe(&self, subscription: &Subscription) -> Result<()> {
        self.unsubscribe_id(&subscription.id).await;
        Ok(())
    }

    /// Drop every registration for `subscriber_id`. Returns whether one existed.
    pub async fn unsubscribe_id(&self, subscriber_id: &str) -> bool {
        let mut subscribers = self.subscribers.write().await;
        let removed = remove_subscriber(&mut subscribers, subscriber_id);
        let active = count_subscribers(&subscribers);
        drop(subscribers);
        self.stats.write().await.active_subscribers = active;

        tracing::debug!(subscriber = %subscriber_id, removed, "unsubscribed");
        removed
    }

    /// Whether `subscriber_id` currently holds a registration.
    pub async fn is_subscribed(&self, subscriber_id: &str) -> bool {
        self.subscribers
            .read()
            .await
            .values()
            .any(|subs| subs.iter().any(|s| s.id == subscriber_id))
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Get current bus statistics.
    pub async fn get_stats(&self) -> BusStats {
        self.stats.read().await.clone()
    }

    /// Reset statistics counters.
    pub async fn reset_stats(&self) {
        let mut stats = self.stats.write().await;
        stats.events_published = 0;
        stats.events_delivered = 0;
    }
}

impl Default for CommBus {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_subscriber(subscribers: &mut HashMap<String, Vec<Subscriber>>, id: &str) -> bool {
    let mut removed = false;
    for subs in subscribers.values_mut() {
        let before = subs.len();
        subs.retain(|s| s.id != id);
        removed |= subs.len() != before;
    }
    subscribers.retain(|_, subs| !subs.is_empty());
    removed
}

fn count_subscribers(subscribers: &HashMap<String, Vec<Subscriber>>) -> usize {
    subscribers.values().map(|v| v.len()).sum()
}

// =============================================================================
// Tests
// =============================================================================
