//! Internal event bus.
//!
//! Fleet, health and admin components publish [`Event`]s; the reconciler,
//! log streams and external notifiers subscribe. Delivery is at-least-once
//! from the subscriber's point of view (a lagging subscriber may see a
//! `Lagged` gap and must re-read state), so consumers must be idempotent.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::clock::epoch_secs;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventKind {
    #[serde(rename = "node.launched")]
    NodeLaunched,
    #[serde(rename = "node.status_changed")]
    NodeStatusChanged,
    #[serde(rename = "node.health_changed")]
    NodeHealthChanged,
    #[serde(rename = "node.draining")]
    NodeDraining,
    #[serde(rename = "node.terminated")]
    NodeTerminated,
    #[serde(rename = "node.failed")]
    NodeFailed,
    #[serde(rename = "cost.anomaly_detected")]
    CostAnomalyDetected,
    #[serde(rename = "reconciler.alert")]
    ReconcilerAlert,
    #[serde(rename = "apikey.created")]
    ApiKeyCreated,
    #[serde(rename = "apikey.revoked")]
    ApiKeyRevoked,
    #[serde(rename = "credentials.rotated")]
    CredentialsRotated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            timestamp: epoch_secs(),
            node_id: None,
            tenant_id: None,
            payload,
        }
    }

    pub fn for_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn for_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }
}

/// Fan-out bus backed by a tokio broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        trace!(kind = ?event.kind, id = %event.id, "event published");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
