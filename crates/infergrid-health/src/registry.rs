//! Health registry: heartbeat bookkeeping and staleness detection.
//!
//! Node agents call in on a fixed interval. Each heartbeat stamps the
//! node's last-seen time from the injected clock and, when the agent sends
//! a load report, refreshes the node's health score and queue figures.

use std::sync::Arc;
use std::time::Duration;

use infergrid_state::{Node, NodeRegistry, StateError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{HealthError, HealthResult};

/// Health score at or below which a heartbeat counts as unhealthy.
pub const UNHEALTHY_SCORE: f64 = 0.5;

/// What a node agent reports with each heartbeat.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatReport {
    #[serde(default = "full_health")]
    pub health_score: f64,
    #[serde(default)]
    pub queue_depth: u32,
    #[serde(default)]
    pub active_requests: u32,
}

fn full_health() -> f64 {
    1.0
}

impl HeartbeatReport {
    pub fn is_healthy(&self) -> bool {
        self.health_score > UNHEALTHY_SCORE
    }
}

pub struct HealthRegistry {
    nodes: Arc<NodeRegistry>,
}

impl HealthRegistry {
    pub fn new(nodes: Arc<NodeRegistry>) -> Self {
        Self { nodes }
    }

    /// Record a bare liveness ping.
    pub fn heartbeat(&self, node_id: &str) -> HealthResult<Node> {
        self.apply(node_id, None)
    }

    /// Record a heartbeat carrying a load report.
    pub fn report(&self, node_id: &str, report: &HeartbeatReport) -> HealthResult<Node> {
        if !(0.0..=1.0).contains(&report.health_score) {
            return Err(HealthError::InvalidReport(format!(
                "health_score must be within 0..=1, got {}",
                report.health_score
            )));
        }
        self.apply(node_id, Some(report))
    }

    fn apply(&self, node_id: &str, report: Option<&HeartbeatReport>) -> HealthResult<Node> {
        let current = self
            .nodes
            .get(node_id)
            .ok_or_else(|| HealthError::NodeNotFound(node_id.to_string()))?;
        if current.status.is_terminal() {
            return Err(HealthError::NodeTerminal(node_id.to_string()));
        }

        let now = self.nodes.now();
        let node = self
            .nodes
            .update(node_id, |n| {
                n.last_heartbeat = Some(now);
                if let Some(r) = report {
                    n.health_score = r.health_score;
                    n.queue_depth = r.queue_depth;
                    n.active_requests = r.active_requests;
                }
            })
            .map_err(|e| match e {
                StateError::NotFound(_) => HealthError::NodeNotFound(node_id.to_string()),
                other => HealthError::State(other),
            })?;
        debug!(%node_id, score = node.health_score, queue = node.queue_depth, "heartbeat");
        Ok(node)
    }

    /// Non-terminal nodes whose last heartbeat is older than `threshold`.
    /// Nodes that have never sent a heartbeat are not reported.
    pub fn stale_nodes(&self, threshold: Duration) -> Vec<Node> {
        let now = self.nodes.now();
        let limit = threshold.as_secs();
        let stale: Vec<Node> = self
            .nodes
            .snapshot()
            .into_iter()
            .filter(|n| !n.status.is_terminal())
            .filter(|n| n.heartbeat_age(now).is_some_and(|age| age > limit))
            .collect();
        if !stale.is_empty() {
            warn!(count = stale.len(), threshold_secs = limit, "stale nodes detected");
        }
        stale
    }
}
