//! Node lifecycle actions shared by the reconciler and the deployment
//! controller.
//!
//! Every action is keyed by node id and safe to repeat: launching a node
//! that is already Booting, draining a Draining node or terminating a
//! Terminated one returns the node unchanged. Provisioning calls are made
//! with no lock held; the registry is only touched before and after.

use std::collections::HashSet;
use std::sync::Arc;

use infergrid_health::SafetyMonitor;
use infergrid_scheduler::LoadTracker;
use infergrid_state::{Event, EventKind, Node, NodeRegistry, NodeStatus, StateError};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{FleetError, FleetResult};
use crate::logs::{LogPhase, NodeLogStore};
use crate::provisioner::{LaunchRequest, ProvisionError, Provisioner};

/// A fresh node id: `node-` and 12 hex digits.
pub fn new_node_id() -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("node-{}", &id[..12])
}

pub struct Lifecycle {
    nodes: Arc<NodeRegistry>,
    provisioner: Arc<dyn Provisioner>,
    logs: Arc<NodeLogStore>,
    safety: Arc<SafetyMonitor>,
    load: LoadTracker,
}

/// Outcome of a launch attempt.
#[derive(Debug)]
pub enum LaunchOutcome {
    Booting(Node),
    /// The node was no longer waiting for a launch.
    Skipped(Node),
    Error(ProvisionError),
}

impl Lifecycle {
    pub fn new(
        nodes: Arc<NodeRegistry>,
        provisioner: Arc<dyn Provisioner>,
        logs: Arc<NodeLogStore>,
        safety: Arc<SafetyMonitor>,
        load: LoadTracker,
    ) -> Self {
        Self {
            nodes,
            provisioner,
            logs,
            safety,
            load,
        }
    }

    pub fn nodes(&self) -> &Arc<NodeRegistry> {
        &self.nodes
    }

    pub fn logs(&self) -> &Arc<NodeLogStore> {
        &self.logs
    }

    pub fn safety(&self) -> &Arc<SafetyMonitor> {
        &self.safety
    }

    pub fn load(&self) -> &LoadTracker {
        &self.load
    }

    pub fn provisioner_name(&self) -> &'static str {
        self.provisioner.name()
    }

    /// Instance ids the backend reports as running.
    pub async fn live_instances(&self) -> Result<HashSet<String>, ProvisionError> {
        self.provisioner.live_instances().await
    }

    /// Register a new `Requested` node.
    pub fn create(&self, mut node: Node) -> FleetResult<Node> {
        node.status = NodeStatus::Requested;
        let node = self.insert(node)?;
        self.logs.info(
            &node.id,
            LogPhase::Queued,
            format!("queued {} on {} in {}", node.model, node.provider, node.region),
            0,
        );
        Ok(node)
    }

    /// Register a node whose resource was acquired elsewhere. It enters the
    /// registry already Booting, so no launch is ever dispatched for it.
    pub fn adopt(&self, mut node: Node) -> FleetResult<Node> {
        node.status = NodeStatus::Booting;
        let node = self.insert(node)?;
        self.logs.info(
            &node.id,
            LogPhase::InstanceReady,
            "registered externally, waiting for heartbeat and probe",
            60,
        );
        Ok(node)
    }

    fn insert(&self, node: Node) -> FleetResult<Node> {
        let node = self.nodes.insert(node).map_err(|e| match e {
            StateError::AlreadyExists(id) => FleetError::InvalidAction(format!("node {id} already exists")),
            other => FleetError::State(other),
        })?;
        info!(
            node_id = %node.id,
            tenant = %node.tenant_id,
            model = %node.model,
            provider = %node.provider,
            status = %node.status,
            "node added"
        );
        self.nodes.events().publish(
            Event::new(
                EventKind::NodeLaunched,
                json!({
                    "model": node.model,
                    "provider": node.provider,
                    "region": node.region,
                    "status": node.status,
                }),
            )
            .for_node(&node.id)
            .for_tenant(&node.tenant_id),
        );
        Ok(node)
    }

    /// Ask the backend for a node's resource and move it to Booting.
    ///
    /// A node stuck in Provisioning (an earlier attempt failed or the
    /// process restarted mid-call) is launched again under the same key.
    pub async fn launch(&self, node_id: &str) -> FleetResult<LaunchOutcome> {
        let node = self.get(node_id)?;
        match node.status {
            NodeStatus::Requested => {
                self.nodes
                    .transition(node_id, NodeStatus::Provisioning, "launch dispatched")?;
                self.logs.info(
                    node_id,
                    LogPhase::Provisioning,
                    format!("requesting instance from {}", node.provider),
                    10,
                );
            }
            NodeStatus::Provisioning => {}
            _ => return Ok(LaunchOutcome::Skipped(node)),
        }

        let request = LaunchRequest::from(&node);
        let launched = match self.provisioner.launch(&request).await {
            Ok(instance) => instance,
            Err(e) => {
                warn!(%node_id, error = %e, retryable = e.is_retryable(), "launch failed");
                self.logs.warn(node_id, LogPhase::Provisioning, format!("launch attempt failed: {e}"));
                return Ok(LaunchOutcome::Error(e));
            }
        };

        // The node may have been cancelled while the call was in flight.
        if self.get(node_id)?.status != NodeStatus::Provisioning {
            warn!(%node_id, instance_id = %launched.instance_id, "node left provisioning during launch, releasing instance");
            if let Err(e) = self.provisioner.terminate(node_id, Some(&launched.instance_id)).await {
                warn!(%node_id, error = %e, "release of orphaned instance failed");
            }
            return Ok(LaunchOutcome::Skipped(self.get(node_id)?));
        }

        self.nodes.update(node_id, |n| {
            n.instance_id = Some(launched.instance_id.clone());
            n.endpoint = launched.endpoint.clone();
            n.spot_price = launched.spot_price;
            if let Some(kind) = &launched.instance_type {
                n.instance_type = kind.clone();
            }
        })?;
        let node = self
            .nodes
            .transition(node_id, NodeStatus::Booting, "resource acquired")?;
        self.logs.info(
            node_id,
            LogPhase::InstanceReady,
            format!("instance {} acquired", launched.instance_id),
            40,
        );
        self.logs
            .info(node_id, LogPhase::ModelLoading, format!("loading {}", node.model), 60);
        Ok(LaunchOutcome::Booting(node))
    }

    /// Booting → Healthy once the node has both heartbeated and passed a probe.
    pub fn promote(&self, node_id: &str) -> FleetResult<Node> {
        self.logs
            .info(node_id, LogPhase::HealthCheck, "heartbeat and health probe received", 90);
        let node = self
            .nodes
            .transition(node_id, NodeStatus::Healthy, "heartbeat and probe passed")?;
        self.logs.info(node_id, LogPhase::Active, "node is serving", 100);
        Ok(node)
    }

    /// Release the node's instance, if it holds one, and mark it Failed.
    ///
    /// On a provisioning error the node keeps its status and the error is
    /// returned for the caller to retry.
    pub async fn fail(&self, node_id: &str, reason: &str) -> FleetResult<Node> {
        let node = self.get(node_id)?;
        if node.status.is_terminal() {
            return Ok(node);
        }
        if let Some(instance_id) = node.instance_id.as_deref() {
            self.provisioner.terminate(node_id, Some(instance_id)).await?;
            info!(%node_id, %instance_id, "instance released");
        }
        self.abandon(node_id, reason)
    }

    /// Mark a node Failed without contacting the backend: its launch never
    /// produced an instance, or releasing it has been given up on.
    pub fn abandon(&self, node_id: &str, reason: &str) -> FleetResult<Node> {
        let node = self.nodes.transition(node_id, NodeStatus::Failed, reason)?;
        self.logs.error(node_id, LogPhase::Failed, "node failed", reason);
        self.forget(node_id);
        Ok(node)
    }

    /// Healthy or Degraded → Draining.
    pub fn drain(&self, node_id: &str, reason: &str) -> FleetResult<Node> {
        let node = self.get(node_id)?;
        match node.status {
            NodeStatus::Draining => Ok(node),
            NodeStatus::Healthy | NodeStatus::Degraded => {
                let node = self.nodes.transition(node_id, NodeStatus::Draining, reason)?;
                self.logs.info(node_id, LogPhase::Active, format!("draining: {reason}"), 100);
                Ok(node)
            }
            other => Err(FleetError::InvalidAction(format!(
                "node {node_id} is {other} and cannot be drained"
            ))),
        }
    }

    /// Release the node's resource and mark it Terminated.
    ///
    /// On a provisioning error the node keeps its status and the error is
    /// returned for the caller to retry.
    pub async fn terminate(&self, node_id: &str, reason: &str) -> FleetResult<Node> {
        let node = self.get(node_id)?;
        if node.status.is_terminal() {
            return Ok(node);
        }
        if matches!(node.status, NodeStatus::Healthy | NodeStatus::Degraded) {
            self.nodes.transition(node_id, NodeStatus::Draining, reason)?;
        }
        if node.status != NodeStatus::Requested {
            self.provisioner
                .terminate(node_id, node.instance_id.as_deref())
                .await?;
        }
        let node = self.nodes.transition(node_id, NodeStatus::Terminated, reason)?;
        self.logs
            .error(node_id, LogPhase::Failed, "node terminated", reason);
        self.forget(node_id);
        Ok(node)
    }

    /// Take a node out of a fleet: drain it if it is serving, otherwise
    /// cancel or terminate it outright.
    pub async fn retire(&self, node_id: &str, reason: &str) -> FleetResult<Node> {
        let node = self.get(node_id)?;
        match node.status {
            NodeStatus::Healthy | NodeStatus::Degraded => self.drain(node_id, reason),
            NodeStatus::Draining => Ok(node),
            _ => self.terminate(node_id, reason).await,
        }
    }

    fn forget(&self, node_id: &str) {
        self.safety.forget(node_id);
        self.load.forget(node_id);
    }

    fn get(&self, node_id: &str) -> FleetResult<Node> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| FleetError::NodeNotFound(node_id.to_string()))
    }
}
