//! Deployment controller: applies fleet-shape changes.
//!
//! Desired fleet specs are written here and converged by the reconciler.
//! Manual node actions (launch, register, drain, terminate) go through the
//! same lifecycle driver the reconciler uses.

use std::sync::Arc;

use infergrid_health::probe_target;
use infergrid_state::{DesiredFleetSpec, Node, StateStore, fleet_key};
use serde::Deserialize;
use tracing::info;

use crate::error::{FleetError, FleetResult};
use crate::lifecycle::{Lifecycle, new_node_id};

/// Body of a desired-state upsert.
#[derive(Debug, Clone, Deserialize)]
pub struct FleetSpecRequest {
    pub tenant_id: String,
    pub model: String,
    pub min_nodes: u32,
    pub max_nodes: u32,
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default)]
    pub instance_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LaunchNodeRequest {
    pub tenant_id: String,
    pub model: String,
    pub provider: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub instance_type: Option<String>,
}

/// A node started outside the control plane that wants to join a fleet.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterNodeRequest {
    #[serde(default)]
    pub node_id: Option<String>,
    pub tenant_id: String,
    pub model: String,
    pub provider: String,
    #[serde(default)]
    pub region: Option<String>,
    pub endpoint: String,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub instance_type: Option<String>,
    #[serde(default)]
    pub spot_price: f64,
}

pub struct DeploymentController {
    lifecycle: Arc<Lifecycle>,
    store: StateStore,
}

fn require(field: &str, value: &str) -> FleetResult<()> {
    if value.trim().is_empty() {
        return Err(FleetError::InvalidSpec(format!("{field} is required")));
    }
    Ok(())
}

impl DeploymentController {
    pub fn new(lifecycle: Arc<Lifecycle>, store: StateStore) -> Self {
        Self { lifecycle, store }
    }

    pub fn lifecycle(&self) -> &Arc<Lifecycle> {
        &self.lifecycle
    }

    /// Create or replace the desired shape of a (tenant, model) fleet.
    pub fn set_spec(&self, request: FleetSpecRequest) -> FleetResult<DesiredFleetSpec> {
        require("tenant_id", &request.tenant_id)?;
        require("model", &request.model)?;
        check_bounds(request.min_nodes, request.max_nodes)?;

        let now = self.lifecycle.nodes().now();
        let created_at = self
            .store
            .get_fleet_spec(&request.tenant_id, &request.model)?
            .map_or(now, |existing| existing.created_at);
        let spec = DesiredFleetSpec {
            tenant_id: request.tenant_id,
            model: request.model,
            min_nodes: request.min_nodes,
            max_nodes: request.max_nodes,
            providers: request.providers,
            regions: request.regions,
            instance_type: request.instance_type.filter(|t| !t.is_empty()),
            created_at,
            updated_at: now,
        };
        self.store.put_fleet_spec(&spec)?;
        info!(
            fleet = %spec.table_key(),
            min = spec.min_nodes,
            max = spec.max_nodes,
            "fleet spec set"
        );
        Ok(spec)
    }

    /// Change only the node count bounds of an existing fleet.
    pub fn scale(&self, tenant_id: &str, model: &str, min_nodes: u32, max_nodes: u32) -> FleetResult<DesiredFleetSpec> {
        check_bounds(min_nodes, max_nodes)?;
        let mut spec = self.get_spec(tenant_id, model)?;
        spec.min_nodes = min_nodes;
        spec.max_nodes = max_nodes;
        spec.updated_at = self.lifecycle.nodes().now();
        self.store.put_fleet_spec(&spec)?;
        info!(fleet = %spec.table_key(), min = min_nodes, max = max_nodes, "fleet scaled");
        Ok(spec)
    }

    pub fn get_spec(&self, tenant_id: &str, model: &str) -> FleetResult<DesiredFleetSpec> {
        self.store
            .get_fleet_spec(tenant_id, model)?
            .ok_or_else(|| FleetError::DeploymentNotFound(fleet_key(tenant_id, model)))
    }

    pub fn list_specs(&self) -> FleetResult<Vec<DesiredFleetSpec>> {
        Ok(self.store.list_fleet_specs()?)
    }

    /// Remove a fleet spec and retire every node still serving it.
    /// Returns the retired nodes in their new state.
    pub async fn delete_spec(&self, tenant_id: &str, model: &str) -> FleetResult<Vec<Node>> {
        if !self.store.delete_fleet_spec(tenant_id, model)? {
            return Err(FleetError::DeploymentNotFound(fleet_key(tenant_id, model)));
        }
        let members: Vec<Node> = self
            .lifecycle
            .nodes()
            .snapshot()
            .into_iter()
            .filter(|n| n.tenant_id == tenant_id && n.model == model && n.status.is_active())
            .collect();

        let mut retired = Vec::with_capacity(members.len());
        for node in members {
            retired.push(self.lifecycle.retire(&node.id, "deployment deleted").await?);
        }
        info!(fleet = %fleet_key(tenant_id, model), retired = retired.len(), "fleet spec deleted");
        Ok(retired)
    }

    pub fn list_nodes(&self) -> Vec<Node> {
        self.lifecycle.nodes().snapshot()
    }

    pub fn get_node(&self, node_id: &str) -> FleetResult<Node> {
        self.lifecycle
            .nodes()
            .get(node_id)
            .ok_or_else(|| FleetError::NodeNotFound(node_id.to_string()))
    }

    /// Queue a one-off node. The next reconcile tick dispatches the launch.
    pub fn launch_node(&self, request: LaunchNodeRequest) -> FleetResult<Node> {
        require("tenant_id", &request.tenant_id)?;
        require("model", &request.model)?;
        require("provider", &request.provider)?;

        let mut node = Node::requested(
            new_node_id(),
            request.tenant_id,
            request.model,
            request.provider,
            request.region.unwrap_or_else(|| "auto".to_string()),
            self.lifecycle.nodes().now(),
        );
        if let Some(kind) = request.instance_type {
            node.instance_type = kind;
        }
        self.lifecycle.create(node)
    }

    /// Adopt an externally launched node. It joins in Booting and is
    /// promoted once it heartbeats and passes a probe.
    pub fn register_node(&self, request: RegisterNodeRequest) -> FleetResult<Node> {
        require("tenant_id", &request.tenant_id)?;
        require("model", &request.model)?;
        require("provider", &request.provider)?;
        if probe_target(&request.endpoint).is_none() {
            return Err(FleetError::InvalidSpec(format!(
                "endpoint must be an http URL, got {:?}",
                request.endpoint
            )));
        }

        let node_id = request.node_id.filter(|id| !id.is_empty()).unwrap_or_else(new_node_id);
        let mut node = Node::requested(
            node_id,
            request.tenant_id,
            request.model,
            request.provider,
            request.region.unwrap_or_else(|| "auto".to_string()),
            self.lifecycle.nodes().now(),
        );
        node.endpoint = Some(request.endpoint);
        node.instance_id = request.instance_id;
        node.instance_type = request.instance_type.unwrap_or_default();
        node.spot_price = request.spot_price;

        self.lifecycle.adopt(node)
    }

    pub fn drain_node(&self, node_id: &str) -> FleetResult<Node> {
        self.lifecycle.drain(node_id, "manual drain")
    }

    pub async fn terminate_node(&self, node_id: &str) -> FleetResult<Node> {
        self.lifecycle.terminate(node_id, "manual terminate").await
    }
}

fn check_bounds(min_nodes: u32, max_nodes: u32) -> FleetResult<()> {
    if min_nodes > max_nodes {
        return Err(FleetError::InvalidSpec(format!(
            "min_nodes ({min_nodes}) exceeds max_nodes ({max_nodes})"
        )));
    }
    Ok(())
}
