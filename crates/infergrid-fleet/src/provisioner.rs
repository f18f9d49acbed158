//! The narrow interface to the external provisioning backend.
//!
//! Every call is keyed by node id, so a backend that sees the same launch
//! twice returns the instance it already created.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use infergrid_state::Node;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProvisionError {
    /// Worth retrying with backoff: timeouts, 5xx, capacity shortages.
    #[error("transient: {0}")]
    Retryable(String),

    /// Retrying cannot help: bad credentials, unknown instance type.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl ProvisionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProvisionError::Retryable(_))
    }
}

/// What the backend needs to launch a node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaunchRequest {
    /// Idempotency key.
    pub node_id: String,
    pub tenant_id: String,
    pub model: String,
    pub provider: String,
    pub region: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<String>,
}

impl From<&Node> for LaunchRequest {
    fn from(node: &Node) -> Self {
        Self {
            node_id: node.id.clone(),
            tenant_id: node.tenant_id.clone(),
            model: node.model.clone(),
            provider: node.provider.clone(),
            region: node.region.clone(),
            instance_type: (!node.instance_type.is_empty()).then(|| node.instance_type.clone()),
        }
    }
}

/// The resource the backend acquired for a launch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaunchedInstance {
    pub instance_id: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub spot_price: f64,
    #[serde(default)]
    pub instance_type: Option<String>,
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    fn name(&self) -> &'static str;

    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchedInstance, ProvisionError>;

    /// Release the node's resource. Terminating an unknown or already
    /// terminated instance succeeds.
    async fn terminate(&self, node_id: &str, instance_id: Option<&str>) -> Result<(), ProvisionError>;

    /// Ids of every instance the backend currently knows to be running.
    async fn live_instances(&self) -> Result<HashSet<String>, ProvisionError>;
}

/// `base * 2^attempt`, capped at `max`.
pub fn backoff(base: Duration, max: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(max)
}

/// Stand-in used when no backend is configured. Launches never succeed;
/// externally started nodes can still join through registration.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledProvisioner;

#[async_trait]
impl Provisioner for DisabledProvisioner {
    fn name(&self) -> &'static str {
        "disabled"
    }

    async fn launch(&self, _request: &LaunchRequest) -> Result<LaunchedInstance, ProvisionError> {
        Err(ProvisionError::Retryable("no provisioning backend configured".to_string()))
    }

    async fn terminate(&self, _node_id: &str, _instance_id: Option<&str>) -> Result<(), ProvisionError> {
        Ok(())
    }

    async fn live_instances(&self) -> Result<HashSet<String>, ProvisionError> {
        Err(ProvisionError::Retryable("no provisioning backend configured".to_string()))
    }
}

#[derive(Default)]
struct FakeState {
    launches: Vec<LaunchRequest>,
    terminations: Vec<String>,
    instances: HashMap<String, LaunchedInstance>,
    live: HashSet<String>,
    launch_failures: VecDeque<ProvisionError>,
    terminate_failures: VecDeque<ProvisionError>,
    spot_price: f64,
}

/// Scripted in-memory backend for tests and local runs.
///
/// Records every call, returns one instance per node id, and can be told
/// to fail the next calls.
#[derive(Default)]
pub struct FakeProvisioner {
    state: Mutex<FakeState>,
}

impl FakeProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_spot_price(self, price: f64) -> Self {
        self.state.lock().spot_price = price;
        self
    }

    /// Fail the next `count` launch calls with `error`.
    pub fn fail_launches(&self, count: usize, error: ProvisionError) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.launch_failures.push_back(error.clone());
        }
    }

    pub fn fail_terminations(&self, count: usize, error: ProvisionError) {
        let mut state = self.state.lock();
        for _ in 0..count {
            state.terminate_failures.push_back(error.clone());
        }
    }

    /// Every launch call received, including failed and repeated ones.
    pub fn launches(&self) -> Vec<LaunchRequest> {
        self.state.lock().launches.clone()
    }

    pub fn launch_count(&self) -> usize {
        self.state.lock().launches.len()
    }

    /// Node ids passed to successful terminate calls.
    pub fn terminations(&self) -> Vec<String> {
        self.state.lock().terminations.clone()
    }

    /// Make an instance disappear as if the provider reclaimed it.
    pub fn vanish(&self, instance_id: &str) {
        self.state.lock().live.remove(instance_id);
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn launch(&self, request: &LaunchRequest) -> Result<LaunchedInstance, ProvisionError> {
        let mut state = self.state.lock();
        state.launches.push(request.clone());
        if let Some(error) = state.launch_failures.pop_front() {
            return Err(error);
        }
        if let Some(existing) = state.instances.get(&request.node_id) {
            return Ok(existing.clone());
        }
        let instance = LaunchedInstance {
            instance_id: format!("i-{:04}", state.instances.len() + 1),
            endpoint: Some(format!("http://{}.fake:8000", request.node_id)),
            spot_price: state.spot_price,
            instance_type: request.instance_type.clone(),
        };
        state.live.insert(instance.instance_id.clone());
        state.instances.insert(request.node_id.clone(), instance.clone());
        Ok(instance)
    }

    async fn terminate(&self, node_id: &str, instance_id: Option<&str>) -> Result<(), ProvisionError> {
        let mut state = self.state.lock();
        if let Some(error) = state.terminate_failures.pop_front() {
            return Err(error);
        }
        if let Some(id) = instance_id {
            state.live.remove(id);
        }
        state.terminations.push(node_id.to_string());
        Ok(())
    }

    async fn live_instances(&self) -> Result<HashSet<String>, ProvisionError> {
        Ok(self.state.lock().live.clone())
    }
}
