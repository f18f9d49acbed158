//! Router: admission, node selection and response shaping.
//!
//! ```text
//! route(request)
//!   ├─ CapacityAllocator::evaluate_fit ── deny ──> RouteOutcome::Denied
//!   ├─ Scheduler::select_node ── NoHealthyNodes ──> Fallback::respond
//!   └─ Routed { response, LoadGuard } + usage bucket update
//! ```

use std::sync::Arc;

use infergrid_state::{Clock, InferenceRequest, Node, StateStore, hour_of};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::allocator::CapacityAllocator;
use crate::error::SchedulerError;
use crate::load_balancer::LoadGuard;
use crate::scheduler::Scheduler;

/// Body returned for a routed (or degraded) request.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RouteResponse {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub message: String,
    pub degraded: bool,
}

impl RouteResponse {
    fn routed(request: &InferenceRequest, node: &Node) -> Self {
        Self {
            model: request.model.clone(),
            provider: Some(node.provider.clone()),
            region: Some(node.region.clone()),
            node_id: Some(node.id.clone()),
            endpoint: node.endpoint.clone(),
            message: format!("routed to {} ({})", node.id, node.region),
            degraded: false,
        }
    }
}

/// Why admission rejected a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionDenial {
    pub tenant_id: String,
    pub reserved_tokens_per_second: u64,
    pub requested_tokens: u64,
}

pub enum RouteOutcome {
    Routed {
        response: RouteResponse,
        /// Keeps the node's in-flight count raised until dropped.
        lease: LoadGuard,
    },
    Denied(AdmissionDenial),
    Fallback(RouteResponse),
}

/// What to answer when no healthy node can take a request.
pub trait Fallback: Send + Sync {
    fn respond(&self, request: &InferenceRequest) -> RouteResponse;
}

/// Well-formed degraded response naming the requested model and region.
#[derive(Debug, Default, Clone, Copy)]
pub struct DegradedFallback;

impl Fallback for DegradedFallback {
    fn respond(&self, request: &InferenceRequest) -> RouteResponse {
        RouteResponse {
            model: request.model.clone(),
            provider: None,
            region: request.region.clone(),
            node_id: None,
            endpoint: None,
            message: "fallback response".to_string(),
            degraded: true,
        }
    }
}

pub struct Router {
    allocator: Arc<CapacityAllocator>,
    scheduler: Arc<Scheduler>,
    fallback: Arc<dyn Fallback>,
    usage: Option<StateStore>,
    clock: Arc<dyn Clock>,
}

impl Router {
    pub fn new(
        allocator: Arc<CapacityAllocator>,
        scheduler: Arc<Scheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            allocator,
            scheduler,
            fallback: Arc::new(DegradedFallback),
            usage: None,
            clock,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn Fallback>) -> Self {
        self.fallback = fallback;
        self
    }

    /// Record hourly usage for every routed request in `store`.
    pub fn with_usage_store(mut self, store: StateStore) -> Self {
        self.usage = Some(store);
        self
    }

    pub fn route(&self, request: &InferenceRequest) -> RouteOutcome {
        if !self.allocator.evaluate_fit(request) {
            let reserved = self
                .allocator
                .get(&request.tenant_id)
                .map(|r| r.tokens_per_second)
                .unwrap_or_default();
            info!(
                tenant = %request.tenant_id,
                requested = request.prompt_tokens,
                reserved,
                "admission denied"
            );
            return RouteOutcome::Denied(AdmissionDenial {
                tenant_id: request.tenant_id.clone(),
                reserved_tokens_per_second: reserved,
                requested_tokens: request.prompt_tokens,
            });
        }

        match self.scheduler.select_node(request) {
            Ok(node) => {
                let lease = self.scheduler.load().acquire(&node.id, request.prompt_tokens);
                self.record_usage(request, &node);
                RouteOutcome::Routed {
                    response: RouteResponse::routed(request, &node),
                    lease,
                }
            }
            Err(SchedulerError::NoHealthyNodes { .. }) => {
                debug!(model = %request.model, region = ?request.region, "no healthy nodes, using fallback");
                RouteOutcome::Fallback(self.fallback.respond(request))
            }
            Err(e) => {
                warn!(error = %e, model = %request.model, "scheduling failed, using fallback");
                RouteOutcome::Fallback(self.fallback.respond(request))
            }
        }
    }

    fn record_usage(&self, request: &InferenceRequest, node: &Node) {
        let Some(store) = &self.usage else {
            return;
        };
        let hour = hour_of(self.clock.now());
        let cost_micros = cost_micros(request.prompt_tokens, node.spot_price);
        if let Err(e) = store.record_usage(&request.tenant_id, hour, request.prompt_tokens, cost_micros) {
            warn!(error = %e, tenant = %request.tenant_id, "usage not recorded");
        }
    }
}

/// `tokens * price / 1e6` dollars, in millionths of a dollar.
pub fn cost_micros(tokens: u64, spot_price: f64) -> u64 {
    let micros = tokens as f64 * spot_price;
    if micros.is_finite() && micros > 0.0 {
        micros.round() as u64
    } else {
        0
    }
}
