//! Scheduler: picks the node that serves a request.
//!
//! Candidates are Healthy nodes serving the requested model (and region,
//! when the request names one). Ranking, lowest first:
//!
//! 1. queue depth
//! 2. active requests (the larger of the node's own report and the
//!    router's in-flight count)
//! 3. spot price
//! 4. node id
//!
//! The last key makes the choice deterministic for a given snapshot.

use std::sync::Arc;

use infergrid_state::{InferenceRequest, Node, NodeRegistry, NodeStatus};
use tracing::debug;

use crate::error::{SchedulerError, SchedulerResult};
use crate::load_balancer::LoadTracker;

pub struct Scheduler {
    registry: Arc<NodeRegistry>,
    load: LoadTracker,
}

impl Scheduler {
    pub fn new(registry: Arc<NodeRegistry>, load: LoadTracker) -> Self {
        Self { registry, load }
    }

    pub fn load(&self) -> &LoadTracker {
        &self.load
    }

    /// Select a target node for `request`.
    ///
    /// Takes a snapshot of the registry and ranks outside the lock.
    pub fn select_node(&self, request: &InferenceRequest) -> SchedulerResult<Node> {
        let snapshot = self.registry.snapshot();
        let selected = select_from(&snapshot, request, |id| self.load.in_flight(id))
            .cloned()
            .ok_or_else(|| SchedulerError::NoHealthyNodes {
                model: request.model.clone(),
                region: request.region.clone(),
            })?;
        debug!(
            node_id = %selected.id,
            model = %request.model,
            queue_depth = selected.queue_depth,
            "node selected"
        );
        Ok(selected)
    }
}

fn is_candidate(node: &Node, request: &InferenceRequest) -> bool {
    node.status == NodeStatus::Healthy
        && node.model == request.model
        && request
            .region
            .as_deref()
            .is_none_or(|region| node.region == region)
}

/// Rank `nodes` for `request` and return the best candidate.
///
/// `in_flight` reports the router's own count of requests in flight on a
/// node.
pub fn select_from<'a, F>(nodes: &'a [Node], request: &InferenceRequest, in_flight: F) -> Option<&'a Node>
where
    F: Fn(&str) -> u32,
{
    nodes
        .iter()
        .filter(|n| is_candidate(n, request))
        .map(|n| (n, n.active_requests.max(in_flight(&n.id))))
        .min_by(|(a, a_active), (b, b_active)| {
            a.queue_depth
                .cmp(&b.queue_depth)
                .then(a_active.cmp(b_active))
                .then(a.spot_price.total_cmp(&b.spot_price))
                .then_with(|| a.id.cmp(&b.id))
        })
        .map(|(n, _)| n)
}
