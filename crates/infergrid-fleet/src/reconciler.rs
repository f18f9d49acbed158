//! Reconciler: converges the observed node set on the desired fleet specs.
//!
//! One tick, in order:
//!
//! 1. Ghost detection: active nodes whose instance the backend no longer
//!    reports get an unhealthy `cloud` signal.
//! 2. Health transitions: Booting → Healthy, Healthy ⇄ Degraded,
//!    Degraded → Draining.
//! 3. Boot timeouts: release the instance of a node stuck in Booting and
//!    fail it.
//! 4. Fleet diff per (tenant, model): create `Requested` nodes up to
//!    `min_nodes`, retire nodes above `max_nodes`.
//! 5. Launch dispatch for every `Requested`/`Provisioning` node whose
//!    retry is due, concurrently.
//! 6. Drain completion: terminate drained nodes.
//! 7. Log retention: drop launch logs of nodes that ended long ago.
//!
//! Failed provisioning calls are retried with `base * 2^attempt` backoff.
//! After `max_retries` failures the action is abandoned, a
//! `reconciler.alert` event is published and the node is failed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use infergrid_core::{ReconcilerSettings, SafetySettings};
use infergrid_health::{Assessment, SignalKind};
use infergrid_state::{DesiredFleetSpec, Event, EventKind, Node, NodeStatus, StateStore, fleet_key};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{FleetError, FleetResult};
use crate::lifecycle::{LaunchOutcome, Lifecycle, new_node_id};
use crate::provisioner::{ProvisionError, backoff};

/// Timing and retry policy for the reconciler.
#[derive(Debug, Clone)]
pub struct FleetPolicy {
    pub interval: Duration,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub drain_timeout: Duration,
    pub boot_timeout: Duration,
    /// How long a Degraded node may stay unsafe before it is drained.
    pub observation_window: Duration,
    /// How long a terminal node's launch log is kept.
    pub log_retention: Duration,
}

impl Default for FleetPolicy {
    fn default() -> Self {
        Self::from_settings(&ReconcilerSettings::default(), &SafetySettings::default())
    }
}

impl FleetPolicy {
    pub fn from_settings(reconciler: &ReconcilerSettings, safety: &SafetySettings) -> Self {
        Self {
            interval: reconciler.interval(),
            max_retries: reconciler.max_retries.max(1),
            base_backoff: reconciler.base_backoff(),
            max_backoff: reconciler.max_backoff(),
            drain_timeout: reconciler.drain_timeout(),
            boot_timeout: reconciler.boot_timeout(),
            observation_window: safety.observation_window(),
            log_retention: reconciler.log_retention(),
        }
    }
}

/// What one tick did, by node id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub created: Vec<String>,
    pub launched: Vec<String>,
    pub healthy: Vec<String>,
    pub degraded: Vec<String>,
    pub draining: Vec<String>,
    pub terminated: Vec<String>,
    pub failed: Vec<String>,
    pub retrying: Vec<String>,
    pub alerts: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct RetryState {
    attempts: u32,
    next_attempt_at: u64,
}

pub struct Reconciler {
    lifecycle: Arc<Lifecycle>,
    store: StateStore,
    policy: FleetPolicy,
    /// Failed corrective actions awaiting retry, by node id.
    retries: Mutex<HashMap<String, RetryState>>,
}

impl Reconciler {
    pub fn new(lifecycle: Arc<Lifecycle>, store: StateStore, policy: FleetPolicy) -> Self {
        Self {
            lifecycle,
            store,
            policy,
            retries: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &FleetPolicy {
        &self.policy
    }

    pub async fn tick(&self) -> FleetResult<TickReport> {
        let mut report = TickReport::default();
        self.detect_ghosts().await;
        self.apply_health(&mut report);
        self.fail_stalled_boots(&mut report).await;
        self.converge(&mut report).await?;
        self.dispatch_launches(&mut report).await;
        self.complete_drains(&mut report).await;
        self.prune_logs();
        if report != TickReport::default() {
            info!(
                created = report.created.len(),
                launched = report.launched.len(),
                healthy = report.healthy.len(),
                draining = report.draining.len(),
                terminated = report.terminated.len(),
                failed = report.failed.len(),
                alerts = report.alerts.len(),
                "reconcile tick"
            );
        }
        Ok(report)
    }

    /// Run ticks every `policy.interval` until `shutdown` flips. A tick in
    /// progress finishes before the loop exits.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.policy.interval, "reconciler started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.policy.interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "reconcile tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("reconciler shutting down");
                    break;
                }
            }
        }
    }

    fn now(&self) -> u64 {
        self.lifecycle.nodes().now()
    }

    async fn detect_ghosts(&self) {
        let live = match self.lifecycle.live_instances().await {
            Ok(live) => live,
            Err(e) => {
                debug!(error = %e, "instance listing unavailable, skipping ghost detection");
                return;
            }
        };
        for node in self.lifecycle.nodes().snapshot() {
            if !matches!(
                node.status,
                NodeStatus::Booting | NodeStatus::Healthy | NodeStatus::Degraded
            ) {
                continue;
            }
            let Some(instance_id) = node.instance_id.as_deref() else {
                continue;
            };
            if !live.contains(instance_id) {
                warn!(node_id = %node.id, %instance_id, "instance no longer reported by provider");
                self.lifecycle.safety().record(
                    &node.id,
                    SignalKind::Cloud,
                    false,
                    format!("instance {instance_id} not found"),
                );
            }
        }
    }

    fn apply_health(&self, report: &mut TickReport) {
        let now = self.now();
        let safety = self.lifecycle.safety().clone();
        for node in self.lifecycle.nodes().snapshot() {
            let in_state = now.saturating_sub(node.status_since);
            let result = match node.status {
                NodeStatus::Booting if node.last_heartbeat.is_some() && node.probe_passed => self
                    .lifecycle
                    .promote(&node.id)
                    .map(|_| report.healthy.push(node.id.clone())),
                NodeStatus::Healthy if safety.assess(&node.id) == Assessment::Unsafe => self
                    .lifecycle
                    .nodes()
                    .transition(&node.id, NodeStatus::Degraded, "safety consensus: unsafe")
                    .map(|_| report.degraded.push(node.id.clone()))
                    .map_err(FleetError::from),
                NodeStatus::Degraded => match safety.assess(&node.id) {
                    Assessment::Safe => self
                        .lifecycle
                        .nodes()
                        .transition(&node.id, NodeStatus::Healthy, "safety consensus: safe")
                        .map(|_| report.healthy.push(node.id.clone()))
                        .map_err(FleetError::from),
                    Assessment::Unsafe if in_state >= self.policy.observation_window.as_secs() => self
                        .lifecycle
                        .drain(&node.id, "unsafe beyond observation window")
                        .map(|_| report.draining.push(node.id.clone())),
                    // Pending holds the node where it is.
                    _ => Ok(()),
                },
                _ => Ok(()),
            };
            if let Err(e) = result {
                warn!(node_id = %node.id, error = %e, "health transition failed");
            }
        }
    }

    async fn fail_stalled_boots(&self, report: &mut TickReport) {
        let now = self.now();
        let boot_timeout = self.policy.boot_timeout.as_secs();
        let stalled: Vec<String> = {
            let retries = self.retries.lock();
            self.lifecycle
                .nodes()
                .snapshot()
                .into_iter()
                .filter(|n| n.status == NodeStatus::Booting)
                .filter(|n| now.saturating_sub(n.status_since) >= boot_timeout)
                .filter(|n| retries.get(&n.id).is_none_or(|r| r.next_attempt_at <= now))
                .map(|n| n.id)
                .collect()
        };

        for node_id in stalled {
            match self.lifecycle.fail(&node_id, "boot timeout").await {
                Ok(_) => {
                    self.retries.lock().remove(&node_id);
                    report.failed.push(node_id);
                }
                Err(FleetError::Provision(e)) => self.on_release_error(&node_id, "release", &e, report),
                Err(e) => warn!(%node_id, error = %e, "boot timeout failed"),
            }
        }
    }

    async fn converge(&self, report: &mut TickReport) -> FleetResult<()> {
        let specs = self.store.list_fleet_specs()?;
        let snapshot = self.lifecycle.nodes().snapshot();
        let mut by_fleet: HashMap<String, Vec<&Node>> = HashMap::new();
        for node in snapshot.iter().filter(|n| n.status.is_active()) {
            by_fleet
                .entry(fleet_key(&node.tenant_id, &node.model))
                .or_default()
                .push(node);
        }

        for spec in &specs {
            let active = by_fleet.remove(&spec.table_key()).unwrap_or_default();
            let count = active.len() as u32;
            if count < spec.min_nodes {
                for i in 0..(spec.min_nodes - count) {
                    let node = plan_node(spec, (count + i) as usize, self.now());
                    match self.lifecycle.create(node) {
                        Ok(node) => report.created.push(node.id),
                        Err(e) => warn!(fleet = %spec.table_key(), error = %e, "node creation failed"),
                    }
                }
            } else if count > spec.max_nodes {
                let excess = (count - spec.max_nodes) as usize;
                for node in retirement_order(active).into_iter().take(excess) {
                    self.retire(node, "scale down", report).await;
                }
            }
        }
        Ok(())
    }

    async fn retire(&self, node: &Node, reason: &str, report: &mut TickReport) {
        match self.lifecycle.retire(&node.id, reason).await {
            Ok(n) if n.status == NodeStatus::Draining => report.draining.push(n.id),
            Ok(n) => report.terminated.push(n.id),
            Err(e) => warn!(node_id = %node.id, error = %e, "retire failed"),
        }
    }

    async fn dispatch_launches(&self, report: &mut TickReport) {
        let now = self.now();
        let due: Vec<String> = {
            let retries = self.retries.lock();
            self.lifecycle
                .nodes()
                .snapshot()
                .into_iter()
                .filter(|n| matches!(n.status, NodeStatus::Requested | NodeStatus::Provisioning))
                .filter(|n| retries.get(&n.id).is_none_or(|r| r.next_attempt_at <= now))
                .map(|n| n.id)
                .collect()
        };
        if due.is_empty() {
            return;
        }

        let outcomes = join_all(due.iter().map(|id| self.lifecycle.launch(id))).await;
        for (node_id, outcome) in due.iter().zip(outcomes) {
            match outcome {
                Ok(LaunchOutcome::Booting(_)) => {
                    self.retries.lock().remove(node_id);
                    report.launched.push(node_id.clone());
                }
                Ok(LaunchOutcome::Skipped(_)) => {}
                Ok(LaunchOutcome::Error(e)) => {
                    self.on_launch_error(node_id, &e, report);
                }
                Err(e) => warn!(%node_id, error = %e, "launch dispatch failed"),
            }
        }
    }

    fn on_launch_error(&self, node_id: &str, error: &ProvisionError, report: &mut TickReport) {
        if !error.is_retryable() {
            self.retries.lock().remove(node_id);
            match self.lifecycle.abandon(node_id, &error.to_string()) {
                Ok(_) => report.failed.push(node_id.to_string()),
                Err(e) => warn!(%node_id, error = %e, "could not fail node"),
            }
            return;
        }
        match self.record_failure(node_id, "launch", error) {
            Some(_) => report.retrying.push(node_id.to_string()),
            None => {
                report.alerts.push(node_id.to_string());
                match self.lifecycle.abandon(node_id, &format!("launch abandoned: {error}")) {
                    Ok(_) => report.failed.push(node_id.to_string()),
                    Err(e) => warn!(%node_id, error = %e, "could not fail node"),
                }
            }
        }
    }

    /// A backend call that should have released a node's instance failed.
    /// Retry it with backoff; once retries run out, fail the node so it stops
    /// being retried.
    fn on_release_error(&self, node_id: &str, action: &str, error: &ProvisionError, report: &mut TickReport) {
        if self.record_failure(node_id, action, error).is_some() {
            report.retrying.push(node_id.to_string());
            return;
        }
        report.alerts.push(node_id.to_string());
        match self.lifecycle.abandon(node_id, &format!("{action} abandoned: {error}")) {
            Ok(_) => report.failed.push(node_id.to_string()),
            Err(e) => warn!(%node_id, error = %e, "could not fail node"),
        }
    }

    /// Count a failed attempt. Returns the next attempt time, or `None`
    /// (after publishing an alert) once retries are exhausted.
    fn record_failure(&self, node_id: &str, action: &str, error: &ProvisionError) -> Option<u64> {
        let now = self.now();
        let attempts = {
            let mut retries = self.retries.lock();
            let state = retries.entry(node_id.to_string()).or_insert(RetryState {
                attempts: 0,
                next_attempt_at: now,
            });
            state.attempts += 1;
            if state.attempts >= self.policy.max_retries {
                let attempts = state.attempts;
                retries.remove(node_id);
                Err(attempts)
            } else {
                let delay = backoff(self.policy.base_backoff, self.policy.max_backoff, state.attempts - 1);
                state.next_attempt_at = now + ceil_secs(delay);
                Ok(state.next_attempt_at)
            }
        };

        match attempts {
            Ok(next) => {
                debug!(%node_id, action, retry_at = next, "provisioning retry scheduled");
                Some(next)
            }
            Err(attempts) => {
                error!(%node_id, action, attempts, error = %error, "provisioning retries exhausted");
                let tenant = self
                    .lifecycle
                    .nodes()
                    .get(node_id)
                    .map(|n| n.tenant_id)
                    .unwrap_or_default();
                self.lifecycle.nodes().events().publish(
                    Event::new(
                        EventKind::ReconcilerAlert,
                        json!({ "action": action, "attempts": attempts, "error": error.to_string() }),
                    )
                    .for_node(node_id)
                    .for_tenant(tenant),
                );
                None
            }
        }
    }

    async fn complete_drains(&self, report: &mut TickReport) {
        let now = self.now();
        let drain_timeout = self.policy.drain_timeout.as_secs();
        let ready: Vec<Node> = {
            let retries = self.retries.lock();
            self.lifecycle
                .nodes()
                .snapshot()
                .into_iter()
                .filter(|n| n.status == NodeStatus::Draining)
                .filter(|n| {
                    let idle = self.lifecycle.load().in_flight(&n.id) == 0 && n.active_requests == 0;
                    idle || now.saturating_sub(n.status_since) >= drain_timeout
                })
                .filter(|n| retries.get(&n.id).is_none_or(|r| r.next_attempt_at <= now))
                .collect()
        };

        for node in ready {
            match self.lifecycle.terminate(&node.id, "drain complete").await {
                Ok(_) => {
                    self.retries.lock().remove(&node.id);
                    report.terminated.push(node.id);
                }
                Err(FleetError::Provision(e)) => self.on_release_error(&node.id, "terminate", &e, report),
                Err(e) => warn!(node_id = %node.id, error = %e, "terminate failed"),
            }
        }
    }

    fn prune_logs(&self) {
        let now = self.now();
        let retention = self.policy.log_retention.as_secs();
        let expired: Vec<String> = self
            .lifecycle
            .nodes()
            .snapshot()
            .into_iter()
            .filter(|n| n.status.is_terminal() && now.saturating_sub(n.status_since) >= retention)
            .map(|n| n.id)
            .collect();
        let pruned = self.lifecycle.logs().clear(&expired);
        if pruned > 0 {
            debug!(pruned, "expired node logs dropped");
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs() + u64::from(d.subsec_nanos() > 0)
}

/// A new node for `spec`; `index` picks the provider and region so that
/// nodes spread across the preference lists.
fn plan_node(spec: &DesiredFleetSpec, index: usize, now: u64) -> Node {
    let pick = |list: &[String]| {
        if list.is_empty() {
            "auto".to_string()
        } else {
            list[index % list.len()].clone()
        }
    };
    let mut node = Node::requested(
        new_node_id(),
        spec.tenant_id.clone(),
        spec.model.clone(),
        pick(&spec.providers),
        pick(&spec.regions),
        now,
    );
    if let Some(kind) = &spec.instance_type {
        node.instance_type = kind.clone();
    }
    node
}

/// Nodes to remove first: ones not yet serving, then degraded, then the
/// newest healthy.
fn retirement_order(mut nodes: Vec<&Node>) -> Vec<&Node> {
    fn rank(status: NodeStatus) -> u8 {
        match status {
            NodeStatus::Requested => 0,
            NodeStatus::Provisioning => 1,
            NodeStatus::Booting => 2,
            NodeStatus::Degraded => 3,
            _ => 4,
        }
    }
    nodes.sort_by(|a, b| {
        rank(a.status)
            .cmp(&rank(b.status))
            .then(b.created_at.cmp(&a.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    nodes
}
