//! Health monitor: background probe loop, staleness sweep, and the entry
//! points through which node agents and cloud notices feed the safety
//! monitor.
//!
//! Probes for all due nodes run concurrently and never under a lock: the
//! targets are collected from a registry snapshot first, then probed, then
//! the results are applied.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use infergrid_state::{Event, EventKind, Node, NodeRegistry, NodeStatus};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::checker::{ProbeBackoff, ProbeResult, http_probe};
use crate::error::{HealthError, HealthResult};
use crate::registry::{HealthRegistry, HeartbeatReport};
use crate::safety::{Assessment, SafetyMonitor, SignalKind};

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub probe_path: String,
    pub probe_timeout: Duration,
    pub probe_interval: Duration,
    pub sweep_interval: Duration,
    pub staleness_threshold: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            probe_path: "/health".to_string(),
            probe_timeout: Duration::from_secs(2),
            probe_interval: Duration::from_secs(15),
            sweep_interval: Duration::from_secs(30),
            staleness_threshold: Duration::from_secs(300),
        }
    }
}

struct ProbeSlot {
    backoff: ProbeBackoff,
    next_due: u64,
}

pub struct HealthMonitor {
    nodes: Arc<NodeRegistry>,
    registry: HealthRegistry,
    safety: Arc<SafetyMonitor>,
    settings: MonitorSettings,
    /// Per-node probe state: node_id → backoff and next due time.
    probes: Mutex<HashMap<String, ProbeSlot>>,
}

impl HealthMonitor {
    pub fn new(nodes: Arc<NodeRegistry>, safety: Arc<SafetyMonitor>, settings: MonitorSettings) -> Self {
        Self {
            registry: HealthRegistry::new(nodes.clone()),
            nodes,
            safety,
            settings,
            probes: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &HealthRegistry {
        &self.registry
    }

    pub fn safety(&self) -> &Arc<SafetyMonitor> {
        &self.safety
    }

    /// Apply a node agent heartbeat and feed it to the safety monitor.
    pub fn observe_heartbeat(&self, node_id: &str, report: &HeartbeatReport) -> HealthResult<Node> {
        let node = self.registry.report(node_id, report)?;
        let detail = format!("health_score {:.2}", report.health_score);
        self.safety
            .record(node_id, SignalKind::Heartbeat, report.is_healthy(), detail);
        Ok(node)
    }

    /// A provider warned that the node's spot instance is about to be
    /// reclaimed.
    pub fn termination_warning(&self, node_id: &str, detail: &str) -> HealthResult<Assessment> {
        let node = self
            .nodes
            .get(node_id)
            .ok_or_else(|| HealthError::NodeNotFound(node_id.to_string()))?;
        warn!(%node_id, provider = %node.provider, %detail, "spot termination warning");
        self.nodes.events().publish(
            Event::new(
                EventKind::CostAnomalyDetected,
                json!({ "reason": "spot_termination_notice", "detail": detail, "provider": node.provider }),
            )
            .for_node(node_id)
            .for_tenant(node.tenant_id.clone()),
        );
        Ok(self.safety.record(node_id, SignalKind::Cloud, false, detail))
    }

    /// Probe every node that is due and apply the results. Returns the
    /// number of nodes probed.
    pub async fn probe_once(&self) -> usize {
        let now = self.nodes.now();
        let snapshot = self.nodes.snapshot();
        let targets: Vec<(String, String)> = {
            let mut probes = self.probes.lock();
            probes.retain(|id, _| snapshot.iter().any(|n| &n.id == id && is_probed(n)));
            snapshot
                .iter()
                .filter(|n| is_probed(n))
                .filter_map(|n| n.endpoint.as_ref().map(|e| (n.id.clone(), e.clone())))
                .filter(|(id, _)| probes.get(id).is_none_or(|slot| slot.next_due <= now))
                .collect()
        };
        if targets.is_empty() {
            return 0;
        }

        let path = self.settings.probe_path.as_str();
        let timeout = self.settings.probe_timeout;
        let results = join_all(targets.iter().map(|(id, endpoint)| async move {
            (id.as_str(), http_probe(endpoint, path, timeout).await)
        }))
        .await;

        for (node_id, result) in &results {
            self.apply_probe(node_id, *result, now);
        }
        debug!(probed = results.len(), "probe pass complete");
        results.len()
    }

    fn apply_probe(&self, node_id: &str, result: ProbeResult, now: u64) {
        {
            let mut probes = self.probes.lock();
            let slot = probes.entry(node_id.to_string()).or_insert_with(|| ProbeSlot {
                backoff: ProbeBackoff::new(self.settings.probe_interval),
                next_due: now,
            });
            slot.next_due = now + slot.backoff.record(result).as_secs();
        }

        let passed = result.is_healthy();
        if let Err(e) = self.nodes.update(node_id, |n| n.probe_passed = passed) {
            debug!(%node_id, error = %e, "probe result for departed node");
            return;
        }
        self.safety
            .record(node_id, SignalKind::Probe, passed, format!("{result:?}").to_lowercase());
    }

    /// Mark nodes whose heartbeat has gone stale. Returns their ids.
    pub fn sweep_once(&self) -> Vec<String> {
        let now = self.nodes.now();
        let stale = self.registry.stale_nodes(self.settings.staleness_threshold);
        for node in &stale {
            let age = node.heartbeat_age(now).unwrap_or_default();
            self.safety.record(
                &node.id,
                SignalKind::Heartbeat,
                false,
                format!("no heartbeat for {age}s"),
            );
        }
        stale.into_iter().map(|n| n.id).collect()
    }

    /// Run the probe loop until `shutdown` flips.
    pub async fn run_probes(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.settings.probe_interval, "probe loop started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.settings.probe_interval) => {
                    self.probe_once().await;
                }
                _ = shutdown.changed() => {
                    debug!("probe loop shutting down");
                    break;
                }
            }
        }
    }

    /// Run the staleness sweep until `shutdown` flips.
    pub async fn run_sweep(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.settings.sweep_interval, "staleness sweep started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.settings.sweep_interval) => {
                    let stale = self.sweep_once();
                    if !stale.is_empty() {
                        debug!(?stale, "stale heartbeats recorded");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("staleness sweep shutting down");
                    break;
                }
            }
        }
    }
}

fn is_probed(node: &Node) -> bool {
    matches!(
        node.status,
        NodeStatus::Booting | NodeStatus::Healthy | NodeStatus::Degraded
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use infergrid_state::{EventBus, ManualClock, StateStore};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct Fixture {
        nodes: Arc<NodeRegistry>,
        clock: Arc<ManualClock>,
        monitor: Arc<HealthMonitor>,
        events: EventBus,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(50_000));
        let events = EventBus::default();
        let nodes = Arc::new(NodeRegistry::new(
            StateStore::open_in_memory().unwrap(),
            events.clone(),
            clock.clone(),
        ));
        let safety = Arc::new(SafetyMonitor::new(2, Duration::from_secs(120), events.clone(), clock.clone()));
        let settings = MonitorSettings {
            probe_interval: Duration::from_secs(10),
            ..Default::default()
        };
        let monitor = Arc::new(HealthMonitor::new(nodes.clone(), safety, settings));
        Fixture {
            nodes,
            clock,
            monitor,
            events,
        }
    }

    fn add_booting(nodes: &NodeRegistry, id: &str, endpoint: &str) {
        let mut node = Node::requested(id, "t1", "m", "aws", "us", 0);
        node.status = NodeStatus::Booting;
        node.endpoint = Some(endpoint.to_string());
        nodes.insert(node).unwrap();
    }

    async fn ok_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = sock.read(&mut buf).await;
                    let _ = sock
                        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                        .await;
                });
            }
        });
        format!("http://{addr}")
    }

    async fn closed_endpoint() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn successful_probe_marks_node_and_signal() {
        let f = fixture();
        add_booting(&f.nodes, "n1", &ok_server().await);

        assert_eq!(f.monitor.probe_once().await, 1);
        assert!(f.nodes.get("n1").unwrap().probe_passed);
        let signals = f.monitor.safety().signals("n1");
        assert_eq!(signals.len(), 1);
        assert_eq!(signals[0].kind, SignalKind::Probe);
        assert!(signals[0].healthy);
    }

    #[tokio::test]
    async fn failing_probe_backs_off() {
        let f = fixture();
        add_booting(&f.nodes, "n1", &closed_endpoint().await);

        assert_eq!(f.monitor.probe_once().await, 1);
        assert!(!f.nodes.get("n1").unwrap().probe_passed);
        assert!(!f.monitor.safety().signals("n1")[0].healthy);

        // Backoff doubled the 10s interval; not due yet.
        f.clock.advance(Duration::from_secs(10));
        assert_eq!(f.monitor.probe_once().await, 0);
        f.clock.advance(Duration::from_secs(10));
        assert_eq!(f.monitor.probe_once().await, 1);
    }

    #[tokio::test]
    async fn nodes_without_endpoint_or_not_running_are_skipped() {
        let f = fixture();
        f.nodes
            .insert(Node::requested("queued", "t1", "m", "aws", "us", 0))
            .unwrap();
        let mut booting = Node::requested("no-endpoint", "t1", "m", "aws", "us", 0);
        booting.status = NodeStatus::Booting;
        f.nodes.insert(booting).unwrap();
        assert_eq!(f.monitor.probe_once().await, 0);
    }

    #[test]
    fn sweep_records_unhealthy_heartbeat_for_stale_nodes() {
        let f = fixture();
        f.nodes
            .insert(Node::requested("n1", "t1", "m", "aws", "us", 0))
            .unwrap();
        f.monitor
            .observe_heartbeat("n1", &HeartbeatReport { health_score: 1.0, ..Default::default() })
            .unwrap();
        assert!(f.monitor.safety().signals("n1")[0].healthy);

        f.clock.advance(Duration::from_secs(600));
        assert_eq!(f.monitor.sweep_once(), vec!["n1"]);
        let signals = f.monitor.safety().signals("n1");
        assert!(!signals[0].healthy);
        assert_eq!(signals[0].detail, "no heartbeat for 600s");
    }

    #[tokio::test]
    async fn termination_warning_feeds_cloud_signal_and_event() {
        let f = fixture();
        f.nodes
            .insert(Node::requested("n1", "t1", "m", "aws", "us", 0))
            .unwrap();
        let mut rx = f.events.subscribe();

        let assessment = f.monitor.termination_warning("n1", "2 minute notice").unwrap();
        assert_eq!(assessment, Assessment::Pending);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::CostAnomalyDetected);
        assert_eq!(event.tenant_id.as_deref(), Some("t1"));

        let signals = f.monitor.safety().signals("n1");
        assert_eq!(signals[0].kind, SignalKind::Cloud);
        assert!(!signals[0].healthy);

        assert!(f.monitor.termination_warning("ghost", "x").is_err());
    }

    #[tokio::test]
    async fn loops_stop_on_shutdown() {
        let f = fixture();
        let (tx, rx) = watch::channel(false);
        let probes = tokio::spawn(f.monitor.clone().run_probes(rx.clone()));
        let sweep = tokio::spawn(f.monitor.clone().run_sweep(rx));
        tx.send(true).unwrap();
        probes.await.unwrap();
        sweep.await.unwrap();
    }
}
