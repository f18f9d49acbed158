//! Safety monitor: multi-signal consensus on whether a node is safe to serve.
//!
//! Three independent signal kinds feed each node's assessment:
//!
//! | Kind        | Source                                              |
//! |-------------|-----------------------------------------------------|
//! | `heartbeat` | node agent heartbeats and the staleness sweep       |
//! | `probe`     | runtime HTTP probe of the node's endpoint           |
//! | `cloud`     | spot termination notices, vanished instances        |
//!
//! Only the latest signal per kind counts, and only while it is younger
//! than the freshness window. A stale signal is unavailable, not unhealthy.
//! With `quorum` agreeing signals the node is `Unsafe` (or `Safe`);
//! anything short of that is `Pending` and the node keeps its status.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use infergrid_state::{Clock, Event, EventBus, EventKind};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Heartbeat,
    Probe,
    Cloud,
}

impl SignalKind {
    pub const ALL: [SignalKind; 3] = [SignalKind::Heartbeat, SignalKind::Probe, SignalKind::Cloud];
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    pub kind: SignalKind,
    pub healthy: bool,
    pub observed_at: u64,
    #[serde(default)]
    pub detail: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Assessment {
    /// Not enough fresh, agreeing signals to decide either way.
    #[default]
    Pending,
    Safe,
    Unsafe,
}

/// Majority decision over the fresh signals in `signals`.
pub fn consensus(signals: &[Signal], now: u64, freshness: Duration, quorum: usize) -> Assessment {
    let window = freshness.as_secs();
    let (healthy, unhealthy) = signals
        .iter()
        .filter(|s| now.saturating_sub(s.observed_at) <= window)
        .fold((0usize, 0usize), |(h, u), s| if s.healthy { (h + 1, u) } else { (h, u + 1) });

    if unhealthy >= quorum {
        Assessment::Unsafe
    } else if healthy >= quorum {
        Assessment::Safe
    } else {
        Assessment::Pending
    }
}

#[derive(Default)]
struct NodeSafety {
    signals: HashMap<SignalKind, Signal>,
    assessment: Assessment,
}

impl NodeSafety {
    fn sorted_signals(&self) -> Vec<Signal> {
        SignalKind::ALL
            .iter()
            .filter_map(|k| self.signals.get(k).cloned())
            .collect()
    }
}

pub struct SafetyMonitor {
    nodes: Mutex<HashMap<String, NodeSafety>>,
    quorum: usize,
    freshness: Duration,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl SafetyMonitor {
    /// `quorum` is clamped to a strict majority of the signal kinds, `2..=3`.
    pub fn new(quorum: usize, freshness: Duration, events: EventBus, clock: Arc<dyn Clock>) -> Self {
        let kinds = SignalKind::ALL.len();
        Self {
            nodes: Mutex::new(HashMap::new()),
            quorum: quorum.clamp(kinds / 2 + 1, kinds),
            freshness,
            events,
            clock,
        }
    }

    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Record the latest signal of `kind` for a node and re-assess it.
    pub fn record(&self, node_id: &str, kind: SignalKind, healthy: bool, detail: impl Into<String>) -> Assessment {
        let signal = Signal {
            kind,
            healthy,
            observed_at: self.clock.now(),
            detail: detail.into(),
        };
        debug!(%node_id, ?kind, healthy, "safety signal");
        self.reassess(node_id, Some(signal))
    }

    /// Current assessment, re-evaluated so that expired signals drop out.
    pub fn assess(&self, node_id: &str) -> Assessment {
        self.reassess(node_id, None)
    }

    /// Latest signal of each kind for a node.
    pub fn signals(&self, node_id: &str) -> Vec<Signal> {
        self.nodes
            .lock()
            .get(node_id)
            .map(NodeSafety::sorted_signals)
            .unwrap_or_default()
    }

    /// Drop all state for a node that has left the fleet.
    pub fn forget(&self, node_id: &str) {
        self.nodes.lock().remove(node_id);
    }

    fn reassess(&self, node_id: &str, signal: Option<Signal>) -> Assessment {
        let now = self.clock.now();
        let (next, change) = {
            let mut nodes = self.nodes.lock();
            if signal.is_none() && !nodes.contains_key(node_id) {
                return Assessment::Pending;
            }
            let entry = nodes.entry(node_id.to_string()).or_default();
            if let Some(signal) = signal {
                entry.signals.insert(signal.kind, signal);
            }
            let signals = entry.sorted_signals();
            let next = consensus(&signals, now, self.freshness, self.quorum);
            let prev = entry.assessment;
            entry.assessment = next;
            (next, (prev != next).then_some((prev, signals)))
        };

        if let Some((from, signals)) = change {
            info!(%node_id, ?from, to = ?next, "safety assessment changed");
            self.events.publish(
                Event::new(
                    EventKind::NodeHealthChanged,
                    json!({ "from": from, "to": next, "signals": signals }),
                )
                .for_node(node_id),
            );
        }
        next
    }
}
