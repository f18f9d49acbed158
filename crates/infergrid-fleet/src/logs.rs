//! Per-node launch logs.
//!
//! Each node keeps a bounded, ordered history of entries written as it
//! moves through its launch phases. Followers subscribe to a broadcast of
//! new entries and filter by node id.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use infergrid_state::Clock;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Entries kept per node; older ones are dropped first.
pub const DEFAULT_LOG_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogPhase {
    Queued,
    Provisioning,
    InstanceReady,
    ModelLoading,
    HealthCheck,
    Active,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeLogEntry {
    pub timestamp: u64,
    pub level: LogLevel,
    pub message: String,
    pub phase: LogPhase,
    /// 0 to 100.
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl NodeLogEntry {
    /// Whether the launch this entry belongs to has finished, one way or
    /// the other.
    pub fn is_final(&self) -> bool {
        matches!(self.phase, LogPhase::Active | LogPhase::Failed)
    }
}

/// A new entry as seen by followers.
#[derive(Debug, Clone)]
pub struct NodeLogLine {
    pub node_id: String,
    pub entry: NodeLogEntry,
}

pub struct NodeLogStore {
    logs: RwLock<HashMap<String, VecDeque<NodeLogEntry>>>,
    tx: broadcast::Sender<NodeLogLine>,
    capacity: usize,
    clock: Arc<dyn Clock>,
}

impl NodeLogStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_capacity(clock, DEFAULT_LOG_CAPACITY)
    }

    pub fn with_capacity(clock: Arc<dyn Clock>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            logs: RwLock::new(HashMap::new()),
            tx,
            capacity: capacity.max(1),
            clock,
        }
    }

    pub fn append(&self, node_id: &str, entry: NodeLogEntry) {
        debug!(%node_id, phase = ?entry.phase, level = ?entry.level, message = %entry.message, "node log");
        {
            let mut logs = self.logs.write();
            let history = logs.entry(node_id.to_string()).or_default();
            if history.len() == self.capacity {
                history.pop_front();
            }
            history.push_back(entry.clone());
        }
        let _ = self.tx.send(NodeLogLine {
            node_id: node_id.to_string(),
            entry,
        });
    }

    pub fn info(&self, node_id: &str, phase: LogPhase, message: impl Into<String>, progress: u8) {
        self.append(
            node_id,
            NodeLogEntry {
                timestamp: self.clock.now(),
                level: LogLevel::Info,
                message: message.into(),
                phase,
                progress: progress.min(100),
                details: None,
            },
        );
    }

    pub fn warn(&self, node_id: &str, phase: LogPhase, message: impl Into<String>) {
        let progress = self.last_progress(node_id);
        self.append(
            node_id,
            NodeLogEntry {
                timestamp: self.clock.now(),
                level: LogLevel::Warn,
                message: message.into(),
                phase,
                progress,
                details: None,
            },
        );
    }

    pub fn error(&self, node_id: &str, phase: LogPhase, message: impl Into<String>, details: impl Into<String>) {
        let progress = self.last_progress(node_id);
        self.append(
            node_id,
            NodeLogEntry {
                timestamp: self.clock.now(),
                level: LogLevel::Error,
                message: message.into(),
                phase,
                progress,
                details: Some(details.into()),
            },
        );
    }

    fn last_progress(&self, node_id: &str) -> u8 {
        self.logs
            .read()
            .get(node_id)
            .and_then(|h| h.back())
            .map(|e| e.progress)
            .unwrap_or(0)
    }

    /// History for a node, oldest first; `tail` keeps only the last N.
    pub fn history(&self, node_id: &str, tail: Option<usize>) -> Vec<NodeLogEntry> {
        let logs = self.logs.read();
        let Some(history) = logs.get(node_id) else {
            return Vec::new();
        };
        let skip = tail.map_or(0, |n| history.len().saturating_sub(n));
        history.iter().skip(skip).cloned().collect()
    }

    /// Subscribe before reading history so no entry falls in between.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeLogLine> {
        self.tx.subscribe()
    }

    /// Drop the histories of `node_ids`; returns how many existed.
    pub fn clear(&self, node_ids: &[String]) -> usize {
        if node_ids.is_empty() {
            return 0;
        }
        let mut logs = self.logs.write();
        node_ids.iter().filter(|id| logs.remove(id.as_str()).is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infergrid_state::ManualClock;

    fn store() -> NodeLogStore {
        NodeLogStore::with_capacity(Arc::new(ManualClock::new(100)), 3)
    }

    #[test]
    fn history_is_ordered_and_tailed() {
        let logs = store();
        logs.info("n1", LogPhase::Queued, "queued", 0);
        logs.info("n1", LogPhase::Provisioning, "launching", 10);
        logs.info("n2", LogPhase::Queued, "other node", 0);

        let all = logs.history("n1", None);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].phase, LogPhase::Queued);
        assert_eq!(all[1].progress, 10);

        let tail = logs.history("n1", Some(1));
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].message, "launching");
        assert!(logs.history("missing", Some(5)).is_empty());
    }

    #[test]
    fn capacity_drops_oldest() {
        let logs = store();
        for i in 0..5u8 {
            logs.info("n1", LogPhase::ModelLoading, format!("step {i}"), i * 10);
        }
        let history = logs.history("n1", None);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].message, "step 2");
    }

    #[test]
    fn errors_keep_last_progress_and_details() {
        let logs = store();
        logs.info("n1", LogPhase::Provisioning, "launching", 10);
        logs.error("n1", LogPhase::Failed, "launch failed", "quota exceeded");
        let last = logs.history("n1", Some(1)).remove(0);
        assert_eq!(last.level, LogLevel::Error);
        assert_eq!(last.progress, 10);
        assert_eq!(last.details.as_deref(), Some("quota exceeded"));
        assert!(last.is_final());
    }

    #[test]
    fn entry_serializes_with_snake_case_phase() {
        let logs = store();
        logs.info("n1", LogPhase::InstanceReady, "instance acquired", 40);
        let json = serde_json::to_value(&logs.history("n1", None)[0]).unwrap();
        assert_eq!(json["phase"], "instance_ready");
        assert_eq!(json["level"], "info");
        assert_eq!(json["timestamp"], 100);
        assert!(json.get("details").is_none());
    }

    #[test]
    fn clear_drops_only_named_nodes() {
        let logs = store();
        logs.info("n1", LogPhase::Queued, "queued", 0);
        logs.info("n2", LogPhase::Queued, "queued", 0);

        let dropped = logs.clear(&["n1".to_string(), "gone".to_string()]);
        assert_eq!(dropped, 1);
        assert!(logs.history("n1", None).is_empty());
        assert_eq!(logs.history("n2", None).len(), 1);
    }

    #[tokio::test]
    async fn followers_see_new_entries() {
        let logs = store();
        let mut rx = logs.subscribe();
        logs.info("n1", LogPhase::Active, "ready", 100);
        let line = rx.recv().await.unwrap();
        assert_eq!(line.node_id, "n1");
        assert!(line.entry.is_final());
    }
}
