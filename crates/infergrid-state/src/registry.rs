//! NodeRegistry: the in-process owner of the node set.
//!
//! Reads and writes go through short, I/O-free critical sections on a
//! `RwLock<HashMap>`. Lifecycle transitions are validated against
//! [`NodeStatus::can_transition_to`] inside the lock. The redb write and the
//! event publish happen after the map lock is released; a separate persist
//! mutex writes whatever the map holds at that moment, so the stored copy
//! never falls behind a later in-memory update.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{StateError, StateResult};
use crate::events::{Event, EventBus, EventKind};
use crate::store::StateStore;
use crate::types::{Node, NodeId, NodeStatus};

pub struct NodeRegistry {
    nodes: RwLock<HashMap<NodeId, Node>>,
    persist: Mutex<()>,
    store: StateStore,
    events: EventBus,
    clock: Arc<dyn Clock>,
}

impl NodeRegistry {
    pub fn new(store: StateStore, events: EventBus, clock: Arc<dyn Clock>) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            persist: Mutex::new(()),
            store,
            events,
            clock,
        }
    }

    /// Build a registry pre-populated from the nodes table.
    pub fn load(store: StateStore, events: EventBus, clock: Arc<dyn Clock>) -> StateResult<Self> {
        let nodes = store.list_nodes()?;
        let count = nodes.len();
        let registry = Self::new(store, events, clock);
        {
            let mut map = registry.nodes.write();
            for node in nodes {
                map.insert(node.id.clone(), node);
            }
        }
        info!(count, "node registry restored");
        Ok(registry)
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    /// Add a new node. Fails if the id is already taken.
    pub fn insert(&self, node: Node) -> StateResult<Node> {
        {
            let mut map = self.nodes.write();
            if map.contains_key(&node.id) {
                return Err(StateError::AlreadyExists(node.id));
            }
            map.insert(node.id.clone(), node.clone());
        }
        self.persist_latest(&node.id)?;
        debug!(node_id = %node.id, status = %node.status, model = %node.model, "node registered");
        Ok(node)
    }

    pub fn get(&self, node_id: &str) -> Option<Node> {
        self.nodes.read().get(node_id).cloned()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.read().contains_key(node_id)
    }

    /// Point-in-time copy of every node, ordered by id.
    pub fn snapshot(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.read().values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Move a node along the lifecycle graph.
    ///
    /// Transitioning to the state the node is already in is a no-op, which
    /// keeps retried corrective actions idempotent.
    pub fn transition(&self, node_id: &str, to: NodeStatus, reason: &str) -> StateResult<Node> {
        let now = self.clock.now();
        let (from, node) = {
            let mut map = self.nodes.write();
            let node = map
                .get_mut(node_id)
                .ok_or_else(|| StateError::NotFound(format!("node {node_id}")))?;
            let from = node.status;
            if from == to {
                return Ok(node.clone());
            }
            if !from.can_transition_to(to) {
                return Err(StateError::InvalidTransition {
                    node_id: node_id.to_string(),
                    from,
                    to,
                });
            }
            node.status = to;
            node.status_since = now;
            node.updated_at = now;
            (from, node.clone())
        };

        self.persist_latest(node_id)?;
        info!(%node_id, %from, %to, reason, "node transitioned");

        let payload = json!({ "from": from, "to": to, "reason": reason });
        self.events.publish(
            Event::new(EventKind::NodeStatusChanged, payload.clone())
                .for_node(node_id)
                .for_tenant(&node.tenant_id),
        );
        let follow_up = match to {
            NodeStatus::Draining => Some(EventKind::NodeDraining),
            NodeStatus::Terminated => Some(EventKind::NodeTerminated),
            NodeStatus::Failed => Some(EventKind::NodeFailed),
            _ => None,
        };
        if let Some(kind) = follow_up {
            self.events.publish(
                Event::new(kind, payload)
                    .for_node(node_id)
                    .for_tenant(&node.tenant_id),
            );
        }
        Ok(node)
    }

    /// Mutate a node's non-lifecycle fields (load figures, endpoint, ...).
    /// Any change `f` makes to `status` is discarded; use [`Self::transition`].
    pub fn update<F>(&self, node_id: &str, f: F) -> StateResult<Node>
    where
        F: FnOnce(&mut Node),
    {
        let now = self.clock.now();
        let node = {
            let mut map = self.nodes.write();
            let node = map
                .get_mut(node_id)
                .ok_or_else(|| StateError::NotFound(format!("node {node_id}")))?;
            let status = node.status;
            let status_since = node.status_since;
            f(node);
            node.status = status;
            node.status_since = status_since;
            node.updated_at = now;
            node.clone()
        };
        self.persist_latest(node_id)?;
        Ok(node)
    }

    fn persist_latest(&self, node_id: &str) -> StateResult<()> {
        let _guard = self.persist.lock();
        let current = self.nodes.read().get(node_id).cloned();
        match current {
            Some(node) => self.store.put_node(&node),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn registry() -> (NodeRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = StateStore::open_in_memory().unwrap();
        let reg = NodeRegistry::new(store, EventBus::default(), clock.clone());
        (reg, clock)
    }

    fn node(id: &str) -> Node {
        Node::requested(id, "t1", "m", "aws", "us-east-1", 1_000)
    }

    #[test]
    fn insert_rejects_duplicates() {
        let (reg, _) = registry();
        reg.insert(node("n1")).unwrap();
        assert!(matches!(reg.insert(node("n1")), Err(StateError::AlreadyExists(_))));
    }

    #[test]
    fn transition_follows_lifecycle() {
        let (reg, clock) = registry();
        reg.insert(node("n1")).unwrap();
        clock.set(2_000);

        let n = reg.transition("n1", NodeStatus::Provisioning, "test").unwrap();
        assert_eq!(n.status, NodeStatus::Provisioning);
        assert_eq!(n.status_since, 2_000);

        let err = reg.transition("n1", NodeStatus::Healthy, "test").unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
        assert_eq!(reg.get("n1").unwrap().status, NodeStatus::Provisioning);
    }

    #[test]
    fn same_state_transition_is_noop() {
        let (reg, _) = registry();
        reg.insert(node("n1")).unwrap();
        let mut rx = reg.events().subscribe();
        reg.transition("n1", NodeStatus::Requested, "again").unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn transition_publishes_events() {
        let (reg, _) = registry();
        reg.insert(node("n1")).unwrap();
        let mut rx = reg.events().subscribe();

        reg.transition("n1", NodeStatus::Failed, "boom").unwrap();
        let first = rx.try_recv().unwrap();
        assert_eq!(first.kind, EventKind::NodeStatusChanged);
        assert_eq!(first.payload["to"], "failed");
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::NodeFailed);
    }

    #[test]
    fn update_cannot_change_status() {
        let (reg, _) = registry();
        reg.insert(node("n1")).unwrap();
        let n = reg
            .update("n1", |n| {
                n.queue_depth = 4;
                n.status = NodeStatus::Healthy;
            })
            .unwrap();
        assert_eq!(n.queue_depth, 4);
        assert_eq!(n.status, NodeStatus::Requested);
    }

    #[test]
    fn writes_are_persisted_and_restorable() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000));
        let store = StateStore::open_in_memory().unwrap();
        let reg = NodeRegistry::new(store.clone(), EventBus::default(), clock.clone());
        reg.insert(node("n1")).unwrap();
        reg.transition("n1", NodeStatus::Provisioning, "test").unwrap();

        let restored = NodeRegistry::load(store, EventBus::default(), clock).unwrap();
        assert_eq!(restored.get("n1").unwrap().status, NodeStatus::Provisioning);
    }

    #[test]
    fn unknown_node_is_not_found() {
        let (reg, _) = registry();
        assert!(matches!(
            reg.transition("ghost", NodeStatus::Failed, "x"),
            Err(StateError::NotFound(_))
        ));
        assert!(matches!(reg.update("ghost", |_| {}), Err(StateError::NotFound(_))));
    }
}
