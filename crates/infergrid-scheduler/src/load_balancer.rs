//! Per-node in-flight request tracking.
//!
//! Each routed request holds a [`LoadGuard`] until it completes; dropping
//! the guard decrements the node's counter. Counters are `AtomicU32`s
//! behind `Arc`, so the map lock is only taken to look a counter up or
//! create it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::RwLock;

#[derive(Default)]
struct NodeLoad {
    in_flight: AtomicU32,
    pending_tokens: AtomicU64,
}

/// Tracks requests the router has sent to each node and not yet completed.
#[derive(Clone, Default)]
pub struct LoadTracker {
    nodes: Arc<RwLock<HashMap<String, Arc<NodeLoad>>>>,
}

impl LoadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, node_id: &str) -> Arc<NodeLoad> {
        if let Some(load) = self.nodes.read().get(node_id) {
            return load.clone();
        }
        self.nodes
            .write()
            .entry(node_id.to_string())
            .or_default()
            .clone()
    }

    /// Record the start of a request on `node_id`.
    pub fn acquire(&self, node_id: &str, tokens: u64) -> LoadGuard {
        let load = self.counter(node_id);
        load.in_flight.fetch_add(1, Ordering::Relaxed);
        load.pending_tokens.fetch_add(tokens, Ordering::Relaxed);
        LoadGuard {
            node_id: node_id.to_string(),
            tokens,
            load,
        }
    }

    /// Requests currently in flight on `node_id`.
    pub fn in_flight(&self, node_id: &str) -> u32 {
        self.nodes
            .read()
            .get(node_id)
            .map(|l| l.in_flight.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn pending_tokens(&self, node_id: &str) -> u64 {
        self.nodes
            .read()
            .get(node_id)
            .map(|l| l.pending_tokens.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Drop the counter for a node that has left the fleet.
    pub fn forget(&self, node_id: &str) {
        self.nodes.write().remove(node_id);
    }
}

/// Held for the lifetime of one routed request.
#[must_use = "dropping the guard immediately completes the request"]
pub struct LoadGuard {
    node_id: String,
    tokens: u64,
    load: Arc<NodeLoad>,
}

impl LoadGuard {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        // Saturating: a counter reset by `forget` must not wrap.
        let _ = self
            .load
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(1)));
        let tokens = self.tokens;
        let _ = self
            .load
            .pending_tokens
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| Some(n.saturating_sub(tokens)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_counts_and_releases() {
        let tracker = LoadTracker::new();
        let a = tracker.acquire("n1", 10);
        let b = tracker.acquire("n1", 5);
        assert_eq!(tracker.in_flight("n1"), 2);
        assert_eq!(tracker.pending_tokens("n1"), 15);

        drop(a);
        assert_eq!(tracker.in_flight("n1"), 1);
        assert_eq!(tracker.pending_tokens("n1"), 5);
        drop(b);
        assert_eq!(tracker.in_flight("n1"), 0);
    }

    #[test]
    fn unknown_node_has_no_load() {
        let tracker = LoadTracker::new();
        assert_eq!(tracker.in_flight("nope"), 0);
        assert_eq!(tracker.pending_tokens("nope"), 0);
    }

    #[test]
    fn forget_then_drop_does_not_underflow() {
        let tracker = LoadTracker::new();
        let guard = tracker.acquire("n1", 3);
        tracker.forget("n1");
        drop(guard);
        assert_eq!(tracker.in_flight("n1"), 0);

        let again = tracker.acquire("n1", 1);
        assert_eq!(tracker.in_flight("n1"), 1);
        assert_eq!(again.node_id(), "n1");
    }

    #[test]
    fn concurrent_acquire_release_balances() {
        use std::thread;

        let tracker = LoadTracker::new();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let tracker = tracker.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        let _g = tracker.acquire("n1", 2);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(tracker.in_flight("n1"), 0);
        assert_eq!(tracker.pending_tokens("n1"), 0);
    }
}
