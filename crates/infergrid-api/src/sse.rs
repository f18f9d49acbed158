//! Node launch log stream over server-sent events.
//!
//! Named events, each with a JSON payload:
//!
//! | Event | Payload | Sent |
//! |---|---|---|
//! | `log` | `{timestamp, level, message, phase, progress}` | every entry |
//! | `status` | `{phase, progress, message}` | entries with progress > 0 |
//! | `error` | `{error, details, phase}` | error-level entries |
//! | `done` | `{status, endpoint, message}` | once, then the stream ends |
//!
//! History is replayed first, then live entries are followed until the
//! node reaches Active or Failed.

use std::collections::VecDeque;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::QueryRejection;
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::{self, Stream};
use infergrid_fleet::{LogLevel, LogPhase, NodeLogEntry, NodeLogLine};
use infergrid_state::{NodeRegistry, NodeStatus};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::debug;

use crate::ApiState;
use crate::error::ApiResult;

const DEFAULT_TAIL: usize = 100;

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    /// Keep the stream open for new entries. Defaults to true.
    #[serde(default)]
    pub follow: Option<bool>,
    #[serde(default)]
    pub tail: Option<usize>,
}

fn named(name: &str, payload: Value) -> Event {
    Event::default().event(name).data(payload.to_string())
}

/// Events for one entry, `done` included when the entry is final.
fn entry_events(entry: &NodeLogEntry, node_id: &str, nodes: &NodeRegistry) -> Vec<Event> {
    let mut events = vec![named("log", json!(entry))];
    if entry.progress > 0 {
        events.push(named(
            "status",
            json!({ "phase": entry.phase, "progress": entry.progress, "message": entry.message }),
        ));
    }
    if entry.level == LogLevel::Error {
        events.push(named(
            "error",
            json!({ "error": entry.message, "details": entry.details, "phase": entry.phase }),
        ));
    }
    if entry.is_final() {
        events.push(done_event(entry, node_id, nodes));
    }
    events
}

fn done_event(entry: &NodeLogEntry, node_id: &str, nodes: &NodeRegistry) -> Event {
    let node = nodes.get(node_id);
    let endpoint = node.as_ref().and_then(|n| n.endpoint.clone()).unwrap_or_default();
    let payload = match entry.phase {
        LogPhase::Active => json!({
            "status": "active",
            "endpoint": endpoint,
            "message": "node is ready and serving requests",
        }),
        _ => {
            let status = match node.map(|n| n.status) {
                Some(NodeStatus::Terminated) => "terminated",
                _ => "failed",
            };
            json!({ "status": status, "endpoint": endpoint, "message": entry.message })
        }
    };
    named("done", payload)
}

/// Cursor over replayed history followed by live entries.
struct LogCursor {
    node_id: String,
    nodes: Arc<NodeRegistry>,
    backlog: VecDeque<Event>,
    live: Option<broadcast::Receiver<NodeLogLine>>,
    /// Entries already replayed; live copies of them are skipped until the
    /// first new entry arrives.
    replayed: Vec<NodeLogEntry>,
}

impl LogCursor {
    async fn next_event(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.backlog.pop_front() {
                return Some(event);
            }
            let rx = self.live.as_mut()?;
            match rx.recv().await {
                Ok(line) if line.node_id == self.node_id => {
                    if !self.replayed.is_empty() {
                        if self.replayed.contains(&line.entry) {
                            continue;
                        }
                        self.replayed.clear();
                    }
                    if line.entry.is_final() {
                        self.live = None;
                    }
                    self.backlog
                        .extend(entry_events(&line.entry, &self.node_id, &self.nodes));
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(node_id = %self.node_id, skipped, "log stream lagged");
                    return Some(Event::default().comment("lagged"));
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// GET /admin/nodes/{id}/logs/stream?follow=true&tail=100
pub async fn stream_node_logs(
    State(state): State<ApiState>,
    Path(node_id): Path<String>,
    query: Result<Query<StreamQuery>, QueryRejection>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let Query(query) = query?;
    state.deployments.get_node(&node_id)?;

    let logs = state.deployments.lifecycle().logs();
    // Subscribe first so nothing appended during the replay is missed.
    let rx = logs.subscribe();
    let history = logs.history(&node_id, Some(query.tail.unwrap_or(DEFAULT_TAIL)));

    let mut backlog = VecDeque::new();
    let mut finished = false;
    for entry in &history {
        backlog.extend(entry_events(entry, &node_id, &state.nodes));
        if entry.is_final() {
            finished = true;
            break;
        }
    }
    let follow = query.follow.unwrap_or(true) && !finished;
    debug!(%node_id, replayed = history.len(), follow, "streaming node logs");

    let cursor = LogCursor {
        node_id,
        nodes: state.nodes.clone(),
        backlog,
        live: follow.then_some(rx),
        replayed: history,
    };
    let stream = stream::unfold(cursor, |mut cursor| async move {
        cursor.next_event().await.map(|event| (Ok(event), cursor))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)).text("ping")))
}
