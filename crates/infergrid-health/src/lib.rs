//! infergrid-health: node liveness, runtime probes and safety consensus.
//!
//! # Architecture
//!
//! ```text
//! node agent heartbeat ──> HealthRegistry (last seen, load figures) ──┐
//! staleness sweep ─────────────────────────────────────────────────────┤
//! probe loop ── http_probe() ── ProbeBackoff ──────────────────────────┼─> SafetyMonitor
//! spot termination notice / vanished instance ────────────────────────┘     │
//!                                                                         consensus
//!                                                                  (quorum of fresh signals)
//!                                                                            │
//!                                                     node.health_changed ──> EventBus
//! ```
//!
//! The safety monitor never changes a node's lifecycle status itself; the
//! reconciler reads its assessment and drives the transitions.

pub mod checker;
pub mod error;
pub mod monitor;
pub mod registry;
pub mod safety;

pub use checker::{ProbeBackoff, ProbeResult, http_probe, probe_target};
pub use error::{HealthError, HealthResult};
pub use monitor::{HealthMonitor, MonitorSettings};
pub use registry::{HealthRegistry, HeartbeatReport, UNHEALTHY_SCORE};
pub use safety::{Assessment, SafetyMonitor, Signal, SignalKind, consensus};
