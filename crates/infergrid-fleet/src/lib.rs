//! infergrid-fleet: node lifecycle, reconciliation and deployment control.
//!
//! # Architecture
//!
//! ```text
//! DeploymentController ── DesiredFleetSpec ──> StateStore
//!         │                                        │
//!         │ manual launch / register / drain       │ specs
//!         v                                        v
//!     Lifecycle <──────────────────────────── Reconciler (periodic tick)
//!      │     │                                  │    │
//!      │     └── NodeLogStore (launch phases)    │    └── SafetyMonitor assessment
//!      v                                         v
//!  Provisioner (HTTP backend, fake, disabled)   NodeRegistry transitions
//! ```
//!
//! Provisioning calls are keyed by node id and retried with exponential
//! backoff; exhausted retries raise a `reconciler.alert` event.

pub mod deployment;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod logs;
pub mod provisioner;
pub mod reconciler;

pub use deployment::{DeploymentController, FleetSpecRequest, LaunchNodeRequest, RegisterNodeRequest};
pub use error::{FleetError, FleetResult};
pub use http::HttpProvisioner;
pub use lifecycle::{LaunchOutcome, Lifecycle, new_node_id};
pub use logs::{DEFAULT_LOG_CAPACITY, LogLevel, LogPhase, NodeLogEntry, NodeLogLine, NodeLogStore};
pub use provisioner::{
    DisabledProvisioner, FakeProvisioner, LaunchRequest, LaunchedInstance, ProvisionError, Provisioner, backoff,
};
pub use reconciler::{FleetPolicy, Reconciler, TickReport};
