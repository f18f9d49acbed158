//! Fleet error types.

use infergrid_state::StateError;
use thiserror::Error;

use crate::provisioner::ProvisionError;

pub type FleetResult<T> = Result<T, FleetError>;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("deployment not found: {0}")]
    DeploymentNotFound(String),

    #[error("invalid fleet spec: {0}")]
    InvalidSpec(String),

    /// The requested action does not apply to the node in its current state.
    #[error("{0}")]
    InvalidAction(String),

    #[error("provisioning failed: {0}")]
    Provision(#[from] ProvisionError),

    #[error("state error: {0}")]
    State(#[from] StateError),
}
