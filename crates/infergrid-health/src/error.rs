//! Health error types.

use thiserror::Error;

pub type HealthResult<T> = Result<T, HealthError>;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("node {0} is terminated or failed")]
    NodeTerminal(String),

    #[error("invalid heartbeat: {0}")]
    InvalidReport(String),

    #[error("state error: {0}")]
    State(#[from] infergrid_state::StateError),
}
