//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur during admission and scheduling.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No Healthy node serves the requested model (and region). This is an
    /// expected outcome that the router turns into a fallback response.
    #[error("no healthy nodes for model {model}{}", in_region(.region))]
    NoHealthyNodes {
        model: String,
        region: Option<String>,
    },

    #[error("invalid reservation: {0}")]
    InvalidReservation(String),

    #[error("state store error: {0}")]
    State(#[from] infergrid_state::StateError),
}

fn in_region(region: &Option<String>) -> String {
    region.as_deref().map(|r| format!(" in {r}")).unwrap_or_default()
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
