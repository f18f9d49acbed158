//! Structured API errors.
//!
//! Every failure leaves the API as
//! `{"error": {"kind": "<stable kind>", "message": "<text>"}}`.

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use infergrid_fleet::FleetError;
use infergrid_health::HealthError;
use infergrid_scheduler::SchedulerError;
use infergrid_state::StateError;
use infergrid_vault::VaultError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    /// No credential was presented.
    #[error("{0}")]
    Unauthenticated(String),

    /// A credential was presented but is not valid.
    #[error("{0}")]
    Forbidden(String),

    #[error("{message}")]
    AdmissionDenied { message: String, retry_after_secs: u64 },

    #[error("{0}")]
    NotFound(String),

    /// Submitted credentials failed structural validation.
    #[error("{0}")]
    CryptoRejected(String),

    /// Stored ciphertext could not be opened or sealed.
    #[error("{0}")]
    CryptoFailed(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::Unauthenticated(_) | ApiError::Forbidden(_) => "auth_error",
            ApiError::AdmissionDenied { .. } => "admission_denied",
            ApiError::NotFound(_) => "not_found",
            ApiError::CryptoRejected(_) | ApiError::CryptoFailed(_) => "crypto_error",
            ApiError::Conflict(_) => "conflict",
            ApiError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::CryptoRejected(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::AdmissionDenied { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::CryptoFailed(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(kind = self.kind(), error = %self, "request failed");
        }
        let body = Json(json!({
            "error": { "kind": self.kind(), "message": self.to_string() }
        }));
        let mut response = (status, body).into_response();
        if let ApiError::AdmissionDenied { retry_after_secs, .. } = &self {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(*retry_after_secs));
        }
        response
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::Validation(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::Validation(rejection.body_text())
    }
}

impl From<StateError> for ApiError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotFound(what) => ApiError::NotFound(format!("{what} not found")),
            StateError::AlreadyExists(_) | StateError::InvalidTransition { .. } => {
                ApiError::Conflict(e.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<FleetError> for ApiError {
    fn from(e: FleetError) -> Self {
        match e {
            FleetError::NodeNotFound(_) | FleetError::DeploymentNotFound(_) => ApiError::NotFound(e.to_string()),
            FleetError::InvalidSpec(_) => ApiError::Validation(e.to_string()),
            FleetError::InvalidAction(_) => ApiError::Conflict(e.to_string()),
            FleetError::Provision(_) => ApiError::Internal(e.to_string()),
            FleetError::State(inner) => inner.into(),
        }
    }
}

impl From<HealthError> for ApiError {
    fn from(e: HealthError) -> Self {
        match e {
            HealthError::NodeNotFound(_) => ApiError::NotFound(e.to_string()),
            HealthError::NodeTerminal(_) => ApiError::Conflict(e.to_string()),
            HealthError::InvalidReport(_) => ApiError::Validation(e.to_string()),
            HealthError::State(inner) => inner.into(),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        match e {
            SchedulerError::InvalidReservation(_) => ApiError::Validation(e.to_string()),
            SchedulerError::State(inner) => inner.into(),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<VaultError> for ApiError {
    fn from(e: VaultError) -> Self {
        if e.is_validation() {
            return ApiError::CryptoRejected(e.to_string());
        }
        match e {
            VaultError::EmptyMasterSecret | VaultError::InvalidKeyParameters(_) => {
                ApiError::Validation(e.to_string())
            }
            VaultError::Store(inner) => inner.into(),
            other => ApiError::CryptoFailed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_denied_sets_retry_after() {
        let response = ApiError::AdmissionDenied {
            message: "over budget".to_string(),
            retry_after_secs: 3,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "3");
    }

    #[test]
    fn fleet_errors_map_to_stable_kinds() {
        let cases = [
            (FleetError::NodeNotFound("n".into()), "not_found"),
            (FleetError::InvalidSpec("min > max".into()), "validation_error"),
            (FleetError::InvalidAction("busy".into()), "conflict"),
        ];
        for (err, kind) in cases {
            assert_eq!(ApiError::from(err).kind(), kind);
        }
    }

    #[test]
    fn vault_errors_split_by_cause() {
        let rejected = ApiError::from(VaultError::UnknownProvider("ibm".into()));
        assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
        assert_eq!(rejected.kind(), "crypto_error");

        let failed = ApiError::from(VaultError::AuthenticationFailed);
        assert_eq!(failed.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(failed.kind(), "crypto_error");
    }
}
