//! Authentication: shared-secret admin token and tenant API keys.

use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use infergrid_state::ApiKey;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::ApiState;
use crate::error::{ApiError, ApiResult};

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Compare digests so the comparison time does not depend on how much of
/// the token matched.
fn token_matches(presented: &str, expected: &str) -> bool {
    !expected.is_empty() && Sha256::digest(presented.as_bytes()) == Sha256::digest(expected.as_bytes())
}

/// Middleware for `/admin`: requires `X-Admin-Token`.
pub async fn require_admin(State(state): State<ApiState>, request: Request, next: Next) -> ApiResult<Response> {
    let Some(presented) = request
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
    else {
        return Err(ApiError::Unauthenticated("missing admin token".to_string()));
    };
    if !token_matches(presented, &state.admin_token) {
        warn!(path = %request.uri().path(), "admin token rejected");
        return Err(ApiError::Forbidden("invalid admin token".to_string()));
    }
    Ok(next.run(request).await)
}

/// Resolve the tenant API key in `Authorization: Bearer <key>`.
pub fn authenticate_tenant(state: &ApiState, headers: &HeaderMap) -> ApiResult<ApiKey> {
    let raw = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ApiError::Unauthenticated("missing API key".to_string()))?;

    match state.store.get_api_key_by_hash(&ApiKey::hash(raw))? {
        Some(key) if key.is_active() => {
            debug!(key_id = %key.id, tenant = %key.tenant_id, "api key accepted");
            Ok(key)
        }
        Some(key) => {
            warn!(key_id = %key.id, tenant = %key.tenant_id, "revoked api key presented");
            Err(ApiError::Forbidden("API key has been revoked".to_string()))
        }
        None => Err(ApiError::Forbidden("invalid API key".to_string())),
    }
}
