//! Public handlers: inference entry point and health endpoints.

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use infergrid_scheduler::{RouteOutcome, RouteResponse};
use infergrid_state::InferenceRequest;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::ApiState;
use crate::auth::authenticate_tenant;
use crate::error::{ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    /// Preferred region for the serving node.
    #[serde(default)]
    pub region: Option<String>,
}

impl ChatCompletionRequest {
    fn validate(&self) -> ApiResult<()> {
        if self.model.trim().is_empty() {
            return Err(ApiError::Validation("model is required".to_string()));
        }
        if self.messages.is_empty() {
            return Err(ApiError::Validation("messages must not be empty".to_string()));
        }
        if let Some(i) = self.messages.iter().position(|m| m.role.trim().is_empty()) {
            return Err(ApiError::Validation(format!("messages[{i}].role is required")));
        }
        Ok(())
    }
}

/// Prompt size estimate: one token per four characters of message content,
/// rounded up.
pub fn estimate_prompt_tokens(messages: &[ChatMessage]) -> u64 {
    let chars: usize = messages.iter().map(|m| m.content.chars().count()).sum();
    chars.div_ceil(4) as u64
}

fn completion_body(id: &str, request: &InferenceRequest, routing: &RouteResponse) -> serde_json::Value {
    json!({
        "id": id,
        "object": "chat.completion",
        "model": request.model,
        "routing": routing,
        "usage": { "prompt_tokens": request.prompt_tokens },
    })
}

/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<ApiState>,
    headers: HeaderMap,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let key = authenticate_tenant(&state, &headers)?;
    if let Err(retry_after_secs) = state.rate_limits.check(&key.id, key.rate_limit) {
        warn!(key_id = %key.id, tenant = %key.tenant_id, limit = key.rate_limit, "key rate limit exceeded");
        return Err(ApiError::AdmissionDenied {
            message: format!("rate limit of {} requests per minute exceeded for this key", key.rate_limit),
            retry_after_secs,
        });
    }
    let Json(body) = payload?;
    body.validate()?;

    let request = InferenceRequest {
        tenant_id: key.tenant_id.clone(),
        model: body.model.clone(),
        region: body.region.clone().filter(|r| !r.is_empty()),
        prompt_tokens: estimate_prompt_tokens(&body.messages),
    };
    let id = format!("chatcmpl-{}", uuid::Uuid::new_v4().simple());

    match state.router.route(&request) {
        RouteOutcome::Routed { response, lease } => {
            info!(
                tenant = %request.tenant_id,
                model = %request.model,
                node_id = %lease.node_id(),
                prompt_tokens = request.prompt_tokens,
                "request routed"
            );
            let body = completion_body(&id, &request, &response);
            // Completion of the call releases the node's in-flight slot.
            drop(lease);
            Ok(Json(body))
        }
        RouteOutcome::Fallback(response) => Ok(Json(completion_body(&id, &request, &response))),
        RouteOutcome::Denied(denial) => Err(ApiError::AdmissionDenied {
            message: format!(
                "request of {} tokens exceeds tenant {} reservation of {} tokens/s",
                denial.requested_tokens, denial.tenant_id, denial.reserved_tokens_per_second
            ),
            retry_after_secs: state.retry_after_secs,
        }),
    }
}

/// GET /health
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// GET /ready
pub async fn ready(State(state): State<ApiState>) -> impl IntoResponse {
    match state.store.list_reservations() {
        Ok(_) => (
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "nodes": state.nodes.snapshot().len(),
                "provisioner": state.deployments.lifecycle().provisioner_name(),
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready", "error": e.to_string() })),
        ),
    }
}
