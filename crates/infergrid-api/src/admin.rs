//! Admin handlers: fleet control, keys, capacity, credentials, usage.
//!
//! All routes here sit behind [`crate::auth::require_admin`].

use axum::Json;
use axum::body::Bytes;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use infergrid_fleet::{FleetSpecRequest, LaunchNodeRequest, RegisterNodeRequest};
use infergrid_health::HeartbeatReport;
use infergrid_state::{ApiKey, ApiKeyStatus, Event, EventKind, Node, Tenant};
use infergrid_vault::VaultKey;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use crate::ApiState;
use crate::error::{ApiError, ApiResult};

type JsonBody<T> = Result<Json<T>, JsonRejection>;

// ── Nodes ──────────────────────────────────────────────────────

/// GET /admin/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> Json<Vec<Node>> {
    Json(state.deployments.list_nodes())
}

/// GET /admin/nodes/{id}
pub async fn get_node(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult<Json<Node>> {
    Ok(Json(state.deployments.get_node(&id)?))
}

/// POST /admin/nodes/launch
pub async fn launch_node(
    State(state): State<ApiState>,
    payload: JsonBody<LaunchNodeRequest>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let node = state.deployments.launch_node(request)?;
    Ok((StatusCode::CREATED, Json(node)))
}

/// POST /admin/nodes/register
pub async fn register_node(
    State(state): State<ApiState>,
    payload: JsonBody<RegisterNodeRequest>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let node = state.deployments.register_node(request)?;
    Ok((StatusCode::CREATED, Json(node)))
}

/// POST /admin/nodes/{id}/terminate
pub async fn terminate_node(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult<Json<Node>> {
    Ok(Json(state.deployments.terminate_node(&id).await?))
}

/// POST /admin/nodes/{id}/drain
pub async fn drain_node(State(state): State<ApiState>, Path(id): Path<String>) -> ApiResult<Json<Node>> {
    Ok(Json(state.deployments.drain_node(&id)?))
}

/// POST /admin/nodes/{id}/heartbeat
pub async fn heartbeat(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    payload: JsonBody<HeartbeatReport>,
) -> ApiResult<Json<Value>> {
    let Json(report) = payload?;
    let node = state.health.observe_heartbeat(&id, &report)?;
    Ok(Json(json!({ "status": "ok", "node_id": node.id, "node_status": node.status })))
}

#[derive(Debug, Default, Deserialize)]
struct TerminationWarning {
    #[serde(default)]
    detail: Option<String>,
}

/// POST /admin/nodes/{id}/termination-warning
///
/// The body is optional: `{"detail": "..."}`.
pub async fn termination_warning(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let warning: TerminationWarning = if body.is_empty() {
        TerminationWarning::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| ApiError::Validation(format!("invalid body: {e}")))?
    };
    let detail = warning
        .detail
        .unwrap_or_else(|| "spot termination notice".to_string());
    let assessment = state.health.termination_warning(&id, &detail)?;
    Ok(Json(json!({ "status": "received", "node_id": id, "assessment": assessment })))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub tail: Option<usize>,
}

/// GET /admin/nodes/{id}/logs?tail=N
pub async fn node_logs(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    query: Result<Query<LogsQuery>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let Query(query) = query?;
    let node = state.deployments.get_node(&id)?;
    let logs = state.deployments.lifecycle().logs().history(&id, query.tail);
    Ok(Json(json!({ "node_id": id, "status": node.status, "logs": logs })))
}

// ── API keys ───────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    pub tenant_id: String,
    #[serde(default)]
    pub environment: Option<String>,
    #[serde(default)]
    pub rate_limit: Option<u32>,
}

/// An API key as the admin API shows it: never the raw key or its hash.
#[derive(Debug, Serialize)]
pub struct ApiKeyView {
    pub id: String,
    pub prefix: String,
    pub tenant_id: String,
    pub environment: String,
    pub rate_limit: u32,
    pub status: ApiKeyStatus,
    pub created_at: u64,
    pub revoked_at: Option<u64>,
}

impl From<ApiKey> for ApiKeyView {
    fn from(k: ApiKey) -> Self {
        Self {
            id: k.id,
            prefix: k.prefix,
            tenant_id: k.tenant_id,
            environment: k.environment,
            rate_limit: k.rate_limit,
            status: k.status,
            created_at: k.created_at,
            revoked_at: k.revoked_at,
        }
    }
}

const DEFAULT_RATE_LIMIT: u32 = 60;

/// Raw key format: `igk_{environment}_{32 hex chars}`.
fn generate_raw_key(environment: &str) -> String {
    let env = match environment {
        "production" | "live" => "live",
        _ => "test",
    };
    format!("igk_{env}_{}", uuid::Uuid::new_v4().simple())
}

/// POST /admin/api-keys
///
/// The raw key appears in this response only; the store keeps its hash.
pub async fn create_api_key(
    State(state): State<ApiState>,
    payload: JsonBody<CreateApiKeyRequest>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let tenant_id = request.tenant_id.trim().to_string();
    if tenant_id.is_empty() {
        return Err(ApiError::Validation("tenant_id is required".to_string()));
    }
    if request.rate_limit == Some(0) {
        return Err(ApiError::Validation("rate_limit must be at least 1 request per minute".to_string()));
    }
    let environment = request.environment.unwrap_or_else(|| "production".to_string());
    let now = state.nodes.now();

    if state.store.get_tenant(&tenant_id)?.is_none() {
        state.store.put_tenant(&Tenant {
            id: tenant_id.clone(),
            name: tenant_id.clone(),
            environment: environment.clone(),
            created_at: now,
        })?;
        info!(tenant = %tenant_id, "tenant created");
    }

    let raw = generate_raw_key(&environment);
    let key = ApiKey {
        id: format!("key_{}", &uuid::Uuid::new_v4().simple().to_string()[..16]),
        key_hash: ApiKey::hash(&raw),
        prefix: raw.chars().take(12).collect(),
        tenant_id: tenant_id.clone(),
        environment,
        rate_limit: request.rate_limit.unwrap_or(DEFAULT_RATE_LIMIT),
        status: ApiKeyStatus::Active,
        created_at: now,
        revoked_at: None,
    };
    state.store.put_api_key(&key)?;
    info!(key_id = %key.id, tenant = %tenant_id, "api key created");
    state.nodes.events().publish(
        Event::new(EventKind::ApiKeyCreated, json!({ "key_id": key.id })).for_tenant(tenant_id.clone()),
    );

    let view = ApiKeyView::from(key);
    Ok((
        StatusCode::CREATED,
        Json(json!({ "key": raw, "api_key": view })),
    ))
}

/// GET /admin/api-keys/{tenant_id}
pub async fn list_api_keys(
    State(state): State<ApiState>,
    Path(tenant_id): Path<String>,
) -> ApiResult<Json<Vec<ApiKeyView>>> {
    let keys = state.store.list_api_keys_for_tenant(&tenant_id)?;
    Ok(Json(keys.into_iter().map(ApiKeyView::from).collect()))
}

/// DELETE /admin/api-keys/{key_id}
///
/// Revocation flips the status; the record stays. Revoking twice is a no-op.
pub async fn revoke_api_key(State(state): State<ApiState>, Path(key_id): Path<String>) -> ApiResult<Json<ApiKeyView>> {
    let mut key = state
        .store
        .find_api_key(&key_id)?
        .ok_or_else(|| ApiError::NotFound(format!("api key {key_id} not found")))?;
    if key.is_active() {
        key.status = ApiKeyStatus::Revoked;
        key.revoked_at = Some(state.nodes.now());
        state.store.put_api_key(&key)?;
        state.rate_limits.forget(&key.id);
        info!(%key_id, tenant = %key.tenant_id, "api key revoked");
        state.nodes.events().publish(
            Event::new(EventKind::ApiKeyRevoked, json!({ "key_id": key.id })).for_tenant(key.tenant_id.clone()),
        );
    }
    Ok(Json(ApiKeyView::from(key)))
}

// ── Usage ──────────────────────────────────────────────────────

/// GET /admin/usage/{tenant}
pub async fn usage(State(state): State<ApiState>, Path(tenant): Path<String>) -> ApiResult<Json<Value>> {
    let buckets = state.store.list_usage(&tenant)?;
    let tokens: u64 = buckets.iter().map(|b| b.tokens).sum();
    let requests: u64 = buckets.iter().map(|b| b.requests).sum();
    let cost_micros: u64 = buckets.iter().map(|b| b.cost_micros).sum();
    let hours: Vec<Value> = buckets
        .iter()
        .map(|b| {
            json!({
                "hour": b.hour,
                "tokens": b.tokens,
                "requests": b.requests,
                "cost": b.cost(),
            })
        })
        .collect();
    Ok(Json(json!({
        "tenant_id": tenant,
        "hours": hours,
        "total": {
            "tokens": tokens,
            "requests": requests,
            "cost": cost_micros as f64 / 1_000_000.0,
        },
    })))
}

// ── Capacity ───────────────────────────────────────────────────

/// GET /admin/capacity
pub async fn list_capacity(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({ "reservations": state.allocator.list() }))
}

#[derive(Debug, Deserialize)]
pub struct ReserveRequest {
    pub tokens_per_second: u64,
}

/// PUT /admin/capacity/{tenant}
pub async fn reserve_capacity(
    State(state): State<ApiState>,
    Path(tenant): Path<String>,
    payload: JsonBody<ReserveRequest>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let reservation = state.allocator.reserve_capacity(&tenant, request.tokens_per_second)?;
    Ok(Json(reservation))
}

// ── Credentials ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SubmitCredentialsRequest {
    pub tenant_id: String,
    pub provider: String,
    pub credentials: Value,
}

/// POST /admin/credentials
pub async fn submit_credentials(
    State(state): State<ApiState>,
    payload: JsonBody<SubmitCredentialsRequest>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    if request.tenant_id.trim().is_empty() {
        return Err(ApiError::Validation("tenant_id is required".to_string()));
    }
    let metadata = state.credentials.submit(
        &request.tenant_id,
        &request.provider,
        request.credentials,
        state.nodes.now(),
    )?;
    Ok((StatusCode::CREATED, Json(metadata)))
}

#[derive(Debug, Deserialize)]
pub struct CredentialsQuery {
    #[serde(default)]
    pub tenant_id: Option<String>,
}

/// GET /admin/credentials?tenant_id=
///
/// Metadata only.
pub async fn list_credentials(
    State(state): State<ApiState>,
    query: Result<Query<CredentialsQuery>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let Query(query) = query?;
    let records = state.credentials.list(query.tenant_id.as_deref())?;
    Ok(Json(json!({ "credentials": records })))
}

#[derive(Debug, Deserialize)]
pub struct RotateRequest {
    /// Id of the new key, e.g. "v2".
    pub key_id: String,
    /// Secret for the new key. Defaults to the configured master secret.
    #[serde(default)]
    pub master_secret: Option<String>,
}

/// POST /admin/credentials/rotate
pub async fn rotate_credentials(
    State(state): State<ApiState>,
    payload: JsonBody<RotateRequest>,
) -> ApiResult<Json<Value>> {
    let Json(request) = payload?;
    if request.key_id.trim().is_empty() {
        return Err(ApiError::Validation("key_id is required".to_string()));
    }
    let secret = request
        .master_secret
        .unwrap_or_else(|| state.vault.master_secret.clone());
    let key = VaultKey::derive(
        request.key_id.clone(),
        &secret,
        state.vault.salt.as_bytes(),
        state.vault.iterations,
    )?;
    let report = state.credentials.rotate_all(key, state.nodes.now())?;
    state.nodes.events().publish(Event::new(
        EventKind::CredentialsRotated,
        json!({ "key_id": report.key_id, "rotated": report.rotated }),
    ));
    Ok(Json(json!(report)))
}

// ── Deployments ────────────────────────────────────────────────

/// GET /admin/deployments
pub async fn list_deployments(State(state): State<ApiState>) -> ApiResult<Json<Value>> {
    Ok(Json(json!({ "deployments": state.deployments.list_specs()? })))
}

/// POST /admin/deployments
pub async fn set_deployment(
    State(state): State<ApiState>,
    payload: JsonBody<FleetSpecRequest>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let spec = state.deployments.set_spec(request)?;
    Ok((StatusCode::CREATED, Json(spec)))
}

/// GET /admin/deployments/{tenant}/{model}
pub async fn get_deployment(
    State(state): State<ApiState>,
    Path((tenant, model)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.deployments.get_spec(&tenant, &model)?))
}

/// DELETE /admin/deployments/{tenant}/{model}
pub async fn delete_deployment(
    State(state): State<ApiState>,
    Path((tenant, model)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let retired = state.deployments.delete_spec(&tenant, &model).await?;
    let ids: Vec<&str> = retired.iter().map(|n| n.id.as_str()).collect();
    Ok(Json(json!({ "deleted": format!("{tenant}/{model}"), "retired_nodes": ids })))
}

#[derive(Debug, Deserialize)]
pub struct ScaleRequest {
    pub min_nodes: u32,
    pub max_nodes: u32,
}

/// PUT /admin/deployments/{tenant}/{model}/scale
pub async fn scale_deployment(
    State(state): State<ApiState>,
    Path((tenant, model)): Path<(String, String)>,
    payload: JsonBody<ScaleRequest>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let spec = state
        .deployments
        .scale(&tenant, &model, request.min_nodes, request.max_nodes)?;
    Ok(Json(spec))
}
