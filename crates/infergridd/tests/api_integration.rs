//! End-to-end API tests.
//!
//! Builds the full control plane over an in-memory store and a scripted
//! provisioner, then drives the router with `oneshot` requests: auth,
//! inference admission and routing, node agent traffic, fleet specs,
//! credentials, and the launch log stream.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use http_body_util::BodyExt;
use infergrid_api::{ApiState, build_router};
use infergrid_core::ControlPlaneConfig;
use infergrid_fleet::FakeProvisioner;
use infergrid_state::{NodeStatus, StateStore, SystemClock};
use infergridd::ControlPlane;
use serde_json::{Value, json};
use tower::ServiceExt;

const ADMIN_TOKEN: &str = "test-admin-token";

struct Harness {
    app: Router,
    api: ApiState,
    plane: ControlPlane,
    fake: Arc<FakeProvisioner>,
}

fn test_config() -> ControlPlaneConfig {
    let mut config = ControlPlaneConfig::default();
    config.server.admin_token = ADMIN_TOKEN.to_string();
    config.vault.master_secret = "integration-secret".to_string();
    config.vault.iterations = 1_000;
    config.admission.retry_after_secs = 3;
    config
}

fn harness() -> Harness {
    let fake = Arc::new(FakeProvisioner::new().with_spot_price(2.0));
    let store = StateStore::open_in_memory().unwrap();
    let plane = ControlPlane::assemble(&test_config(), store, fake.clone(), Arc::new(SystemClock)).unwrap();
    let api = plane.api.clone();
    Harness {
        app: build_router(api.clone()),
        api,
        plane,
        fake,
    }
}

enum Auth<'a> {
    None,
    Admin(&'a str),
    Bearer(&'a str),
}

async fn send(app: &Router, method: &str, uri: &str, auth: Auth<'_>, body: Option<Value>) -> (StatusCode, HeaderMap, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    builder = match auth {
        Auth::None => builder,
        Auth::Admin(token) => builder.header("x-admin-token", token),
        Auth::Bearer(key) => builder.header("authorization", format!("Bearer {key}")),
    };
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&value).unwrap())
        }
        None => Body::empty(),
    };
    let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, headers, json)
}

async fn admin(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let (status, _, json) = send(app, method, uri, Auth::Admin(ADMIN_TOKEN), body).await;
    (status, json)
}

async fn create_key(app: &Router, tenant: &str) -> String {
    let (status, body) = admin(app, "POST", "/admin/api-keys", Some(json!({ "tenant_id": tenant }))).await;
    assert_eq!(status, StatusCode::CREATED);
    body["key"].as_str().unwrap().to_string()
}

async fn register_node(app: &Router, node_id: &str, tenant: &str, model: &str) -> Value {
    let (status, body) = admin(
        app,
        "POST",
        "/admin/nodes/register",
        Some(json!({
            "node_id": node_id,
            "tenant_id": tenant,
            "model": model,
            "provider": "runpod",
            "region": "us-east",
            "endpoint": format!("http://{node_id}.internal:8000"),
            "spot_price": 2.0,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    body
}

fn chat(model: &str, content: &str) -> Value {
    json!({ "model": model, "messages": [{ "role": "user", "content": content }] })
}

async fn stream_body(app: &Router, node_id: &str) -> (StatusCode, String, String) {
    let request = Request::builder()
        .uri(format!("/admin/nodes/{node_id}/logs/stream"))
        .header("x-admin-token", ADMIN_TOKEN)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, content_type, String::from_utf8(bytes.to_vec()).unwrap())
}

// ── Public endpoints and auth ─────────────────────────────────────

#[tokio::test]
async fn health_and_ready_need_no_auth() {
    let h = harness();
    let (status, _, body) = send(&h.app, "GET", "/health", Auth::None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, _, body) = send(&h.app, "GET", "/ready", Auth::None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
    assert_eq!(body["provisioner"], "fake");
}

#[tokio::test]
async fn admin_routes_distinguish_missing_and_wrong_token() {
    let h = harness();
    let (status, _, body) = send(&h.app, "GET", "/admin/nodes", Auth::None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["kind"], "auth_error");

    let (status, _, body) = send(&h.app, "GET", "/admin/nodes", Auth::Admin("nope"), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["kind"], "auth_error");

    let (status, body) = admin(&h.app, "GET", "/admin/nodes", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn inference_requires_a_valid_api_key() {
    let h = harness();
    let (status, _, _) = send(&h.app, "POST", "/v1/chat/completions", Auth::None, Some(chat("m", "hi"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, body) = send(
        &h.app,
        "POST",
        "/v1/chat/completions",
        Auth::Bearer("igk_live_unknown"),
        Some(chat("m", "hi")),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["error"]["kind"], "auth_error");
}

// ── API keys and inference ────────────────────────────────────────

#[tokio::test]
async fn api_key_is_shown_once_and_stored_hashed() {
    let h = harness();
    let (status, body) = admin(
        &h.app,
        "POST",
        "/admin/api-keys",
        Some(json!({ "tenant_id": "acme", "environment": "production" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let raw = body["key"].as_str().unwrap();
    assert!(raw.starts_with("igk_live_"));
    assert_eq!(body["api_key"]["prefix"], &raw[..12]);
    assert!(body["api_key"].get("key_hash").is_none());

    let (status, keys) = admin(&h.app, "GET", "/admin/api-keys/acme", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(keys.as_array().unwrap().len(), 1);
    assert!(!keys.to_string().contains(raw));

    assert!(h.api.store.get_tenant("acme").unwrap().is_some());
}

#[tokio::test]
async fn no_healthy_node_gives_degraded_fallback() {
    let h = harness();
    let key = create_key(&h.app, "acme").await;

    let (status, _, body) = send(
        &h.app,
        "POST",
        "/v1/chat/completions",
        Auth::Bearer(&key),
        Some(chat("llama-70b", "hello there")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["routing"]["degraded"], true);
    assert_eq!(body["model"], "llama-70b");
    assert!(body["routing"].get("node_id").is_none());
}

#[tokio::test]
async fn healthy_node_serves_and_usage_is_metered() {
    let h = harness();
    let key = create_key(&h.app, "acme").await;
    register_node(&h.app, "node-a", "acme", "llama-70b").await;
    h.api.deployments.lifecycle().promote("node-a").unwrap();

    let (status, _, body) = send(
        &h.app,
        "POST",
        "/v1/chat/completions",
        Auth::Bearer(&key),
        Some(chat("llama-70b", &"x".repeat(40))),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["routing"]["degraded"], false);
    assert_eq!(body["routing"]["node_id"], "node-a");
    assert_eq!(body["usage"]["prompt_tokens"], 10);
    assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));
    // The request completed, so the node carries no in-flight load.
    assert_eq!(h.api.deployments.lifecycle().load().in_flight("node-a"), 0);

    let (status, usage) = admin(&h.app, "GET", "/admin/usage/acme", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(usage["total"]["tokens"], 10);
    assert_eq!(usage["total"]["requests"], 1);
    assert_eq!(usage["hours"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn revoked_key_is_rejected() {
    let h = harness();
    let key = create_key(&h.app, "acme").await;
    let (_, keys) = admin(&h.app, "GET", "/admin/api-keys/acme", None).await;
    let key_id = keys[0]["id"].as_str().unwrap().to_string();

    let (status, body) = admin(&h.app, "DELETE", &format!("/admin/api-keys/{key_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "revoked");

    // Revoking again is a no-op.
    let (status, _) = admin(&h.app, "DELETE", &format!("/admin/api-keys/{key_id}"), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _, _) = send(&h.app, "POST", "/v1/chat/completions", Auth::Bearer(&key), Some(chat("m", "hi"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = admin(&h.app, "DELETE", "/admin/api-keys/key_missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn request_over_reservation_is_denied_with_retry_after() {
    let h = harness();
    let key = create_key(&h.app, "acme").await;

    let (status, body) = admin(
        &h.app,
        "PUT",
        "/admin/capacity/acme",
        Some(json!({ "tokens_per_second": 5 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tokens_per_second"], 5);

    let (status, headers, body) = send(
        &h.app,
        "POST",
        "/v1/chat/completions",
        Auth::Bearer(&key),
        Some(chat("llama-70b", &"y".repeat(100))),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["kind"], "admission_denied");
    assert_eq!(headers.get("retry-after").unwrap(), "3");

    // Within the reservation the same tenant is admitted.
    let (status, _, _) = send(
        &h.app,
        "POST",
        "/v1/chat/completions",
        Auth::Bearer(&key),
        Some(chat("llama-70b", "tiny")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, capacity) = admin(&h.app, "GET", "/admin/capacity", None).await;
    assert_eq!(capacity["reservations"][0]["tenant_id"], "acme");
}

#[tokio::test]
async fn key_over_its_rate_limit_is_told_when_to_retry() {
    let h = harness();
    let (status, body) = admin(
        &h.app,
        "POST",
        "/admin/api-keys",
        Some(json!({ "tenant_id": "acme", "rate_limit": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["api_key"]["rate_limit"], 2);
    let limited = body["key"].as_str().unwrap().to_string();

    for _ in 0..2 {
        let (status, _, _) = send(&h.app, "POST", "/v1/chat/completions", Auth::Bearer(&limited), Some(chat("m", "hi"))).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, headers, body) =
        send(&h.app, "POST", "/v1/chat/completions", Auth::Bearer(&limited), Some(chat("m", "hi"))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["kind"], "admission_denied");
    assert!(body["error"]["message"].as_str().unwrap().contains("rate limit"));
    let retry_after: u64 = headers.get("retry-after").unwrap().to_str().unwrap().parse().unwrap();
    assert!((1..=30).contains(&retry_after), "retry-after {retry_after}");

    // Another key of the same tenant has its own budget.
    let other = create_key(&h.app, "acme").await;
    let (status, _, _) = send(&h.app, "POST", "/v1/chat/completions", Auth::Bearer(&other), Some(chat("m", "hi"))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn zero_rate_limit_is_rejected() {
    let h = harness();
    let (status, body) = admin(
        &h.app,
        "POST",
        "/admin/api-keys",
        Some(json!({ "tenant_id": "acme", "rate_limit": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation_error");
}

#[tokio::test]
async fn malformed_chat_body_is_a_validation_error() {
    let h = harness();
    let key = create_key(&h.app, "acme").await;
    let (status, _, body) = send(
        &h.app,
        "POST",
        "/v1/chat/completions",
        Auth::Bearer(&key),
        Some(json!({ "model": "m", "messages": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation_error");
}

// ── Node agent traffic ────────────────────────────────────────────

#[tokio::test]
async fn heartbeat_updates_registered_node() {
    let h = harness();
    register_node(&h.app, "node-hb", "acme", "llama-70b").await;

    let (status, body) = admin(
        &h.app,
        "POST",
        "/admin/nodes/node-hb/heartbeat",
        Some(json!({ "health_score": 0.9, "queue_depth": 4, "active_requests": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["node_id"], "node-hb");

    let (_, node) = admin(&h.app, "GET", "/admin/nodes/node-hb", None).await;
    assert_eq!(node["queue_depth"], 4);
    assert_eq!(node["active_requests"], 2);

    let (status, body) = admin(
        &h.app,
        "POST",
        "/admin/nodes/ghost/heartbeat",
        Some(json!({ "health_score": 1.0 })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "not_found");
}

#[tokio::test]
async fn termination_warning_accepts_empty_body() {
    let h = harness();
    register_node(&h.app, "node-spot", "acme", "llama-70b").await;
    let (status, body) = admin(&h.app, "POST", "/admin/nodes/node-spot/termination-warning", None).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "received");
}

#[tokio::test]
async fn register_rejects_non_http_endpoint() {
    let h = harness();
    let (status, body) = admin(
        &h.app,
        "POST",
        "/admin/nodes/register",
        Some(json!({
            "tenant_id": "acme",
            "model": "llama-70b",
            "provider": "runpod",
            "endpoint": "not a url",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation_error");
}

#[tokio::test]
async fn manual_launch_is_dispatched_by_next_tick() {
    let h = harness();
    let (status, node) = admin(
        &h.app,
        "POST",
        "/admin/nodes/launch",
        Some(json!({ "tenant_id": "acme", "model": "llama-70b", "provider": "runpod" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{node}");
    let node_id = node["id"].as_str().unwrap().to_string();
    assert_eq!(h.fake.launch_count(), 0);

    let report = h.plane.reconciler.tick().await.unwrap();
    assert_eq!(report.launched, vec![node_id.clone()]);
    assert_eq!(h.fake.launch_count(), 1);
    assert_eq!(h.api.nodes.get(&node_id).unwrap().status, NodeStatus::Booting);

    let (status, logs) = admin(&h.app, "GET", &format!("/admin/nodes/{node_id}/logs"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!logs["logs"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn drain_requires_a_serving_node() {
    let h = harness();
    register_node(&h.app, "node-d", "acme", "llama-70b").await;

    let (status, body) = admin(&h.app, "POST", "/admin/nodes/node-d/drain", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "conflict");

    h.api.deployments.lifecycle().promote("node-d").unwrap();
    let (status, body) = admin(&h.app, "POST", "/admin/nodes/node-d/drain", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "draining");
}

// ── Fleet specs ───────────────────────────────────────────────────

#[tokio::test]
async fn deployment_spec_crud() {
    let h = harness();
    let spec = json!({
        "tenant_id": "acme",
        "model": "llama-70b",
        "min_nodes": 1,
        "max_nodes": 3,
        "providers": ["runpod", "lambda"],
        "regions": ["us-east"],
    });
    let (status, body) = admin(&h.app, "POST", "/admin/deployments", Some(spec)).await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["min_nodes"], 1);

    let (status, body) = admin(&h.app, "GET", "/admin/deployments", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deployments"].as_array().unwrap().len(), 1);

    let (status, body) = admin(
        &h.app,
        "PUT",
        "/admin/deployments/acme/llama-70b/scale",
        Some(json!({ "min_nodes": 4, "max_nodes": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "validation_error");

    let (status, body) = admin(
        &h.app,
        "PUT",
        "/admin/deployments/acme/llama-70b/scale",
        Some(json!({ "min_nodes": 2, "max_nodes": 4 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["max_nodes"], 4);

    let (status, body) = admin(&h.app, "DELETE", "/admin/deployments/acme/llama-70b", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], "acme/llama-70b");

    let (status, _) = admin(&h.app, "GET", "/admin/deployments/acme/llama-70b", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn fleet_spec_converges_through_reconciler() {
    let h = harness();
    let (status, _) = admin(
        &h.app,
        "POST",
        "/admin/deployments",
        Some(json!({ "tenant_id": "acme", "model": "llama-70b", "min_nodes": 2, "max_nodes": 2 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let report = h.plane.reconciler.tick().await.unwrap();
    assert_eq!(report.created.len(), 2);
    assert_eq!(h.fake.launch_count(), 2);

    let (_, nodes) = admin(&h.app, "GET", "/admin/nodes", None).await;
    assert_eq!(nodes.as_array().unwrap().len(), 2);
}

// ── Credentials ───────────────────────────────────────────────────

#[tokio::test]
async fn credentials_never_leave_the_vault() {
    let h = harness();
    let (status, body) = admin(
        &h.app,
        "POST",
        "/admin/credentials",
        Some(json!({
            "tenant_id": "acme",
            "provider": "aws",
            "credentials": { "access_key_id": "AKIAEXAMPLE", "secret_access_key": "very-secret-value" },
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["key_id"], "v1");

    let (status, body) = admin(&h.app, "GET", "/admin/credentials?tenant_id=acme", None).await;
    assert_eq!(status, StatusCode::OK);
    let text = body.to_string();
    assert!(!text.contains("very-secret-value"));
    assert!(!text.contains("AKIAEXAMPLE"));
    assert!(!text.contains("ciphertext"));
    assert_eq!(body["credentials"].as_array().unwrap().len(), 1);

    let (status, body) = admin(
        &h.app,
        "POST",
        "/admin/credentials/rotate",
        Some(json!({ "key_id": "v2", "master_secret": "next-secret" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["rotated"], 1);

    let (_, body) = admin(&h.app, "GET", "/admin/credentials", None).await;
    assert_eq!(body["credentials"][0]["key_id"], "v2");

    let loaded = h.api.credentials.load("acme", "aws").unwrap();
    assert!(loaded.is_some());
}

#[tokio::test]
async fn incomplete_credentials_are_rejected() {
    let h = harness();
    let (status, body) = admin(
        &h.app,
        "POST",
        "/admin/credentials",
        Some(json!({
            "tenant_id": "acme",
            "provider": "aws",
            "credentials": { "access_key_id": "AKIAEXAMPLE" },
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "crypto_error");
    assert!(body["error"]["message"].as_str().unwrap().contains("secret_access_key"));

    let (status, _) = admin(
        &h.app,
        "POST",
        "/admin/credentials",
        Some(json!({ "tenant_id": "acme", "provider": "mainframe", "credentials": {} })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// ── Launch log stream ─────────────────────────────────────────────

#[tokio::test]
async fn log_stream_of_active_node_ends_with_done() {
    let h = harness();
    register_node(&h.app, "node-s", "acme", "llama-70b").await;
    h.api.deployments.lifecycle().promote("node-s").unwrap();

    let (status, content_type, body) = stream_body(&h.app, "node-s").await;
    assert_eq!(status, StatusCode::OK);
    assert!(content_type.starts_with("text/event-stream"));
    assert!(body.contains("event: log"));
    assert!(body.contains("event: status"));
    assert!(body.contains("event: done"));
    assert!(body.contains("\"status\":\"active\""));
    assert!(body.contains("http://node-s.internal:8000"));
}

#[tokio::test]
async fn log_stream_of_terminated_node_reports_error_then_done() {
    let h = harness();
    register_node(&h.app, "node-t", "acme", "llama-70b").await;
    let (status, body) = admin(&h.app, "POST", "/admin/nodes/node-t/terminate", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "terminated");

    let (status, _, body) = stream_body(&h.app, "node-t").await;
    assert_eq!(status, StatusCode::OK);
    let error_at = body.find("event: error").unwrap();
    let done_at = body.find("event: done").unwrap();
    assert!(error_at < done_at);
    assert!(body.contains("\"status\":\"terminated\""));
}

#[tokio::test]
async fn log_stream_of_unknown_node_is_not_found() {
    let h = harness();
    let (status, _, _) = stream_body(&h.app, "node-missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
