//! infergrid-api: the HTTP surface of the control plane.
//!
//! # API Routes
//!
//! | Method | Path | Auth | Description |
//! |---|---|---|---|
//! | POST | `/v1/chat/completions` | API key | Admit and route an inference request (per-key rate limit) |
//! | GET | `/health` | none | Liveness |
//! | GET | `/ready` | none | Readiness (state store reachable) |
//! | GET | `/admin/nodes` | admin | List nodes |
//! | GET | `/admin/nodes/{id}` | admin | Node details |
//! | POST | `/admin/nodes/launch` | admin | Queue a node launch |
//! | POST | `/admin/nodes/register` | admin | Adopt an externally launched node |
//! | POST | `/admin/nodes/{id}/terminate` | admin | Terminate a node |
//! | POST | `/admin/nodes/{id}/drain` | admin | Drain a serving node |
//! | POST | `/admin/nodes/{id}/heartbeat` | admin | Node agent heartbeat |
//! | POST | `/admin/nodes/{id}/termination-warning` | admin | Spot reclaim notice |
//! | GET | `/admin/nodes/{id}/logs` | admin | Launch log history (`?tail=N`) |
//! | GET | `/admin/nodes/{id}/logs/stream` | admin | Launch log event stream |
//! | POST | `/admin/api-keys` | admin | Create a key (raw key returned once) |
//! | GET, DELETE | `/admin/api-keys/{id}` | admin | List a tenant's keys / revoke a key |
//! | GET | `/admin/usage/{tenant}` | admin | Hourly usage |
//! | GET | `/admin/capacity` | admin | Capacity reservations |
//! | PUT | `/admin/capacity/{tenant}` | admin | Reserve capacity |
//! | GET, POST | `/admin/credentials` | admin | Credential metadata / submit |
//! | POST | `/admin/credentials/rotate` | admin | Re-seal every record under a new key |
//! | GET, POST | `/admin/deployments` | admin | Desired fleet specs |
//! | GET, DELETE | `/admin/deployments/{tenant}/{model}` | admin | One fleet spec |
//! | PUT | `/admin/deployments/{tenant}/{model}/scale` | admin | Change node bounds |

pub mod admin;
pub mod auth;
pub mod error;
pub mod handlers;
pub mod ratelimit;
pub mod sse;

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post, put};
use infergrid_core::VaultSettings;
use infergrid_fleet::DeploymentController;
use infergrid_health::HealthMonitor;
use infergrid_scheduler::CapacityAllocator;
use infergrid_state::{NodeRegistry, StateStore};
use infergrid_vault::CredentialService;

pub use error::{ApiError, ApiResult};
pub use ratelimit::KeyRateLimiter;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub store: StateStore,
    pub nodes: Arc<NodeRegistry>,
    pub allocator: Arc<CapacityAllocator>,
    pub router: Arc<infergrid_scheduler::Router>,
    pub health: Arc<HealthMonitor>,
    pub deployments: Arc<DeploymentController>,
    pub credentials: CredentialService,
    /// Salt and iteration count used to derive keys during rotation.
    pub vault: VaultSettings,
    pub admin_token: Arc<str>,
    pub retry_after_secs: u64,
    pub rate_limits: Arc<KeyRateLimiter>,
}

/// Build the complete router: public, inference and admin routes.
pub fn build_router(state: ApiState) -> Router {
    let admin_routes = Router::new()
        .route("/nodes", get(admin::list_nodes))
        .route("/nodes/launch", post(admin::launch_node))
        .route("/nodes/register", post(admin::register_node))
        .route("/nodes/{id}", get(admin::get_node))
        .route("/nodes/{id}/terminate", post(admin::terminate_node))
        .route("/nodes/{id}/drain", post(admin::drain_node))
        .route("/nodes/{id}/heartbeat", post(admin::heartbeat))
        .route("/nodes/{id}/termination-warning", post(admin::termination_warning))
        .route("/nodes/{id}/logs", get(admin::node_logs))
        .route("/nodes/{id}/logs/stream", get(sse::stream_node_logs))
        .route("/api-keys", post(admin::create_api_key))
        .route("/api-keys/{id}", get(admin::list_api_keys).delete(admin::revoke_api_key))
        .route("/usage/{tenant}", get(admin::usage))
        .route("/capacity", get(admin::list_capacity))
        .route("/capacity/{tenant}", put(admin::reserve_capacity))
        .route("/credentials", get(admin::list_credentials).post(admin::submit_credentials))
        .route("/credentials/rotate", post(admin::rotate_credentials))
        .route("/deployments", get(admin::list_deployments).post(admin::set_deployment))
        .route(
            "/deployments/{tenant}/{model}",
            get(admin::get_deployment).delete(admin::delete_deployment),
        )
        .route("/deployments/{tenant}/{model}/scale", put(admin::scale_deployment))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_admin));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/ready", get(handlers::ready))
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .nest("/admin", admin_routes)
        .with_state(state)
}
