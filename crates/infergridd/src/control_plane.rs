//! Control plane assembly and the `serve` run loop.
//!
//! In this mode, the daemon:
//! 1. Opens the redb state store and restores the node registry
//! 2. Wires allocator, scheduler, router, safety monitor, health monitor,
//!    lifecycle driver, reconciler, deployment controller and vault
//! 3. Runs the probe, staleness sweep, reconcile and event log loops
//! 4. Serves the HTTP API until Ctrl-C, then stops every loop

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use infergrid_api::{ApiState, KeyRateLimiter, build_router};
use infergrid_core::{ControlPlaneConfig, HealthSettings, ProvisionerSettings};
use infergrid_fleet::{
    DeploymentController, DisabledProvisioner, FleetPolicy, HttpProvisioner, Lifecycle, NodeLogStore,
    Provisioner, Reconciler,
};
use infergrid_health::{HealthMonitor, MonitorSettings, SafetyMonitor};
use infergrid_scheduler::{CapacityAllocator, LoadTracker, Router, Scheduler};
use infergrid_state::{Clock, Event, EventBus, EventKind, NodeRegistry, StateStore, SystemClock};
use infergrid_vault::{CredentialService, Vault};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

const EVENT_BUS_CAPACITY: usize = 1024;

/// Every long-lived subsystem, wired together.
pub struct ControlPlane {
    pub api: ApiState,
    pub health: Arc<HealthMonitor>,
    pub reconciler: Arc<Reconciler>,
    pub events: EventBus,
}

fn monitor_settings(health: &HealthSettings) -> MonitorSettings {
    MonitorSettings {
        probe_path: health.probe_path.clone(),
        probe_timeout: health.probe_timeout(),
        probe_interval: health.probe_interval(),
        sweep_interval: health.sweep_interval(),
        staleness_threshold: health.staleness_threshold(),
    }
}

/// HTTP provisioner when an endpoint is configured; otherwise launches are
/// refused and nodes can only join through registration.
pub fn provisioner_from_settings(settings: &ProvisionerSettings) -> anyhow::Result<Arc<dyn Provisioner>> {
    if settings.endpoint.trim().is_empty() {
        warn!("no provisioner endpoint configured, node launches are disabled");
        return Ok(Arc::new(DisabledProvisioner));
    }
    let provisioner = HttpProvisioner::new(&settings.endpoint, settings.timeout())
        .with_context(|| format!("provisioner endpoint {}", settings.endpoint))?;
    info!(endpoint = %settings.endpoint, "http provisioner configured");
    Ok(Arc::new(provisioner))
}

impl ControlPlane {
    pub fn assemble(
        config: &ControlPlaneConfig,
        store: StateStore,
        provisioner: Arc<dyn Provisioner>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let events = EventBus::new(EVENT_BUS_CAPACITY);

        let nodes = Arc::new(NodeRegistry::load(store.clone(), events.clone(), clock.clone())?);

        let allocator = Arc::new(CapacityAllocator::with_store(store.clone(), clock.clone())?);
        let load = LoadTracker::new();
        let scheduler = Arc::new(Scheduler::new(nodes.clone(), load.clone()));
        let router = Arc::new(
            Router::new(allocator.clone(), scheduler, clock.clone()).with_usage_store(store.clone()),
        );
        info!("allocator, scheduler and router initialized");

        let safety = Arc::new(SafetyMonitor::new(
            config.safety.quorum,
            config.safety.signal_freshness(),
            events.clone(),
            clock.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            nodes.clone(),
            safety.clone(),
            monitor_settings(&config.health),
        ));
        info!(quorum = safety.quorum(), "health and safety monitors initialized");

        let logs = Arc::new(NodeLogStore::new(clock.clone()));
        let lifecycle = Arc::new(Lifecycle::new(nodes.clone(), provisioner, logs, safety, load));
        let policy = FleetPolicy::from_settings(&config.reconciler, &config.safety);
        let reconciler = Arc::new(Reconciler::new(lifecycle.clone(), store.clone(), policy));
        let deployments = Arc::new(DeploymentController::new(lifecycle, store.clone()));
        info!("fleet reconciler initialized");

        let vault = Vault::from_settings(&config.vault).with_context(|| {
            format!(
                "vault key {} (set vault.master_secret or {})",
                config.vault.key_id,
                infergrid_core::config::MASTER_SECRET_ENV
            )
        })?;
        let credentials = CredentialService::new(Arc::new(vault), store.clone());
        info!(key_id = %config.vault.key_id, "credential vault initialized");

        let api = ApiState {
            store,
            nodes,
            allocator,
            router,
            health: health.clone(),
            deployments,
            credentials,
            vault: config.vault.clone(),
            admin_token: Arc::from(config.server.admin_token.as_str()),
            retry_after_secs: config.admission.retry_after_secs,
            rate_limits: Arc::new(KeyRateLimiter::new(clock)),
        };

        Ok(Self {
            api,
            health,
            reconciler,
            events,
        })
    }
}

/// Mirror bus events into the log until shutdown.
async fn log_events(mut rx: broadcast::Receiver<Event>, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Ok(event) if event.kind == EventKind::ReconcilerAlert => {
                    warn!(
                        node_id = ?event.node_id,
                        tenant = ?event.tenant_id,
                        payload = %event.payload,
                        "reconciler alert"
                    );
                }
                Ok(event) => {
                    debug!(kind = ?event.kind, node_id = ?event.node_id, tenant = ?event.tenant_id, "event");
                }
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "event log lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}

/// Run the control plane until Ctrl-C.
pub async fn run(config: ControlPlaneConfig) -> anyhow::Result<()> {
    info!("InferGrid control plane starting");

    std::fs::create_dir_all(&config.server.data_dir)
        .with_context(|| format!("create data dir {}", config.server.data_dir.display()))?;
    let db_path = config.server.data_dir.join("infergrid.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    if config.server.admin_token.is_empty() {
        warn!("no admin token configured, every admin request will be rejected");
    }

    let provisioner = provisioner_from_settings(&config.provisioner)?;
    let plane = ControlPlane::assemble(&config, store, provisioner, Arc::new(SystemClock))?;

    // ── Background tasks ─────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let probe_handle = tokio::spawn(plane.health.clone().run_probes(shutdown_rx.clone()));
    let sweep_handle = tokio::spawn(plane.health.clone().run_sweep(shutdown_rx.clone()));
    let reconcile_handle = tokio::spawn(plane.reconciler.clone().run(shutdown_rx.clone()));
    let events_handle = tokio::spawn(log_events(plane.events.subscribe(), shutdown_rx));

    // ── HTTP API ─────────────────────────────────────────────────
    let router = build_router(plane.api);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    server.await?;

    let _ = probe_handle.await;
    let _ = sweep_handle.await;
    let _ = reconcile_handle.await;
    let _ = events_handle.await;

    info!("control plane stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_endpoint_disables_launches() {
        let provisioner = provisioner_from_settings(&ProvisionerSettings::default()).unwrap();
        assert_eq!(provisioner.name(), "disabled");
    }

    #[test]
    fn missing_master_secret_fails_assembly() {
        let store = StateStore::open_in_memory().unwrap();
        let config = ControlPlaneConfig::default();
        let result = ControlPlane::assemble(&config, store, Arc::new(DisabledProvisioner), Arc::new(SystemClock));
        assert!(result.is_err());
    }

    #[test]
    fn health_settings_carry_into_monitor() {
        let mut health = HealthSettings::default();
        health.probe_interval = "3s".to_string();
        let settings = monitor_settings(&health);
        assert_eq!(settings.probe_interval, std::time::Duration::from_secs(3));
        assert_eq!(settings.probe_path, "/health");
    }
}
