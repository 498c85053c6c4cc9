//! Admin HTTP server.

use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use crate::bootstrap::ShutdownState;
use crate::config::AdminConfig;
use crate::grace::GraceMonitor;
use crate::network::NetworkGate;

use super::handlers::{health_handler, live_handler, metrics_handler, ready_handler, stats_handler};

/// Admin server state.
pub struct AdminState {
    /// Server start time
    start_time: Instant,
    gate: Arc<NetworkGate>,
    /// Set once the firewall is up; the grace monitor shares its chain lock
    grace: OnceLock<Arc<GraceMonitor>>,
}

impl AdminState {
    pub fn new(gate: Arc<NetworkGate>) -> Self {
        Self {
            start_time: Instant::now(),
            gate,
            grace: OnceLock::new(),
        }
    }

    /// Get uptime.
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn gate(&self) -> &Arc<NetworkGate> {
        &self.gate
    }

    pub fn is_ready(&self) -> bool {
        self.gate.is_ready()
    }

    pub fn grace(&self) -> Option<&Arc<GraceMonitor>> {
        self.grace.get()
    }

    /// Attach the grace monitor. Later calls are ignored.
    pub fn set_grace(&self, grace: Arc<GraceMonitor>) {
        let _ = self.grace.set(grace);
    }
}

/// Admin HTTP server.
pub struct AdminServer {
    config: AdminConfig,
    state: Arc<AdminState>,
    shutdown_rx: watch::Receiver<ShutdownState>,
}

impl AdminServer {
    pub fn new(
        config: &AdminConfig,
        state: Arc<AdminState>,
        shutdown_rx: watch::Receiver<ShutdownState>,
    ) -> Self {
        Self {
            config: config.clone(),
            state,
            shutdown_rx,
        }
    }

    /// Build the router.
    pub fn router(state: Arc<AdminState>) -> Router {
        Router::new()
            .route("/healthz", get(health_handler))
            .route("/livez", get(live_handler))
            .route("/readyz", get(ready_handler))
            .route("/stats", get(stats_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(state)
    }

    /// Bind and serve until shutdown starts.
    pub async fn run(self) -> std::io::Result<()> {
        let addr = self.config.address;
        info!(address = %addr, "starting admin server");

        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        let router = Self::router(self.state.clone());
        let mut shutdown_rx = self.shutdown_rx;

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                while *shutdown_rx.borrow() == ShutdownState::Running {
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("admin server shutting down");
            })
            .await
    }
}
