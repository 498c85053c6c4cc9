use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info, span, warn, Instrument, Level};

use crate::admin::{AdminServer, AdminState};
use crate::authority::{HttpAuthority, SharedAuthority};
use crate::config::Config;
use crate::grace::GraceMonitor;
use crate::network::NetworkGate;
use crate::ruletool::{ConntrackReader, IptablesTool, SharedRuleTool, SharedTracker};
use crate::telemetry::Metrics;
use crate::usage::UsageSync;

use super::shutdown::{wait_for_signal, ShutdownManager};

/// Main portald server
///
/// Components:
/// - Network gate: owns the firewall engine once initialized
/// - Grace monitor: temporary access while payments are verified
/// - Usage sync: byte deltas and host metrics to the authority
/// - Admin server: health, readiness, stats and Prometheus metrics
/// - Shutdown manager: stops the loops and cleans up within a timeout
pub struct Server {
    config: Arc<Config>,

    /// Skip startup restoration regardless of config
    no_restore: bool,

    shutdown: Arc<ShutdownManager>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config, no_restore: bool) -> Self {
        let shutdown = ShutdownManager::new(config.shutdown.timeout);

        Self {
            config: Arc::new(config),
            no_restore,
            shutdown,
        }
    }

    /// Run the server until shutdown
    pub async fn run(self) -> Result<()> {
        let span = span!(
            Level::INFO,
            "portald",
            version = env!("CARGO_PKG_VERSION"),
            contract_id = %self.config.contract_id
        );
        self.run_inner().instrument(span).await
    }

    async fn run_inner(self) -> Result<()> {
        let config = &self.config;

        info!(
            authority = %config.authority.url,
            auth_chain = %config.firewall.auth_chain,
            grace_chain = %config.grace.chain,
            "starting portald server"
        );

        let _metrics = Metrics::global().context("failed to initialize metrics")?;

        let tool: SharedRuleTool = Arc::new(IptablesTool::new(&config.firewall));
        let tracker: SharedTracker = Arc::new(ConntrackReader::new(&config.firewall));
        let authority: SharedAuthority = Arc::new(
            HttpAuthority::new(&config.authority, &config.contract_id)
                .context("failed to build authority client")?,
        );

        let restore = config.firewall.restore_on_start && !self.no_restore;
        let gate = Arc::new(NetworkGate::new(
            config.firewall.clone(),
            tool.clone(),
            authority.clone(),
            restore,
        ));

        // Admin comes up first so /readyz answers 503 while the firewall initializes
        let admin_state = Arc::new(AdminState::new(gate.clone()));
        let admin = AdminServer::new(&config.admin, admin_state.clone(), self.shutdown.subscribe());
        let admin_handle = tokio::spawn(async move {
            if let Err(e) = admin.run().await {
                error!(error = %e, "admin server failed");
            }
        });

        let facade = gate
            .initialize(&config.contract_id)
            .await
            .context("failed to initialize firewall")?;
        let engine = facade.engine().clone();

        let grace = GraceMonitor::new(
            config.grace.clone(),
            tool,
            tracker,
            authority.clone(),
            engine.chain_lock(),
        );
        admin_state.set_grace(grace.clone());

        let sync = Arc::new(UsageSync::new(config.usage.clone(), engine, authority));
        let sync_handle = tokio::spawn(sync.run(self.shutdown.subscribe()));

        info!(
            admin_address = %config.admin.address,
            restore,
            usage_interval_secs = config.usage.interval.as_secs(),
            shutdown_timeout_secs = config.shutdown.timeout.as_secs(),
            "portald server started"
        );

        wait_for_signal().await;

        info!("shutdown signal received, starting graceful shutdown");
        self.shutdown.start_drain();

        let cleanup = async {
            gate.shutdown().await;
            grace.cleanup_all().await;
            if let Err(e) = sync_handle.await {
                warn!(error = %e, "usage sync task failed");
            }
        };

        if tokio::time::timeout(self.shutdown.timeout(), cleanup).await.is_err() {
            warn!(
                timeout_secs = self.shutdown.timeout().as_secs(),
                "cleanup timeout reached, forcing shutdown"
            );
        }

        self.shutdown.terminate();

        if tokio::time::timeout(self.shutdown.timeout(), admin_handle).await.is_err() {
            warn!("admin server did not stop in time");
        }

        crate::telemetry::shutdown_tracing();

        info!("portald server stopped");

        Ok(())
    }

    /// Get shutdown manager
    pub fn shutdown_manager(&self) -> Arc<ShutdownManager> {
        self.shutdown.clone()
    }
}
