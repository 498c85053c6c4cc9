//! Admin API integration tests
//!
//! Tests for /healthz, /readyz, /livez, /stats, /metrics endpoints

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;

use portald::admin::{AdminServer, AdminState};
use portald::authority::MemoryAuthority;
use portald::bootstrap::ShutdownManager;
use portald::config::{FirewallConfig, GraceConfig};
use portald::grace::GraceMonitor;
use portald::network::NetworkGate;
use portald::ruletool::{MemoryConnections, MemoryRuleTool};
use portald::telemetry::Metrics;

/// Port allocator for tests
static PORT: AtomicU16 = AtomicU16::new(19100);

fn next_port() -> u16 {
    PORT.fetch_add(1, Ordering::SeqCst)
}

/// The default registry accepts one exporter per process
fn metrics() -> &'static Metrics {
    static METRICS: OnceLock<Metrics> = OnceLock::new();
    METRICS.get_or_init(|| Metrics::global().expect("metrics"))
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Debug, Deserialize)]
struct ReadinessResponse {
    ready: bool,
    contract_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatsResponse {
    uptime_seconds: u64,
    ready: bool,
    contract_id: String,
    firewall: FirewallStats,
    grace: GraceSummary,
}

#[derive(Debug, Deserialize)]
struct FirewallStats {
    accept_rules: usize,
    bypass_rules: usize,
    blocked_rules: usize,
    ledger_entries: usize,
}

#[derive(Debug, Deserialize)]
struct GraceSummary {
    active: usize,
    grants: Vec<GraceGrantView>,
}

#[derive(Debug, Deserialize)]
struct GraceGrantView {
    ip: Ipv4Addr,
}

/// Test fixture that serves the admin API on a unique port
struct TestServer {
    handle: tokio::task::JoinHandle<()>,
    state: Arc<AdminState>,
    tool: Arc<MemoryRuleTool>,
    authority: Arc<MemoryAuthority>,
    shutdown: Arc<ShutdownManager>,
    base_url: String,
}

impl TestServer {
    async fn start() -> Self {
        metrics();

        let tool = Arc::new(MemoryRuleTool::new());
        let authority = Arc::new(MemoryAuthority::new());
        let gate = Arc::new(NetworkGate::new(
            FirewallConfig::default(),
            tool.clone(),
            authority.clone(),
            false,
        ));
        let state = Arc::new(AdminState::new(gate));
        let shutdown = ShutdownManager::new(Duration::from_secs(5));

        let port = next_port();
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .expect("bind");

        let server = AdminServer::new(&Default::default(), state.clone(), shutdown.subscribe());
        let handle = tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        Self {
            handle,
            state,
            tool,
            authority,
            shutdown,
            base_url: format!("http://127.0.0.1:{}", port),
        }
    }

    async fn initialize(&self) {
        self.state
            .gate()
            .initialize("C")
            .await
            .expect("gate initialize");
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[tokio::test]
async fn test_healthz_returns_healthy() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(server.url("/healthz"))
        .send()
        .await
        .expect("request failed");

    assert_eq!(resp.status(), StatusCode::OK);

    let body: HealthResponse = resp.json().await.expect("invalid json");
    assert_eq!(body.status, "healthy");
    assert!(!body.version.is_empty());
}

#[tokio::test]
async fn test_livez_returns_ok() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(server.url("/livez"))
        .send()
        .await
        .expect("request failed");

    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_readyz_follows_gate() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(server.url("/readyz"))
        .send()
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: ReadinessResponse = resp.json().await.expect("invalid json");
    assert!(!body.ready);

    server.initialize().await;

    let resp = client
        .get(server.url("/readyz"))
        .send()
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::OK);
    let body: ReadinessResponse = resp.json().await.expect("invalid json");
    assert!(body.ready);
    assert_eq!(body.contract_id.as_deref(), Some("C"));

    server.state.gate().shutdown().await;
}

#[tokio::test]
async fn test_stats_not_ready_has_retry_after() {
    let server = TestServer::start().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(server.url("/stats"))
        .send()
        .await
        .expect("request failed");

    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(resp.headers()["retry-after"], "5");
}

#[tokio::test]
async fn test_stats_reports_rules_and_grace_grants() {
    let server = TestServer::start().await;
    server.initialize().await;

    let facade = server.state.gate().get().expect("ready");
    assert!(facade.whitelist_ip("S1", "10.0.0.5").await.success);

    let engine = facade.engine().clone();
    let grace = GraceMonitor::new(
        GraceConfig::default(),
        server.tool.clone(),
        Arc::new(MemoryConnections::new()),
        server.authority.clone(),
        engine.chain_lock(),
    );
    grace.grant_temporary_access("10.0.0.9").await.expect("grace grant");
    server.state.set_grace(grace.clone());

    let client = reqwest::Client::new();
    let resp = client
        .get(server.url("/stats"))
        .send()
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::OK);

    let body: StatsResponse = resp.json().await.expect("invalid json");
    assert!(body.uptime_seconds < 60);
    assert!(body.ready);
    assert_eq!(body.contract_id, "C");
    assert_eq!(body.firewall.accept_rules, 2);
    assert_eq!(body.firewall.bypass_rules, 1);
    assert_eq!(body.firewall.blocked_rules, 0);
    assert_eq!(body.firewall.ledger_entries, 3);
    assert_eq!(body.grace.active, 1);
    assert_eq!(body.grace.grants[0].ip, Ipv4Addr::new(10, 0, 0, 9));

    grace.cleanup_all().await;
    server.state.gate().shutdown().await;
}

#[tokio::test]
async fn test_metrics_returns_prometheus_format() {
    let server = TestServer::start().await;
    server.initialize().await;

    let facade = server.state.gate().get().expect("ready");
    facade.whitelist_ip("S2", "10.0.0.6").await;

    let client = reqwest::Client::new();
    let resp = client
        .get(server.url("/metrics"))
        .send()
        .await
        .expect("request failed");

    assert_eq!(resp.status(), StatusCode::OK);

    let body = resp.text().await.expect("body");
    assert!(body.contains("portal_grants_total"));

    server.state.gate().shutdown().await;
}

#[tokio::test]
async fn test_server_stops_on_drain() {
    let server = TestServer::start().await;
    server.shutdown.start_drain();

    let stopped = tokio::time::timeout(Duration::from_secs(5), async {
        while !server.handle.is_finished() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(stopped.is_ok());
}
