//! Admin API handlers.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use super::AdminState;
use crate::firewall::FirewallStats;
use crate::grace::GraceStatus;

/// Health check response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Liveness of the process itself; firewall readiness is `/readyz`.
pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_id: Option<String>,
}

/// Ready handler (for Kubernetes).
pub async fn ready_handler(State(state): State<Arc<AdminState>>) -> impl IntoResponse {
    let contract_id = state.gate().get().ok().map(|f| f.contract_id().to_string());
    let ready = contract_id.is_some();
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ReadinessResponse { ready, contract_id }))
}

/// Live handler (for Kubernetes).
pub async fn live_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// Stats response.
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub uptime_seconds: u64,
    pub ready: bool,
    pub contract_id: String,
    pub firewall: FirewallStats,
    pub grace: GraceSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraceSummary {
    pub active: usize,
    pub grants: Vec<GraceStatus>,
}

/// Stats handler. 503 with `Retry-After` until the firewall is up.
pub async fn stats_handler(State(state): State<Arc<AdminState>>) -> Response {
    let facade = match state.gate().get() {
        Ok(facade) => facade,
        Err(e) => return e.into_response(),
    };

    let firewall = match facade.engine().stats().await {
        Ok(stats) => stats,
        Err(e) => {
            warn!(error = %e, "failed to collect firewall stats");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": "failed to collect firewall stats" })),
            )
                .into_response();
        }
    };

    let grants = state.grace().map(|g| g.active()).unwrap_or_default();

    Json(StatsResponse {
        uptime_seconds: state.uptime().as_secs(),
        ready: true,
        contract_id: facade.contract_id().to_string(),
        firewall,
        grace: GraceSummary {
            active: grants.len(),
            grants,
        },
    })
    .into_response()
}

/// Metrics handler (Prometheus format).
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let output = String::from_utf8(buffer).unwrap_or_default();
            (
                StatusCode::OK,
                [("content-type", "text/plain; charset=utf-8")],
                output,
            )
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Error encoding metrics: {}", e),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::MemoryAuthority;
    use crate::config::FirewallConfig;
    use crate::network::NetworkGate;
    use crate::ruletool::MemoryRuleTool;
    use axum::http::header;

    fn state() -> Arc<AdminState> {
        let gate = NetworkGate::new(
            FirewallConfig::default(),
            Arc::new(MemoryRuleTool::new()),
            Arc::new(MemoryAuthority::new()),
            false,
        );
        Arc::new(AdminState::new(Arc::new(gate)))
    }

    #[tokio::test]
    async fn test_not_ready_until_gate_initialized() {
        let state = state();

        let response = ready_handler(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response = stats_handler(State(state.clone())).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "5");

        state.gate().initialize("C").await.unwrap();

        let response = ready_handler(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        let response = stats_handler(State(state.clone())).await;
        assert_eq!(response.status(), StatusCode::OK);
        state.gate().shutdown().await;
    }

    #[tokio::test]
    async fn test_live_and_health() {
        assert_eq!(live_handler().await.into_response().status(), StatusCode::OK);
        assert_eq!(health_handler().await.into_response().status(), StatusCode::OK);
    }
}
