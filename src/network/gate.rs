//! Readiness gate in front of the network facade.
//!
//! The gate is built once by the server and handed to every consumer.
//! It constructs and initializes at most one facade; handlers ask it for
//! the facade and get [`GateError::NotInitialized`] until startup is done.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use super::facade::NetworkFacade;
use crate::authority::SharedAuthority;
use crate::config::FirewallConfig;
use crate::firewall::{FirewallEngine, FirewallError};
use crate::ruletool::SharedRuleTool;

/// Seconds a client should wait before retrying a not-ready request.
pub const RETRY_AFTER: Duration = Duration::from_secs(5);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("network service not initialized")]
    NotInitialized,
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::RETRY_AFTER, RETRY_AFTER.as_secs().to_string())],
            Json(json!({ "success": false, "error": self.to_string() })),
        )
            .into_response()
    }
}

pub struct NetworkGate {
    config: FirewallConfig,
    tool: SharedRuleTool,
    authority: SharedAuthority,
    restore: bool,
    facade: OnceCell<Arc<NetworkFacade>>,
}

impl NetworkGate {
    pub fn new(
        config: FirewallConfig,
        tool: SharedRuleTool,
        authority: SharedAuthority,
        restore: bool,
    ) -> Self {
        Self {
            config,
            tool,
            authority,
            restore,
            facade: OnceCell::new(),
        }
    }

    /// Construct and initialize the facade. Later calls return the same
    /// facade. A failed attempt leaves the gate uninitialized.
    pub async fn initialize(&self, contract_id: &str) -> Result<Arc<NetworkFacade>, FirewallError> {
        let facade = self
            .facade
            .get_or_try_init(|| async {
                let engine = FirewallEngine::new(
                    contract_id,
                    self.config.clone(),
                    self.tool.clone(),
                    self.authority.clone(),
                );
                let facade = NetworkFacade::new(engine);
                if let Some(report) = facade.initialize(self.restore).await? {
                    info!(
                        restored = report.restored,
                        paused = report.paused,
                        expired = report.expired,
                        errors = report.errors,
                        "startup restoration finished"
                    );
                }
                Ok::<_, FirewallError>(Arc::new(facade))
            })
            .await?;

        if facade.contract_id() != contract_id {
            warn!(
                active = facade.contract_id(),
                requested = contract_id,
                "gate already initialized for another contract"
            );
        }
        Ok(facade.clone())
    }

    /// True between a successful initialize and shutdown.
    pub fn is_ready(&self) -> bool {
        self.facade.get().is_some_and(|f| f.engine().is_ready())
    }

    pub fn get(&self) -> Result<Arc<NetworkFacade>, GateError> {
        self.facade
            .get()
            .filter(|f| f.engine().is_ready())
            .cloned()
            .ok_or(GateError::NotInitialized)
    }

    /// Facade's engine, when ready. Shared with the usage loop.
    pub fn engine(&self) -> Option<Arc<FirewallEngine>> {
        self.facade.get().map(|f| f.engine().clone())
    }

    pub async fn shutdown(&self) {
        if let Some(facade) = self.facade.get() {
            facade.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::MemoryAuthority;
    use crate::ruletool::{MemoryRuleTool, Table, ToolOp, FORWARD_CHAIN};

    fn gate(tool: Arc<MemoryRuleTool>) -> NetworkGate {
        NetworkGate::new(
            FirewallConfig::default(),
            tool,
            Arc::new(MemoryAuthority::new()),
            false,
        )
    }

    #[tokio::test]
    async fn test_not_ready_before_initialize() {
        let gate = gate(Arc::new(MemoryRuleTool::new()));
        assert!(!gate.is_ready());
        assert_eq!(gate.get().unwrap_err(), GateError::NotInitialized);

        let response = GateError::NotInitialized.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "5");
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let tool = Arc::new(MemoryRuleTool::new());
        let gate = gate(tool.clone());

        let first = gate.initialize("C").await.unwrap();
        let second = gate.initialize("C").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(gate.is_ready());
        assert_eq!(tool.invocations(ToolOp::Version), 1);
        assert_eq!(tool.rules(Table::Filter, FORWARD_CHAIN).len(), 2);
        gate.shutdown().await;
    }

    #[tokio::test]
    async fn test_not_ready_after_shutdown() {
        let tool = Arc::new(MemoryRuleTool::new());
        let gate = gate(tool);

        gate.initialize("C").await.unwrap();
        assert!(gate.is_ready());

        gate.shutdown().await;
        assert!(!gate.is_ready());
        assert_eq!(gate.get().unwrap_err(), GateError::NotInitialized);
    }

    #[tokio::test]
    async fn test_failed_initialize_can_be_retried() {
        let tool = Arc::new(MemoryRuleTool::new());
        let gate = gate(tool.clone());

        tool.fail_next(ToolOp::Version, 1);
        assert!(matches!(
            gate.initialize("C").await,
            Err(FirewallError::ToolUnavailable(_))
        ));
        assert!(!gate.is_ready());

        gate.initialize("C").await.unwrap();
        assert!(gate.get().is_ok());
        gate.shutdown().await;
    }
}
