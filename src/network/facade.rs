//! Network facade over the firewall engine.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::firewall::{FirewallEngine, FirewallError, RestoreReport};

/// Outcome of a grant or revoke, shaped for the HTTP layer.
///
/// Rule-tool output never reaches this type; errors carry the engine's
/// own messages only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AccessResult {
    fn granted(session_id: String) -> Self {
        Self {
            success: true,
            session_id: Some(session_id),
            error: None,
        }
    }

    fn revoked() -> Self {
        Self {
            success: true,
            session_id: None,
            error: None,
        }
    }

    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            session_id: None,
            error: Some(error.into()),
        }
    }
}

/// One firewall engine bound to one deployment.
#[derive(Debug)]
pub struct NetworkFacade {
    contract_id: String,
    engine: Arc<FirewallEngine>,
}

impl NetworkFacade {
    pub fn new(engine: Arc<FirewallEngine>) -> Self {
        Self {
            contract_id: engine.contract_id().to_string(),
            engine,
        }
    }

    pub fn contract_id(&self) -> &str {
        &self.contract_id
    }

    pub fn engine(&self) -> &Arc<FirewallEngine> {
        &self.engine
    }

    pub async fn initialize(&self, restore: bool) -> Result<Option<RestoreReport>, FirewallError> {
        info!(contract_id = %self.contract_id, "initializing network facade");
        self.engine.initialize(restore).await
    }

    pub async fn whitelist_ip(&self, session_id: &str, user_ip: &str) -> AccessResult {
        match self.engine.whitelist_ip(session_id, user_ip).await {
            Ok(outcome) => AccessResult::granted(outcome.session_id),
            Err(e) => {
                warn!(session_id, user_ip, error = %e, "whitelist failed");
                AccessResult::failed(e.to_string())
            }
        }
    }

    pub async fn revoke_ip_access(&self, user_ip: &str, session_id: &str) -> AccessResult {
        let outcome = self.engine.revoke_ip_access(user_ip, session_id).await;
        if outcome.is_success() {
            AccessResult::revoked()
        } else {
            AccessResult::failed(format!(
                "{} rule removal step(s) failed",
                outcome.errors.len()
            ))
        }
    }

    pub async fn shutdown(&self) {
        self.engine.shutdown().await;
    }
}
