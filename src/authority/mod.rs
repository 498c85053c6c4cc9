//! Remote authority ("main server") client.
//!
//! The authority is the system of record for sessions; this agent only
//! reads session lists and reports what it did. All calls go through the
//! [`Authority`] trait:
//!
//! - [`HttpAuthority`] - JSON over HTTP with a fixed timeout
//! - [`MemoryAuthority`] - scripted sessions, records every report (for testing)

mod http;
mod memory;

pub use http::HttpAuthority;
pub use memory::MemoryAuthority;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Authority client error.
#[derive(Debug, Error)]
pub enum AuthorityError {
    /// Transport failure or unexpected HTTP status.
    #[error("authority request failed: {0}")]
    Http(String),

    #[error("authority request timed out after {0:?}")]
    Timeout(Duration),

    /// The authority answered `success: false`.
    #[error("authority rejected request: {0}")]
    Rejected(String),

    #[error("failed to decode authority response: {0}")]
    Decode(String),
}

/// A session as held by the authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,

    #[serde(rename = "userIP", default)]
    pub user_ip: String,

    #[serde(default)]
    pub contract_id: String,

    #[serde(default)]
    pub remaining_time_secs: i64,

    #[serde(default)]
    pub last_time_update: Option<DateTime<Utc>>,

    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub actual_duration_seconds: u64,
}

impl Session {
    pub fn new(session_id: impl Into<String>, user_ip: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_ip: user_ip.into(),
            contract_id: String::new(),
            remaining_time_secs: 0,
            last_time_update: None,
            start_time: None,
            actual_duration_seconds: 0,
        }
    }

    /// The session IP, if it is a well-formed IPv4 address.
    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.user_ip.trim().parse().ok()
    }
}

/// Time accounting delta for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTimeUpdate {
    pub session_id: String,
    pub last_time_update: DateTime<Utc>,
    pub remaining_time_secs: i64,
    pub actual_duration_seconds: u64,
}

/// Byte counts for one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataUsage {
    pub download_bytes: u64,
    pub upload_bytes: u64,
    pub total_bytes: u64,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageUpdate {
    pub session_id: String,
    #[serde(rename = "userIP")]
    pub user_ip: String,
    pub data_usage: DataUsage,
}

/// Host health snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    pub timestamp: DateTime<Utc>,
    /// Percent
    pub cpu_usage: f32,
    /// Percent
    pub memory_usage: f32,
    /// Celsius, 0 when no sensor is readable
    pub temperature: f32,
    /// Percent of the root filesystem
    pub disk_usage: f32,
    /// Seconds
    pub uptime: u64,
}

/// Per-item result of a batch report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    #[serde(default)]
    pub success_count: usize,
    #[serde(default)]
    pub error_count: usize,
}

/// Remote authority capability.
#[async_trait]
pub trait Authority: Send + Sync {
    async fn list_active_sessions(&self, contract_id: &str) -> Result<Vec<Session>, AuthorityError>;

    async fn list_expired_sessions(&self, contract_id: &str)
        -> Result<Vec<Session>, AuthorityError>;

    async fn report_time_updates(
        &self,
        updates: &[SessionTimeUpdate],
    ) -> Result<ReportSummary, AuthorityError>;

    /// Mark sessions expired after their rules were removed.
    async fn report_expired(&self, session_ids: &[String]) -> Result<(), AuthorityError>;

    async fn report_pause(
        &self,
        session_id: &str,
        user_ip: &str,
        contract_id: &str,
    ) -> Result<(), AuthorityError>;

    async fn report_usage(&self, updates: &[UsageUpdate]) -> Result<ReportSummary, AuthorityError>;

    async fn report_system_metrics(
        &self,
        contract_id: &str,
        metrics: &SystemMetrics,
    ) -> Result<(), AuthorityError>;

    /// Whether `ip` is on the ban list.
    async fn check_banned(&self, ip: Ipv4Addr) -> Result<bool, AuthorityError>;

    async fn activate_temp_access(&self, ip: Ipv4Addr) -> Result<(), AuthorityError>;

    async fn deactivate_temp_access(&self, ip: Ipv4Addr) -> Result<(), AuthorityError>;
}

/// Shared authority handle.
pub type SharedAuthority = Arc<dyn Authority>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_wire_format() {
        let json = r#"{
            "sessionId": "S1",
            "userIP": "10.0.0.5",
            "contractId": "C",
            "remainingTimeSecs": 1200,
            "lastTimeUpdate": "2026-01-10T12:00:00Z",
            "actualDurationSeconds": 30
        }"#;

        let session: Session = serde_json::from_str(json).unwrap();
        assert_eq!(session.session_id, "S1");
        assert_eq!(session.ip(), Some(Ipv4Addr::new(10, 0, 0, 5)));
        assert_eq!(session.remaining_time_secs, 1200);
        assert!(session.start_time.is_none());
    }

    #[test]
    fn test_session_with_bad_ip() {
        let session = Session::new("S2", "10.0.0");
        assert_eq!(session.ip(), None);
    }

    #[test]
    fn test_usage_update_serialization() {
        let update = UsageUpdate {
            session_id: "S1".to_string(),
            user_ip: "10.0.0.5".to_string(),
            data_usage: DataUsage {
                download_bytes: 10,
                upload_bytes: 5,
                total_bytes: 15,
                last_updated: DateTime::parse_from_rfc3339("2026-01-10T12:00:00Z")
                    .unwrap()
                    .with_timezone(&Utc),
            },
        };

        let value = serde_json::to_value(&update).unwrap();
        assert_eq!(value["userIP"], "10.0.0.5");
        assert_eq!(value["dataUsage"]["totalBytes"], 15);
    }
}
