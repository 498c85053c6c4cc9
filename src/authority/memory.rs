//! Scripted authority for testing without a main server.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;

use super::{
    Authority, AuthorityError, ReportSummary, Session, SessionTimeUpdate, SystemMetrics,
    UsageUpdate,
};

#[derive(Debug, Default)]
struct State {
    active: Vec<Session>,
    expired: Vec<Session>,
    banned: HashSet<Ipv4Addr>,
    unreachable: bool,
    rejected_pauses: HashSet<String>,
    failing_usage_reports: usize,

    time_reports: Vec<Vec<SessionTimeUpdate>>,
    expired_reports: Vec<Vec<String>>,
    pauses: Vec<String>,
    usage_reports: Vec<Vec<UsageUpdate>>,
    metrics_reports: Vec<SystemMetrics>,
    activations: Vec<Ipv4Addr>,
    deactivations: Vec<Ipv4Addr>,
}

/// In-memory [`Authority`].
#[derive(Debug, Default)]
pub struct MemoryAuthority {
    state: Mutex<State>,
    latency: Mutex<Duration>,
}

impl MemoryAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn enter(&self) -> Result<(), AuthorityError> {
        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if !latency.is_zero() {
            sleep(latency).await;
        }
        if self.lock().unreachable {
            return Err(AuthorityError::Http("connection failed: connection refused".into()));
        }
        Ok(())
    }

    /// Delay every call.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    pub fn set_active_sessions(&self, sessions: Vec<Session>) {
        self.lock().active = sessions;
    }

    pub fn set_expired_sessions(&self, sessions: Vec<Session>) {
        self.lock().expired = sessions;
    }

    pub fn ban(&self, ip: Ipv4Addr) {
        self.lock().banned.insert(ip);
    }

    /// Fail every call with a transport error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.lock().unreachable = unreachable;
    }

    /// Answer `success: false` to pause reports for this session.
    pub fn reject_pause(&self, session_id: &str) {
        self.lock().rejected_pauses.insert(session_id.to_string());
    }

    /// Reject the next `times` usage reports.
    pub fn fail_next_usage_reports(&self, times: usize) {
        self.lock().failing_usage_reports += times;
    }

    pub fn time_reports(&self) -> Vec<Vec<SessionTimeUpdate>> {
        self.lock().time_reports.clone()
    }

    pub fn expired_reports(&self) -> Vec<Vec<String>> {
        self.lock().expired_reports.clone()
    }

    /// Session ids reported paused, in order.
    pub fn pauses(&self) -> Vec<String> {
        self.lock().pauses.clone()
    }

    pub fn usage_reports(&self) -> Vec<Vec<UsageUpdate>> {
        self.lock().usage_reports.clone()
    }

    pub fn metrics_reports(&self) -> Vec<SystemMetrics> {
        self.lock().metrics_reports.clone()
    }

    pub fn activations(&self) -> Vec<Ipv4Addr> {
        self.lock().activations.clone()
    }

    pub fn deactivations(&self) -> Vec<Ipv4Addr> {
        self.lock().deactivations.clone()
    }
}

#[async_trait]
impl Authority for MemoryAuthority {
    async fn list_active_sessions(&self, _contract_id: &str) -> Result<Vec<Session>, AuthorityError> {
        self.enter().await?;
        Ok(self.lock().active.clone())
    }

    async fn list_expired_sessions(
        &self,
        _contract_id: &str,
    ) -> Result<Vec<Session>, AuthorityError> {
        self.enter().await?;
        Ok(self.lock().expired.clone())
    }

    async fn report_time_updates(
        &self,
        updates: &[SessionTimeUpdate],
    ) -> Result<ReportSummary, AuthorityError> {
        self.enter().await?;
        self.lock().time_reports.push(updates.to_vec());
        Ok(ReportSummary {
            success_count: updates.len(),
            error_count: 0,
        })
    }

    async fn report_expired(&self, session_ids: &[String]) -> Result<(), AuthorityError> {
        self.enter().await?;
        let mut state = self.lock();
        state.expired_reports.push(session_ids.to_vec());
        state.expired.retain(|s| !session_ids.contains(&s.session_id));
        Ok(())
    }

    async fn report_pause(
        &self,
        session_id: &str,
        _user_ip: &str,
        _contract_id: &str,
    ) -> Result<(), AuthorityError> {
        self.enter().await?;
        let mut state = self.lock();
        if state.rejected_pauses.contains(session_id) {
            return Err(AuthorityError::Rejected("session cannot be paused".into()));
        }
        state.pauses.push(session_id.to_string());
        Ok(())
    }

    async fn report_usage(&self, updates: &[UsageUpdate]) -> Result<ReportSummary, AuthorityError> {
        self.enter().await?;
        let mut state = self.lock();
        if state.failing_usage_reports > 0 {
            state.failing_usage_reports -= 1;
            return Err(AuthorityError::Rejected("usage report rejected".into()));
        }
        state.usage_reports.push(updates.to_vec());
        Ok(ReportSummary {
            success_count: updates.len(),
            error_count: 0,
        })
    }

    async fn report_system_metrics(
        &self,
        _contract_id: &str,
        metrics: &SystemMetrics,
    ) -> Result<(), AuthorityError> {
        self.enter().await?;
        self.lock().metrics_reports.push(metrics.clone());
        Ok(())
    }

    async fn check_banned(&self, ip: Ipv4Addr) -> Result<bool, AuthorityError> {
        self.enter().await?;
        Ok(self.lock().banned.contains(&ip))
    }

    async fn activate_temp_access(&self, ip: Ipv4Addr) -> Result<(), AuthorityError> {
        self.enter().await?;
        self.lock().activations.push(ip);
        Ok(())
    }

    async fn deactivate_temp_access(&self, ip: Ipv4Addr) -> Result<(), AuthorityError> {
        self.enter().await?;
        self.lock().deactivations.push(ip);
        Ok(())
    }
}
