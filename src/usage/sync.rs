//! Periodic usage report to the authority.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::host::HostSampler;
use crate::authority::{DataUsage, SharedAuthority, UsageUpdate};
use crate::bootstrap::ShutdownState;
use crate::config::UsageConfig;
use crate::firewall::{FirewallEngine, SessionCounters};
use crate::telemetry::counters;

/// Outcome of one sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    /// Sessions accepted by the authority
    pub reported: usize,
    /// Active sessions with no rules or no new traffic
    pub skipped: usize,
    pub errors: usize,
    pub metrics_reported: bool,
}

/// Bytes accrued since `baseline`, per direction.
///
/// A counter below its baseline means the rule was re-created, so the
/// whole counter is new traffic.
pub fn usage_delta(baseline: Option<&SessionCounters>, current: &SessionCounters) -> SessionCounters {
    let since = |now: u64, before: u64| if now >= before { now - before } else { now };
    match baseline {
        Some(base) => SessionCounters {
            download_bytes: since(current.download_bytes, base.download_bytes),
            upload_bytes: since(current.upload_bytes, base.upload_bytes),
        },
        None => *current,
    }
}

pub struct UsageSync {
    contract_id: String,
    config: UsageConfig,
    engine: Arc<FirewallEngine>,
    authority: SharedAuthority,
    /// Counter values at the last accepted report, per session id
    baselines: Mutex<HashMap<String, SessionCounters>>,
    host: Mutex<HostSampler>,
}

impl UsageSync {
    pub fn new(config: UsageConfig, engine: Arc<FirewallEngine>, authority: SharedAuthority) -> Self {
        Self {
            contract_id: engine.contract_id().to_string(),
            config,
            engine,
            authority,
            baselines: Mutex::new(HashMap::new()),
            host: Mutex::new(HostSampler::new()),
        }
    }

    fn baselines(&self) -> MutexGuard<'_, HashMap<String, SessionCounters>> {
        self.baselines.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Report usage deltas and, when enabled, host metrics.
    pub async fn sync_once(&self) -> SyncReport {
        let mut report = SyncReport::default();
        self.sync_usage(&mut report).await;

        if self.config.system_metrics {
            let metrics = self.host.lock().unwrap_or_else(|e| e.into_inner()).snapshot();
            match self
                .authority
                .report_system_metrics(&self.contract_id, &metrics)
                .await
            {
                Ok(()) => report.metrics_reported = true,
                Err(e) => {
                    warn!(error = %e, "failed to report system metrics");
                    report.errors += 1;
                }
            }
        }

        report
    }

    async fn sync_usage(&self, report: &mut SyncReport) {
        let sessions = match self.authority.list_active_sessions(&self.contract_id).await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "failed to fetch active sessions for usage sync");
                report.errors += 1;
                return;
            }
        };

        let counters = match self.engine.session_counters().await {
            Ok(counters) => counters,
            Err(e) => {
                warn!(error = %e, "failed to read session counters");
                report.errors += 1;
                return;
            }
        };

        let now = Utc::now();
        let mut updates = Vec::new();
        let mut pending = HashMap::new();
        let active: HashSet<&str> = sessions.iter().map(|s| s.session_id.as_str()).collect();

        {
            let mut baselines = self.baselines();
            for session in &sessions {
                let Some(current) = counters.get(&session.session_id) else {
                    report.skipped += 1;
                    continue;
                };

                let delta = usage_delta(baselines.get(&session.session_id), current);
                if delta.total() == 0 {
                    // Nothing to bill; a reset to zero still moves the baseline
                    baselines.insert(session.session_id.clone(), *current);
                    report.skipped += 1;
                    continue;
                }

                updates.push(UsageUpdate {
                    session_id: session.session_id.clone(),
                    user_ip: session.user_ip.clone(),
                    data_usage: DataUsage {
                        download_bytes: delta.download_bytes,
                        upload_bytes: delta.upload_bytes,
                        total_bytes: delta.total(),
                        last_updated: now,
                    },
                });
                pending.insert(session.session_id.clone(), *current);
            }

            baselines.retain(|id, _| active.contains(id.as_str()));
        }

        if updates.is_empty() {
            return;
        }

        match self.authority.report_usage(&updates).await {
            Ok(summary) => {
                self.baselines().extend(pending);
                report.reported += summary.success_count;
                report.errors += summary.error_count;
                counters::usage_report("ok");
                debug!(
                    reported = summary.success_count,
                    errors = summary.error_count,
                    "usage reported"
                );
            }
            Err(e) => {
                warn!(error = %e, sessions = updates.len(), "failed to report usage");
                report.errors += updates.len();
                counters::usage_report("error");
            }
        }
    }

    /// Sync every `usage.interval` until shutdown starts.
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<ShutdownState>) {
        let period = self.config.interval;
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(period_secs = period.as_secs(), "usage sync started");

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() != ShutdownState::Running {
                        info!("usage sync stopping");
                        break;
                    }
                }

                _ = interval.tick() => {
                    let report = self.sync_once().await;
                    debug!(
                        reported = report.reported,
                        skipped = report.skipped,
                        errors = report.errors,
                        "usage sync pass"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authority::{MemoryAuthority, Session};
    use crate::config::FirewallConfig;
    use crate::ruletool::MemoryRuleTool;

    struct Harness {
        sync: UsageSync,
        engine: Arc<FirewallEngine>,
        tool: Arc<MemoryRuleTool>,
        authority: Arc<MemoryAuthority>,
    }

    async fn harness() -> Harness {
        let tool = Arc::new(MemoryRuleTool::new());
        let authority = Arc::new(MemoryAuthority::new());
        let engine = FirewallEngine::new("C", FirewallConfig::default(), tool.clone(), authority.clone());
        engine.initialize(false).await.unwrap();
        engine.whitelist_ip("S1", "10.0.0.5").await.unwrap();
        authority.set_active_sessions(vec![Session {
            remaining_time_secs: 600,
            ..Session::new("S1", "10.0.0.5")
        }]);

        let config = UsageConfig {
            system_metrics: false,
            ..Default::default()
        };
        let sync = UsageSync::new(config, engine.clone(), authority.clone());
        Harness {
            sync,
            engine,
            tool,
            authority,
        }
    }

    fn counters(download_bytes: u64, upload_bytes: u64) -> SessionCounters {
        SessionCounters {
            download_bytes,
            upload_bytes,
        }
    }

    #[test]
    fn test_usage_delta() {
        assert_eq!(usage_delta(None, &counters(10, 5)), counters(10, 5));
        assert_eq!(usage_delta(Some(&counters(10, 5)), &counters(25, 5)), counters(15, 0));
        // Rules re-created by restoration
        assert_eq!(usage_delta(Some(&counters(1000, 500)), &counters(30, 20)), counters(30, 20));
    }

    #[tokio::test]
    async fn test_reports_deltas_between_passes() {
        let h = harness().await;
        h.tool.set_counters("dl_C_S1", 10, 9000);
        h.tool.set_counters("ul_C_S1", 5, 1000);

        let first = h.sync.sync_once().await;
        assert_eq!(first.reported, 1);

        h.tool.set_counters("dl_C_S1", 12, 9500);
        let second = h.sync.sync_once().await;
        assert_eq!(second.reported, 1);

        let reports = h.authority.usage_reports();
        assert_eq!(reports[0][0].data_usage.total_bytes, 10000);
        assert_eq!(reports[1][0].data_usage.download_bytes, 500);
        assert_eq!(reports[1][0].data_usage.upload_bytes, 0);
        assert_eq!(reports[1][0].user_ip, "10.0.0.5");
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_zero_delta_is_not_reported() {
        let h = harness().await;
        let report = h.sync.sync_once().await;

        assert_eq!(report.reported, 0);
        assert_eq!(report.skipped, 1);
        assert!(h.authority.usage_reports().is_empty());
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_failed_report_keeps_baseline() {
        let h = harness().await;
        h.tool.set_counters("dl_C_S1", 10, 4000);

        h.authority.fail_next_usage_reports(1);
        let failed = h.sync.sync_once().await;
        assert_eq!(failed.errors, 1);

        let retried = h.sync.sync_once().await;
        assert_eq!(retried.reported, 1);
        assert_eq!(h.authority.usage_reports()[0][0].data_usage.download_bytes, 4000);
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_restore_restarts_baseline() {
        let h = harness().await;
        h.tool.set_counters("dl_C_S1", 10, 8000);
        h.sync.sync_once().await;

        h.engine.restore_session_state().await;
        h.tool.set_counters("dl_C_S1", 1, 300);
        h.sync.sync_once().await;

        let reports = h.authority.usage_reports();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[1][0].data_usage.download_bytes, 300);
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_inactive_sessions_are_pruned() {
        let h = harness().await;
        h.tool.set_counters("dl_C_S1", 10, 8000);
        h.sync.sync_once().await;
        assert_eq!(h.sync.baselines().len(), 1);

        h.authority.set_active_sessions(Vec::new());
        h.sync.sync_once().await;
        assert!(h.sync.baselines().is_empty());
        h.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_system_metrics_reported_when_enabled() {
        let h = harness().await;
        let sync = UsageSync::new(UsageConfig::default(), h.engine.clone(), h.authority.clone());

        let report = sync.sync_once().await;
        assert!(report.metrics_reported);
        assert_eq!(h.authority.metrics_reports().len(), 1);
        h.engine.shutdown().await;
    }
}
