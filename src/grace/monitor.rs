//! Temporary access while a payment is verified.
//!
//! Every grant owns one record and one task. The task waits on three
//! things: the cancel token, the auto-revoke deadline and the sampling
//! ticker. Every exit path goes through [`GraceMonitor::terminate`], which
//! removes the record under the IP lock, so a late tick or a duplicate
//! revoke finds nothing to do.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::policy::{GracePolicy, TrafficStats, Violation};
use crate::authority::{AuthorityError, SharedAuthority};
use crate::config::GraceConfig;
use crate::firewall::{ChainLock, KeyedLocks};
use crate::ruletool::{
    parse_listing, ListOptions, RuleMatch, RuleSpec, RuleTarget, SharedRuleTool, SharedTracker,
    Table, ToolError,
};
use crate::telemetry::counters;

const MAX_DUPLICATE_DELETES: usize = 8;

/// Grace monitor error.
#[derive(Debug, Error)]
pub enum GraceError {
    #[error("invalid IP address: {0:?}")]
    InvalidIpAddress(String),

    #[error("{0} is banned from network access")]
    Banned(Ipv4Addr),

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Authority(#[from] AuthorityError),
}

/// How the last grant of an IP ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum GraceOutcome {
    /// Deadline reached without violations
    Expired,
    /// Revoked by a caller
    Revoked,
    /// Cut short by the sampling policy
    Blocked { reason: String },
}

impl GraceOutcome {
    fn label(&self) -> &'static str {
        match self {
            GraceOutcome::Expired => "expired",
            GraceOutcome::Revoked => "revoked",
            GraceOutcome::Blocked { .. } => "blocked",
        }
    }
}

/// Result of a grant request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraceGrant {
    pub ip: Ipv4Addr,
    pub expires_at: DateTime<Utc>,
    /// False when the IP already held a grant
    pub created: bool,
}

/// Live view of a grant.
#[derive(Debug, Clone, Serialize)]
pub struct GraceStatus {
    pub ip: Ipv4Addr,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub stats: TrafficStats,
}

struct GraceRecord {
    generation: u64,
    granted_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    stats: TrafficStats,
    token: CancellationToken,
}

/// Grace access monitor. One per process.
pub struct GraceMonitor {
    config: GraceConfig,
    policy: GracePolicy,
    tool: SharedRuleTool,
    tracker: SharedTracker,
    authority: SharedAuthority,
    chain_lock: ChainLock,
    chain_ready: OnceCell<()>,
    ip_locks: KeyedLocks,
    records: Mutex<HashMap<Ipv4Addr, GraceRecord>>,
    outcomes: Mutex<HashMap<Ipv4Addr, GraceOutcome>>,
    generation: AtomicU64,
}

impl GraceMonitor {
    pub fn new(
        config: GraceConfig,
        tool: SharedRuleTool,
        tracker: SharedTracker,
        authority: SharedAuthority,
        chain_lock: ChainLock,
    ) -> Arc<Self> {
        let policy = GracePolicy::from(&config);
        Arc::new(Self {
            config,
            policy,
            tool,
            tracker,
            authority,
            chain_lock,
            chain_ready: OnceCell::new(),
            ip_locks: KeyedLocks::new(),
            records: Mutex::new(HashMap::new()),
            outcomes: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        })
    }

    fn records(&self) -> MutexGuard<'_, HashMap<Ipv4Addr, GraceRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn outcomes(&self) -> MutexGuard<'_, HashMap<Ipv4Addr, GraceOutcome>> {
        self.outcomes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn rule(ip: Ipv4Addr) -> RuleSpec {
        RuleSpec::new(RuleMatch::Source(ip), RuleTarget::Accept)
    }

    /// Create the grace chain and splice it into FORWARD, once.
    async fn ensure_chain(&self) -> Result<(), GraceError> {
        self.chain_ready
            .get_or_try_init(|| async {
                let _chain = self.chain_lock.lock().await;
                if !self.tool.chain_exists(Table::Filter, &self.config.chain).await? {
                    self.tool.create_chain(Table::Filter, &self.config.chain).await?;
                    info!(chain = %self.config.chain, "created grace chain");
                }
                self.tool.splice_into_forward(&self.config.chain).await?;
                Ok::<(), ToolError>(())
            })
            .await?;
        Ok(())
    }

    /// Grant temporary access to `user_ip` and start monitoring it.
    pub async fn grant_temporary_access(
        self: &Arc<Self>,
        user_ip: &str,
    ) -> Result<GraceGrant, GraceError> {
        let ip: Ipv4Addr = user_ip
            .trim()
            .parse()
            .map_err(|_| GraceError::InvalidIpAddress(user_ip.to_string()))?;

        let _ip_guard = self.ip_locks.lock(&ip.to_string()).await;

        if let Some(record) = self.records().get(&ip) {
            debug!(ip = %ip, "grace access already active");
            return Ok(GraceGrant {
                ip,
                expires_at: record.expires_at,
                created: false,
            });
        }

        let result = self.grant_locked(ip).await;
        counters::grace_grant(match &result {
            Ok(_) => "granted",
            Err(GraceError::Banned(_)) => "banned",
            Err(_) => "failed",
        });
        result
    }

    async fn grant_locked(self: &Arc<Self>, ip: Ipv4Addr) -> Result<GraceGrant, GraceError> {
        if self.authority.check_banned(ip).await? {
            warn!(ip = %ip, "grace access refused for banned IP");
            return Err(GraceError::Banned(ip));
        }

        self.ensure_chain().await?;
        self.authority.activate_temp_access(ip).await?;

        let inserted = {
            let _chain = self.chain_lock.lock().await;
            self.tool
                .insert_rule(Table::Filter, &self.config.chain, 1, &Self::rule(ip))
                .await
        };
        if let Err(e) = inserted {
            if let Err(de) = self.authority.deactivate_temp_access(ip).await {
                warn!(ip = %ip, error = %de, "failed to undo grace activation");
            }
            return Err(e.into());
        }

        let granted_at = Utc::now();
        let expires_at = granted_at
            + chrono::Duration::from_std(self.config.window).unwrap_or_else(|_| chrono::Duration::zero());
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();

        let active = {
            let mut records = self.records();
            records.insert(
                ip,
                GraceRecord {
                    generation,
                    granted_at,
                    expires_at,
                    stats: TrafficStats::default(),
                    token: token.clone(),
                },
            );
            records.len()
        };
        self.outcomes().remove(&ip);
        counters::grace_active_set(active as i64);

        tokio::spawn(Arc::clone(self).watch(ip, generation, token));

        info!(
            ip = %ip,
            window_secs = self.config.window.as_secs(),
            "grace access granted"
        );

        Ok(GraceGrant {
            ip,
            expires_at,
            created: true,
        })
    }

    /// Drive one grant until its deadline, a violation or cancellation.
    async fn watch(self: Arc<Self>, ip: Ipv4Addr, generation: u64, token: CancellationToken) {
        let deadline = sleep(self.config.window);
        tokio::pin!(deadline);

        let started = Instant::now();
        let monitor_until = started + self.config.monitor_window;
        let mut ticker = interval_at(started + self.config.sample_interval, self.config.sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sampling = true;

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => {
                    debug!(ip = %ip, "grace watch cancelled");
                    return;
                }

                _ = &mut deadline => {
                    self.terminate(ip, Some(generation), GraceOutcome::Expired).await;
                    return;
                }

                _ = ticker.tick(), if sampling => {
                    if Instant::now() > monitor_until {
                        debug!(ip = %ip, "grace sampling window elapsed");
                        sampling = false;
                        continue;
                    }
                    if let Some(violation) = self.sample(ip, generation).await {
                        warn!(ip = %ip, reason = %violation, "grace access violation");
                        self.terminate(
                            ip,
                            Some(generation),
                            GraceOutcome::Blocked { reason: violation.to_string() },
                        )
                        .await;
                        return;
                    }
                }
            }
        }
    }

    /// One sampling pass. Tracker failures skip the pass.
    async fn sample(&self, ip: Ipv4Addr, generation: u64) -> Option<Violation> {
        match self.counter_for(ip).await {
            Ok(counter) => {
                let mut records = self.records();
                let record = records.get_mut(&ip).filter(|r| r.generation == generation)?;
                let delta = record.stats.observe(counter, Utc::now());
                debug!(
                    ip = %ip,
                    delta,
                    total = record.stats.total_bytes,
                    "grace traffic sample"
                );
                if let Some(violation) = self.policy.check_traffic(&mut record.stats, delta) {
                    return Some(violation);
                }
            }
            Err(e) => {
                warn!(ip = %ip, error = %e, "grace counter sample failed, skipping");
                return None;
            }
        }

        match self.tracker.connections(ip).await {
            Ok(connections) => self.policy.check_connections(&connections),
            Err(e) => {
                warn!(ip = %ip, error = %e, "grace connection listing failed, skipping");
                None
            }
        }
    }

    /// Bytes counted by the IP's accept rule.
    async fn counter_for(&self, ip: Ipv4Addr) -> Result<u64, ToolError> {
        let text = self
            .tool
            .list_chain(Table::Filter, &self.config.chain, ListOptions::COUNTERS)
            .await?;
        Ok(parse_listing(&text)
            .iter()
            .filter(|rule| rule.target == "ACCEPT" && rule.source_ip() == Some(ip))
            .map(|rule| rule.bytes)
            .sum())
    }

    /// Revoke a grant ahead of its deadline. Returns false when `user_ip`
    /// held no grant.
    pub async fn revoke_temporary_access(&self, user_ip: &str) -> Result<bool, GraceError> {
        let ip: Ipv4Addr = user_ip
            .trim()
            .parse()
            .map_err(|_| GraceError::InvalidIpAddress(user_ip.to_string()))?;
        Ok(self.terminate(ip, None, GraceOutcome::Revoked).await)
    }

    /// Single exit path of a grant. `generation` pins the grant a task
    /// belongs to; `None` matches whatever grant is live.
    async fn terminate(&self, ip: Ipv4Addr, generation: Option<u64>, outcome: GraceOutcome) -> bool {
        let _ip_guard = self.ip_locks.lock(&ip.to_string()).await;

        let (record, active) = {
            let mut records = self.records();
            let live = records
                .get(&ip)
                .is_some_and(|r| generation.map_or(true, |g| g == r.generation));
            let record = if live { records.remove(&ip) } else { None };
            (record, records.len())
        };
        let Some(record) = record else {
            return false;
        };
        record.token.cancel();

        self.remove_rule(ip).await;
        if let Err(e) = self.authority.deactivate_temp_access(ip).await {
            warn!(ip = %ip, error = %e, "failed to notify grace deactivation");
        }

        counters::grace_revocation(outcome.label());
        counters::grace_active_set(active as i64);
        info!(
            ip = %ip,
            outcome = outcome.label(),
            total_bytes = record.stats.total_bytes,
            "grace access ended"
        );
        self.outcomes().insert(ip, outcome);
        true
    }

    async fn remove_rule(&self, ip: Ipv4Addr) {
        let _chain = self.chain_lock.lock().await;
        let rule = Self::rule(ip);
        for _ in 0..MAX_DUPLICATE_DELETES {
            match self
                .tool
                .delete_rule_by_match(Table::Filter, &self.config.chain, &rule)
                .await
            {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    warn!(ip = %ip, error = %e, "failed to remove grace rule");
                    break;
                }
            }
        }
    }

    pub fn status(&self, ip: Ipv4Addr) -> Option<GraceStatus> {
        self.records().get(&ip).map(|record| GraceStatus {
            ip,
            granted_at: record.granted_at,
            expires_at: record.expires_at,
            stats: record.stats.clone(),
        })
    }

    /// Terminal state of the IP's most recent grant.
    pub fn last_outcome(&self, ip: Ipv4Addr) -> Option<GraceOutcome> {
        self.outcomes().get(&ip).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.records().len()
    }

    /// Every live grant, oldest first.
    pub fn active(&self) -> Vec<GraceStatus> {
        let mut grants: Vec<GraceStatus> = self
            .records()
            .iter()
            .map(|(ip, record)| GraceStatus {
                ip: *ip,
                granted_at: record.granted_at,
                expires_at: record.expires_at,
                stats: record.stats.clone(),
            })
            .collect();
        grants.sort_by_key(|g| g.granted_at);
        grants
    }

    /// Cancel every grant and flush the grace chain. Shutdown only.
    pub async fn cleanup_all(&self) {
        let drained: Vec<(Ipv4Addr, GraceRecord)> = self.records().drain().collect();
        for (_, record) in &drained {
            record.token.cancel();
        }

        if self.chain_ready.initialized() {
            let _chain = self.chain_lock.lock().await;
            if let Err(e) = self.tool.flush_chain(Table::Filter, &self.config.chain).await {
                warn!(chain = %self.config.chain, error = %e, "failed to flush grace chain");
            }
        }

        let mut outcomes = self.outcomes();
        for (ip, _) in &drained {
            outcomes.insert(*ip, GraceOutcome::Revoked);
        }
        counters::grace_active_set(0);
        info!(cancelled = drained.len(), "grace monitor cleaned up");
    }
}
