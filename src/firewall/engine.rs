//! Session firewall engine.
//!
//! Turns authority session decisions into per-session counting rules in
//! the auth chain, keeps them reconciled with the authority after a
//! restart, and runs the time accounting and expiry schedules.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::ledger::{DriftReport, RuleDescriptor, RuleLedger};
use super::locks::{chain_lock, ChainLock, KeyedLocks};
use super::types::*;
use crate::authority::{Session, SessionTimeUpdate, SharedAuthority};
use crate::config::{FirewallConfig, RestoreMode};
use crate::ruletool::{
    parse_listing, ListOptions, ListedRule, RuleSpec, SharedRuleTool, Table, FORWARD_CHAIN,
    PREROUTING_CHAIN,
};
use crate::telemetry::counters;

/// Elapsed time credited per accounting pass, at most.
pub const MAX_ELAPSED_PER_TICK_SECS: i64 = 60;

/// Upper bound on delete-by-match repetitions for one comment.
const MAX_DUPLICATE_DELETES: usize = 32;

/// Session ids end up inside rule comments
const MAX_SESSION_ID_LEN: usize = 200;

/// Compute the time delta reported for one session at `now`.
///
/// Returns `None` when the session has no reference timestamp or no time
/// has passed.
pub fn compute_time_update(session: &Session, now: DateTime<Utc>) -> Option<SessionTimeUpdate> {
    let last = session.last_time_update.or(session.start_time)?;
    let elapsed = (now - last).num_seconds();
    if elapsed <= 0 {
        return None;
    }

    let used = elapsed.min(MAX_ELAPSED_PER_TICK_SECS);
    Some(SessionTimeUpdate {
        session_id: session.session_id.clone(),
        last_time_update: now,
        remaining_time_secs: (session.remaining_time_secs - used).max(0),
        actual_duration_seconds: session.actual_duration_seconds + used as u64,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Schedule {
    TimeAccounting,
    ExpirySweep,
}

impl Schedule {
    fn name(&self) -> &'static str {
        match self {
            Schedule::TimeAccounting => "time_accounting",
            Schedule::ExpirySweep => "expiry_sweep",
        }
    }
}

/// Firewall orchestration engine. One per process.
pub struct FirewallEngine {
    contract_id: String,
    config: FirewallConfig,
    tool: SharedRuleTool,
    authority: SharedAuthority,

    ledger: Mutex<RuleLedger>,
    session_locks: KeyedLocks,
    /// Exclusive during restoration, shared by grant and revoke
    restore_gate: RwLock<()>,
    chain_lock: ChainLock,

    init_lock: AsyncMutex<bool>,
    ready: AtomicBool,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for FirewallEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirewallEngine")
            .field("contract_id", &self.contract_id)
            .field("auth_chain", &self.config.auth_chain)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl FirewallEngine {
    pub fn new(
        contract_id: impl Into<String>,
        config: FirewallConfig,
        tool: SharedRuleTool,
        authority: SharedAuthority,
    ) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            contract_id: contract_id.into(),
            config,
            tool,
            authority,
            ledger: Mutex::new(RuleLedger::new()),
            session_locks: KeyedLocks::new(),
            restore_gate: RwLock::new(()),
            chain_lock: chain_lock(),
            init_lock: AsyncMutex::new(false),
            ready: AtomicBool::new(false),
            stop_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn contract_id(&self) -> &str {
        &self.contract_id
    }

    pub fn config(&self) -> &FirewallConfig {
        &self.config
    }

    /// Lock shared with other writers of the FORWARD chain.
    pub fn chain_lock(&self) -> ChainLock {
        self.chain_lock.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn ledger(&self) -> MutexGuard<'_, RuleLedger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Verify the tool, ensure chains, optionally restore, start schedules.
    ///
    /// Idempotent. Any failure here is fatal for the caller.
    pub async fn initialize(self: &Arc<Self>, restore: bool) -> Result<Option<RestoreReport>, FirewallError> {
        let mut initialized = self.init_lock.lock().await;
        if *initialized {
            debug!(contract_id = %self.contract_id, "firewall engine already initialized");
            return Ok(None);
        }

        let version = self
            .tool
            .version()
            .await
            .map_err(|e| FirewallError::ToolUnavailable(e.to_string()))?;
        info!(version = %version, "rule tool available");

        self.ensure_chains().await?;

        let report = if restore {
            Some(self.restore_session_state().await)
        } else {
            None
        };

        self.spawn_schedules();
        self.ready.store(true, Ordering::Release);
        *initialized = true;

        info!(
            contract_id = %self.contract_id,
            auth_chain = %self.config.auth_chain,
            block_chain = %self.config.block_chain,
            restore,
            "firewall engine initialized"
        );

        Ok(report)
    }

    /// Create the auth and block chains if absent and splice them into FORWARD.
    ///
    /// The block chain is spliced last so it is evaluated first.
    async fn ensure_chains(&self) -> Result<(), FirewallError> {
        let _chain = self.chain_lock.lock().await;

        for chain in [&self.config.auth_chain, &self.config.block_chain] {
            if !self.tool.chain_exists(Table::Filter, chain).await? {
                self.tool.create_chain(Table::Filter, chain).await?;
                info!(chain = %chain, "created chain");
            }
            self.tool.splice_into_forward(chain).await?;
        }

        Ok(())
    }

    fn ensure_ready(&self) -> Result<(), FirewallError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(FirewallError::NotInitialized)
        }
    }

    /// Grant network access to a session.
    ///
    /// A no-op when the session's complete rule set already exists.
    pub async fn whitelist_ip(
        &self,
        session_id: &str,
        user_ip: &str,
    ) -> Result<GrantOutcome, FirewallError> {
        self.ensure_ready()?;
        let ip = parse_ipv4(user_ip)?;
        validate_session_id(session_id)?;

        let tags = SessionTags::new(&self.contract_id, session_id);
        let _gate = self.restore_gate.read().await;
        let _session = self.session_locks.lock(&tags.key).await;

        let result = self.grant_locked(&tags, ip).await;
        match &result {
            Ok(outcome) if outcome.created => counters::grant("created"),
            Ok(_) => counters::grant("existing"),
            Err(_) => counters::grant("failed"),
        }
        result
    }

    /// Grant path shared by `whitelist_ip` and restoration. Caller holds the
    /// session lock.
    async fn grant_locked(&self, tags: &SessionTags, ip: Ipv4Addr) -> Result<GrantOutcome, FirewallError> {
        let _chain = self.chain_lock.lock().await;
        let auth = self.config.auth_chain.as_str();

        let listed = self.list(Table::Filter, auth, ListOptions::NUMBERED).await?;
        let download: Vec<&ListedRule> = listed.iter().filter(|r| r.has_comment(&tags.download)).collect();
        let upload: Vec<&ListedRule> = listed.iter().filter(|r| r.has_comment(&tags.upload)).collect();

        let bound_to_ip = matches!(
            (download.as_slice(), upload.as_slice()),
            ([dl], [ul]) if dl.destination_ip() == Some(ip) && ul.source_ip() == Some(ip)
        );
        if bound_to_ip {
            debug!(session_id = %tags.session_id, ip = %ip, "session rules already present");
            return Ok(GrantOutcome {
                session_id: tags.session_id.clone(),
                created: false,
            });
        }

        if !download.is_empty() || !upload.is_empty() {
            // Torn set, duplicates, or rules for another address; start over
            warn!(
                session_id = %tags.session_id,
                ip = %ip,
                download = download.len(),
                upload = upload.len(),
                "stale session rules found, replacing"
            );
            counters::rule_drift("partial", 1);
            // Leftovers that survive this fail verification below
            let cleared = self.remove_session_rules(tags, None).await;
            self.ledger().forget_session(tags);
            for e in &cleared.errors {
                warn!(session_id = %tags.session_id, error = %e, "failed to clear stale session rule");
            }
        }

        let mut steps = vec![
            (
                Table::Filter,
                auth,
                RuleKind::Counter(Direction::Download),
                tags.counter_rule(Direction::Download, ip),
            ),
            (
                Table::Filter,
                auth,
                RuleKind::Counter(Direction::Upload),
                tags.counter_rule(Direction::Upload, ip),
            ),
        ];
        if self.config.nat_bypass {
            steps.push((Table::Nat, PREROUTING_CHAIN, RuleKind::Bypass, tags.bypass_rule(ip)));
        }

        let mut inserted: Vec<(Table, &str, RuleKind, RuleSpec)> = Vec::with_capacity(steps.len());
        for (table, chain, kind, rule) in steps {
            if let Err(e) = self.tool.insert_rule(table, chain, 1, &rule).await {
                error!(
                    session_id = %tags.session_id,
                    ip = %ip,
                    chain,
                    error = %e,
                    "rule insert failed, rolling back"
                );
                self.rollback(&inserted).await;
                return Err(FirewallError::RuleInsert {
                    comment: rule.comment.clone().unwrap_or_default(),
                    source: e,
                });
            }
            inserted.push((table, chain, kind, rule));
        }

        let listed = match self.list(Table::Filter, auth, ListOptions::NUMBERED).await {
            Ok(listed) => listed,
            Err(e) => {
                self.rollback(&inserted).await;
                return Err(e);
            }
        };
        let download = count_comment(&listed, &tags.download);
        let upload = count_comment(&listed, &tags.upload);
        if download != 1 || upload != 1 {
            error!(
                session_id = %tags.session_id,
                ip = %ip,
                download,
                upload,
                "rule verification mismatch, rolling back"
            );
            self.rollback(&inserted).await;
            return Err(FirewallError::VerificationMismatch {
                session_id: tags.session_id.clone(),
                download,
                upload,
            });
        }

        {
            let now = Utc::now();
            let mut ledger = self.ledger();
            for (table, chain, kind, rule) in inserted {
                ledger.record(RuleDescriptor {
                    table,
                    chain: chain.to_string(),
                    kind,
                    ip,
                    session_id: tags.session_id.clone(),
                    comment: rule.comment.unwrap_or_default(),
                    installed_at: now,
                });
            }
        }

        info!(session_id = %tags.session_id, ip = %ip, "network access granted");
        Ok(GrantOutcome {
            session_id: tags.session_id.clone(),
            created: true,
        })
    }

    async fn rollback(&self, inserted: &[(Table, &str, RuleKind, RuleSpec)]) {
        for (table, chain, _, rule) in inserted.iter().rev() {
            match self.tool.delete_rule_by_match(*table, chain, rule).await {
                Ok(_) => {}
                Err(e) => warn!(chain, comment = ?rule.comment, error = %e, "rollback delete failed"),
            }
        }
    }

    /// Revoke a session's access. Never fails; every removal step is
    /// attempted and failures are collected in the outcome.
    pub async fn revoke_ip_access(&self, user_ip: &str, session_id: &str) -> RevokeOutcome {
        let tags = SessionTags::new(&self.contract_id, session_id);
        let _gate = self.restore_gate.read().await;
        let _session = self.session_locks.lock(&tags.key).await;

        let outcome = self.revoke_locked(&tags, user_ip).await;
        counters::revoke(if outcome.is_success() { "ok" } else { "partial" });
        outcome
    }

    async fn revoke_locked(&self, tags: &SessionTags, user_ip: &str) -> RevokeOutcome {
        let ip = parse_ipv4(user_ip).ok();

        if ip.is_none() {
            warn!(session_id = %tags.session_id, user_ip, "revoking by comment only");
        }
        let outcome = {
            let _chain = self.chain_lock.lock().await;
            self.remove_session_rules(tags, ip).await
        };

        self.ledger().forget_session(tags);

        if let Some(ip) = ip {
            if let Err(e) = self.tool.flush_connections_for_ip(ip).await {
                warn!(ip = %ip, error = %e, "failed to flush tracked connections");
            }
        }

        if outcome.is_success() {
            info!(session_id = %tags.session_id, user_ip, removed = outcome.removed, "network access revoked");
        } else {
            warn!(
                session_id = %tags.session_id,
                user_ip,
                removed = outcome.removed,
                errors = ?outcome.errors,
                "network access revoked with errors"
            );
        }
        outcome
    }

    /// Remove every rule carrying the session's comments, whatever address
    /// it was installed for. With `ip`, delete-by-match runs first; the
    /// comment sweep then catches whatever it missed. Caller holds the
    /// chain lock.
    async fn remove_session_rules(&self, tags: &SessionTags, ip: Option<Ipv4Addr>) -> RevokeOutcome {
        let mut removed = 0;
        if let Some(ip) = ip {
            removed = self.remove_session_rules_by_match(tags, ip).await;
        }

        let mut outcome = self.remove_session_rules_by_comment(tags).await;
        outcome.removed += removed;
        outcome
    }

    /// Fast path: delete-by-match until the tool reports not found.
    /// Failures are left to the comment sweep.
    async fn remove_session_rules_by_match(&self, tags: &SessionTags, ip: Ipv4Addr) -> usize {
        let auth = self.config.auth_chain.as_str();
        let targets = [
            (Table::Filter, auth, tags.counter_rule(Direction::Download, ip)),
            (Table::Filter, auth, tags.counter_rule(Direction::Upload, ip)),
            (Table::Nat, PREROUTING_CHAIN, tags.bypass_rule(ip)),
        ];

        let mut removed = 0;
        for (table, chain, rule) in targets {
            for _ in 0..MAX_DUPLICATE_DELETES {
                match self.tool.delete_rule_by_match(table, chain, &rule).await {
                    Ok(true) => removed += 1,
                    Ok(false) => break,
                    Err(e) if e.is_missing_chain() => break,
                    Err(e) => {
                        debug!(comment = ?rule.comment, error = %e, "delete by match failed");
                        break;
                    }
                }
            }
        }
        removed
    }

    async fn remove_session_rules_by_comment(&self, tags: &SessionTags) -> RevokeOutcome {
        let mut outcome = RevokeOutcome::default();
        let managed = [
            (Table::Filter, self.config.auth_chain.as_str()),
            (Table::Nat, PREROUTING_CHAIN),
        ];
        for (table, chain) in managed {
            let (removed, errors) = self
                .delete_where(table, chain, |rule| {
                    rule.has_comment(&tags.download)
                        || rule.has_comment(&tags.upload)
                        || rule.has_comment(&tags.key)
                })
                .await;
            outcome.removed += removed;
            outcome.errors.extend(errors);
        }
        outcome
    }

    /// Delete matching rules by number, highest first. Caller holds the
    /// chain lock. A missing chain counts as empty.
    async fn delete_where<F>(&self, table: Table, chain: &str, predicate: F) -> (usize, Vec<String>)
    where
        F: Fn(&ListedRule) -> bool,
    {
        let listed = match self.list(table, chain, ListOptions::NUMBERED).await {
            Ok(listed) => listed,
            Err(FirewallError::Tool(e)) if e.is_missing_chain() => return (0, Vec::new()),
            Err(e) => return (0, vec![format!("{}: {}", chain, e)]),
        };

        let mut numbers: Vec<u32> = listed
            .iter()
            .filter(|rule| predicate(rule))
            .filter_map(|rule| rule.num)
            .collect();
        numbers.sort_unstable_by(|a, b| b.cmp(a));

        let mut removed = 0;
        let mut errors = Vec::new();
        for number in numbers {
            match self.tool.delete_rule_by_number(table, chain, number).await {
                Ok(()) => removed += 1,
                Err(e) => errors.push(format!("{} #{}: {}", chain, number, e)),
            }
        }
        (removed, errors)
    }

    async fn list(&self, table: Table, chain: &str, options: ListOptions) -> Result<Vec<ListedRule>, FirewallError> {
        let text = self.tool.list_chain(table, chain, options).await?;
        Ok(parse_listing(&text))
    }

    /// Debit elapsed time from every active session and report it.
    ///
    /// Local state is never touched; the authority owns session time.
    pub async fn update_session_time_usage(&self) -> TimeUsageReport {
        let sessions = match self.authority.list_active_sessions(&self.contract_id).await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "failed to fetch active sessions for time accounting");
                counters::time_update("error");
                return TimeUsageReport { updated: 0, errors: 1 };
            }
        };

        let now = Utc::now();
        let updates: Vec<SessionTimeUpdate> = sessions
            .iter()
            .filter_map(|session| compute_time_update(session, now))
            .collect();

        if updates.is_empty() {
            return TimeUsageReport::default();
        }

        match self.authority.report_time_updates(&updates).await {
            Ok(summary) => {
                counters::time_update("ok");
                debug!(
                    updated = summary.success_count,
                    errors = summary.error_count,
                    "session time reported"
                );
                TimeUsageReport {
                    updated: summary.success_count,
                    errors: summary.error_count,
                }
            }
            Err(e) => {
                warn!(error = %e, sessions = updates.len(), "failed to report session time");
                counters::time_update("error");
                TimeUsageReport {
                    updated: 0,
                    errors: updates.len(),
                }
            }
        }
    }

    /// Revoke every session the authority lists as expired, then report
    /// the ones actually revoked.
    pub async fn cleanup_expired_sessions(&self) -> CleanupReport {
        let sessions = match self.authority.list_expired_sessions(&self.contract_id).await {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!(error = %e, "failed to fetch expired sessions");
                return CleanupReport { cleaned: 0, errors: 1 };
            }
        };

        let mut report = CleanupReport::default();
        let mut revoked = Vec::new();

        for session in sessions.iter().filter(|s| !s.user_ip.trim().is_empty()) {
            let outcome = self
                .revoke_ip_access(&session.user_ip, &session.session_id)
                .await;
            if outcome.is_success() {
                report.cleaned += 1;
                revoked.push(session.session_id.clone());
            } else {
                report.errors += 1;
            }
        }

        if !revoked.is_empty() {
            if let Err(e) = self.authority.report_expired(&revoked).await {
                warn!(error = %e, sessions = revoked.len(), "failed to report expired sessions");
                report.errors += 1;
            }
            counters::expired_cleaned(report.cleaned as u64);
            info!(cleaned = report.cleaned, errors = report.errors, "expired sessions cleaned");
        }

        report
    }

    /// Rebuild the rule set from the authority's active-session list.
    ///
    /// 1. remove every rule tagged with this deployment (FORWARD, auth, nat)
    /// 2. re-create missing chains
    /// 3. re-grant (or pause) every valid session with time left
    /// 4. remove auth rules for any IP outside the restored set
    ///
    /// Best effort: failures are counted, never raised. Pre-restart
    /// counters are discarded.
    pub async fn restore_session_state(&self) -> RestoreReport {
        let _gate = self.restore_gate.write().await;
        let mut report = RestoreReport::default();

        info!(contract_id = %self.contract_id, mode = ?self.config.restore_mode, "restoring session state");

        let (removed, errors) = self.nuclear_cleanup().await;
        report.errors += errors;
        self.ledger().clear();
        debug!(removed, "tagged rules removed");

        if let Err(e) = self.ensure_chains().await {
            error!(error = %e, "failed to re-create chains");
            report.errors += 1;
        }

        let sessions = match self.authority.list_active_sessions(&self.contract_id).await {
            Ok(sessions) => sessions,
            Err(e) => {
                error!(error = %e, "failed to fetch active sessions, restoration aborted");
                report.errors += 1;
                return report;
            }
        };

        let mut valid = HashSet::new();
        let total = sessions.len();

        for (index, session) in sessions.iter().enumerate() {
            let Some(ip) = session.ip() else {
                warn!(session_id = %session.session_id, user_ip = %session.user_ip, "session has invalid IP");
                counters::restore_session("invalid_ip");
                report.errors += 1;
                continue;
            };

            if session.remaining_time_secs <= 0 {
                counters::restore_session("expired");
                report.expired += 1;
                continue;
            }

            match self.config.restore_mode {
                RestoreMode::Regrant => {
                    let tags = SessionTags::new(&self.contract_id, &session.session_id);
                    let _session = self.session_locks.lock(&tags.key).await;
                    match self.grant_locked(&tags, ip).await {
                        Ok(_) => {
                            valid.insert(ip);
                            report.restored += 1;
                            counters::restore_session("restored");
                        }
                        Err(e) => {
                            warn!(session_id = %session.session_id, ip = %ip, error = %e, "failed to restore session");
                            report.errors += 1;
                            counters::restore_session("error");
                        }
                    }
                }
                RestoreMode::Pause => {
                    match self
                        .authority
                        .report_pause(&session.session_id, &session.user_ip, &self.contract_id)
                        .await
                    {
                        Ok(()) => {
                            report.paused += 1;
                            counters::restore_session("paused");
                        }
                        Err(e) => {
                            warn!(session_id = %session.session_id, error = %e, "failed to pause session");
                            report.errors += 1;
                            counters::restore_session("error");
                        }
                    }
                }
            }

            if index + 1 < total && !self.config.restore_delay.is_zero() {
                sleep(self.config.restore_delay).await;
            }
        }

        let (stale, errors) = self.remove_stale_rules(&valid).await;
        report.stale_removed = stale;
        report.errors += errors;

        info!(
            restored = report.restored,
            paused = report.paused,
            expired = report.expired,
            stale_removed = report.stale_removed,
            errors = report.errors,
            "session state restored"
        );
        report
    }

    /// Remove every rule whose comment carries this deployment's id.
    async fn nuclear_cleanup(&self) -> (usize, usize) {
        let _chain = self.chain_lock.lock().await;
        let managed = [
            (Table::Filter, FORWARD_CHAIN),
            (Table::Filter, self.config.auth_chain.as_str()),
            (Table::Nat, PREROUTING_CHAIN),
        ];

        let mut removed = 0;
        let mut errors = 0;
        for (table, chain) in managed {
            let (n, errs) = self
                .delete_where(table, chain, |rule| self.owns(rule))
                .await;
            removed += n;
            for e in &errs {
                warn!(chain, error = %e, "cleanup delete failed");
            }
            errors += errs.len();
        }
        (removed, errors)
    }

    /// True for rules tagged by this deployment, and only this one.
    fn owns(&self, rule: &ListedRule) -> bool {
        rule.comment
            .as_deref()
            .is_some_and(|c| parse_tag(&self.contract_id, c).is_some())
    }

    /// Delete auth rules bound to an IP outside `valid`.
    async fn remove_stale_rules(&self, valid: &HashSet<Ipv4Addr>) -> (usize, usize) {
        let _chain = self.chain_lock.lock().await;
        let (removed, errors) = self
            .delete_where(Table::Filter, &self.config.auth_chain, |rule| {
                rule.host_ip().is_some_and(|ip| !valid.contains(&ip))
            })
            .await;

        if removed > 0 {
            info!(removed, "stale rules removed");
            counters::rule_drift("stale", removed as u64);
        }
        (removed, errors.len())
    }

    /// Compare the ledger with the auth and nat chains.
    pub async fn reconcile_ledger(&self) -> Result<DriftReport, FirewallError> {
        let _chain = self.chain_lock.lock().await;
        let mut report = DriftReport::default();

        for (table, chain) in [
            (Table::Filter, self.config.auth_chain.as_str()),
            (Table::Nat, PREROUTING_CHAIN),
        ] {
            let listed = self.list(table, chain, ListOptions::NUMBERED).await?;
            let drift = self.ledger().reconcile(table, chain, &self.contract_id, &listed);
            report.missing.extend(drift.missing);
            report.unexpected.extend(drift.unexpected);
        }

        if !report.is_clean() {
            warn!(missing = ?report.missing, unexpected = ?report.unexpected, "rule drift detected");
            counters::rule_drift("missing", report.missing.len() as u64);
            counters::rule_drift("unexpected", report.unexpected.len() as u64);
        }
        Ok(report)
    }

    /// Rule counts for the admin surface.
    pub async fn stats(&self) -> Result<FirewallStats, FirewallError> {
        let auth = self.list(Table::Filter, &self.config.auth_chain, ListOptions::PLAIN).await?;
        let nat = self.list(Table::Nat, PREROUTING_CHAIN, ListOptions::PLAIN).await?;
        let blocked = self.list(Table::Filter, &self.config.block_chain, ListOptions::PLAIN).await?;

        Ok(FirewallStats {
            accept_rules: auth.iter().filter(|r| r.target == "ACCEPT").count(),
            bypass_rules: nat.iter().filter(|r| r.target == "RETURN").count(),
            blocked_rules: blocked.iter().filter(|r| r.target == "DROP").count(),
            ledger_entries: self.ledger().len(),
        })
    }

    /// Byte counters per session id, from one listing of the auth chain.
    pub async fn session_counters(&self) -> Result<HashMap<String, SessionCounters>, FirewallError> {
        let listed = self
            .list(Table::Filter, &self.config.auth_chain, ListOptions::COUNTERS)
            .await?;

        let mut counters: HashMap<String, SessionCounters> = HashMap::new();
        for rule in &listed {
            let Some(comment) = rule.comment.as_deref() else {
                continue;
            };
            if let Some((RuleKind::Counter(direction), session_id)) = parse_tag(&self.contract_id, comment) {
                let entry = counters.entry(session_id).or_default();
                match direction {
                    Direction::Download => entry.download_bytes += rule.bytes,
                    Direction::Upload => entry.upload_bytes += rule.bytes,
                }
            }
        }
        Ok(counters)
    }

    fn spawn_schedules(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for schedule in [Schedule::TimeAccounting, Schedule::ExpirySweep] {
            let engine = Arc::clone(self);
            let stop_rx = self.stop_tx.subscribe();
            tasks.push(tokio::spawn(engine.run_schedule(schedule, stop_rx)));
        }
    }

    async fn run_schedule(self: Arc<Self>, schedule: Schedule, mut stop_rx: watch::Receiver<bool>) {
        let period = match schedule {
            Schedule::TimeAccounting => self.config.usage_interval,
            Schedule::ExpirySweep => self.config.expiry_interval,
        };

        info!(schedule = schedule.name(), period_secs = period.as_secs(), "schedule started");

        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow_and_update() {
                        info!(schedule = schedule.name(), "schedule stopping");
                        break;
                    }
                }

                _ = interval.tick() => {
                    if timeout(self.config.tick_timeout, self.run_tick(schedule)).await.is_err() {
                        warn!(
                            schedule = schedule.name(),
                            timeout_secs = self.config.tick_timeout.as_secs(),
                            "scheduled iteration timed out, retrying on next tick"
                        );
                    }
                }
            }
        }
    }

    async fn run_tick(&self, schedule: Schedule) {
        match schedule {
            Schedule::TimeAccounting => {
                let report = self.update_session_time_usage().await;
                debug!(updated = report.updated, errors = report.errors, "time accounting pass");
            }
            Schedule::ExpirySweep => {
                let report = self.cleanup_expired_sessions().await;
                debug!(cleaned = report.cleaned, errors = report.errors, "expiry sweep");
                if let Err(e) = self.reconcile_ledger().await {
                    warn!(error = %e, "ledger reconciliation failed");
                }
            }
        }
    }

    /// Stop both schedules. Installed rules stay in place.
    pub async fn shutdown(&self) {
        self.ready.store(false, Ordering::Release);
        let _ = self.stop_tx.send(true);

        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }

        *self.init_lock.lock().await = false;
        info!(contract_id = %self.contract_id, "firewall engine stopped");
    }

    /// Stop schedules without waiting, for drop paths.
    fn abort_schedules(&self) {
        let _ = self.stop_tx.send(true);
        for task in self.tasks.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
    }
}

impl Drop for FirewallEngine {
    fn drop(&mut self) {
        self.abort_schedules();
    }
}

fn count_comment(listed: &[ListedRule], tag: &str) -> usize {
    listed.iter().filter(|rule| rule.has_comment(tag)).count()
}

fn validate_session_id(session_id: &str) -> Result<(), FirewallError> {
    if session_id.is_empty()
        || session_id.len() > MAX_SESSION_ID_LEN
        || session_id.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(FirewallError::InvalidSessionId(session_id.to_string()));
    }
    Ok(())
}
