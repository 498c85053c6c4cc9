//! Session lifecycle integration tests
//!
//! Drive the gate, firewall engine, grace monitor and usage sync through
//! the public API against the in-memory rule tool and authority.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use portald::authority::{MemoryAuthority, Session};
use portald::config::{FirewallConfig, GraceConfig, UsageConfig};
use portald::firewall::FirewallEngine;
use portald::grace::{GraceMonitor, GraceOutcome};
use portald::network::NetworkGate;
use portald::ruletool::{
    MemoryConnections, MemoryRuleTool, RuleMatch, RuleTarget, Table, FORWARD_CHAIN, PREROUTING_CHAIN,
};
use portald::usage::UsageSync;

const AUTH: &str = "PORTAL_AUTH_USERS";

fn firewall_config() -> FirewallConfig {
    FirewallConfig {
        restore_delay: Duration::ZERO,
        ..Default::default()
    }
}

fn session(id: &str, ip: &str, remaining: i64) -> Session {
    Session {
        remaining_time_secs: remaining,
        ..Session::new(id, ip)
    }
}

#[tokio::test]
async fn test_grant_and_revoke_through_gate() {
    let tool = Arc::new(MemoryRuleTool::new());
    let authority = Arc::new(MemoryAuthority::new());
    let gate = NetworkGate::new(firewall_config(), tool.clone(), authority, false);

    let facade = gate.initialize("C").await.expect("initialize");
    let granted = facade.whitelist_ip("S1", "10.0.0.5").await;
    assert!(granted.success);
    assert_eq!(granted.session_id.as_deref(), Some("S1"));

    let ip = Ipv4Addr::new(10, 0, 0, 5);
    let auth = tool.rules(Table::Filter, AUTH);
    assert_eq!(auth.len(), 2);
    assert!(auth.iter().any(|r| r.spec.comment.as_deref() == Some("dl_C_S1")
        && r.spec.matcher == RuleMatch::Destination(ip)
        && r.spec.target == RuleTarget::Accept));
    assert!(auth.iter().any(|r| r.spec.comment.as_deref() == Some("ul_C_S1")
        && r.spec.matcher == RuleMatch::Source(ip)
        && r.spec.target == RuleTarget::Accept));

    let nat = tool.rules(Table::Nat, PREROUTING_CHAIN);
    assert_eq!(nat.len(), 1);
    assert_eq!(nat[0].spec.comment.as_deref(), Some("C_S1"));
    assert_eq!(nat[0].spec.target, RuleTarget::Return);

    let revoked = facade.revoke_ip_access("10.0.0.5", "S1").await;
    assert!(revoked.success);
    assert_eq!(tool.count_comment_containing("S1"), 0);
    assert!(tool.rules(Table::Filter, AUTH).is_empty());

    gate.shutdown().await;
}

#[tokio::test]
async fn test_restart_restores_active_sessions() {
    let tool = Arc::new(MemoryRuleTool::new());
    let authority = Arc::new(MemoryAuthority::new());

    // First process: two sessions granted
    let first = FirewallEngine::new("C", firewall_config(), tool.clone(), authority.clone());
    first.initialize(false).await.expect("initialize");
    first.whitelist_ip("S1", "10.0.0.5").await.expect("grant S1");
    first.whitelist_ip("S2", "10.0.0.6").await.expect("grant S2");
    first.shutdown().await;
    drop(first);

    // While down, S2 ran out and S3 was paid for elsewhere
    authority.set_active_sessions(vec![
        session("S1", "10.0.0.5", 600),
        session("S2", "10.0.0.6", 0),
        session("S3", "10.0.0.7", 300),
    ]);

    let gate = NetworkGate::new(firewall_config(), tool.clone(), authority.clone(), true);
    let facade = gate.initialize("C").await.expect("initialize with restore");

    assert_eq!(tool.count_with_comment("dl_C_S1"), 1);
    assert_eq!(tool.count_with_comment("ul_C_S1"), 1);
    assert_eq!(tool.count_with_comment("dl_C_S3"), 1);
    assert_eq!(tool.count_comment_containing("S2"), 0);
    assert_eq!(tool.rules(Table::Filter, AUTH).len(), 4);

    // Chain jumps are not duplicated by a second startup
    let jumps = tool
        .rules(Table::Filter, FORWARD_CHAIN)
        .iter()
        .filter(|r| r.spec.target == RuleTarget::Jump(AUTH.to_string()))
        .count();
    assert_eq!(jumps, 1);

    let drift = facade.engine().reconcile_ledger().await.expect("reconcile");
    assert!(drift.is_clean());

    gate.shutdown().await;
}

#[tokio::test]
async fn test_usage_sync_reports_deltas() {
    let tool = Arc::new(MemoryRuleTool::new());
    let authority = Arc::new(MemoryAuthority::new());
    let gate = NetworkGate::new(firewall_config(), tool.clone(), authority.clone(), false);
    let facade = gate.initialize("C").await.expect("initialize");
    facade.whitelist_ip("S1", "10.0.0.5").await;
    authority.set_active_sessions(vec![session("S1", "10.0.0.5", 600)]);

    let sync = UsageSync::new(
        UsageConfig {
            system_metrics: false,
            ..Default::default()
        },
        facade.engine().clone(),
        authority.clone(),
    );

    tool.set_counters("dl_C_S1", 100, 150_000);
    tool.set_counters("ul_C_S1", 40, 20_000);
    assert_eq!(sync.sync_once().await.reported, 1);

    tool.set_counters("dl_C_S1", 120, 170_000);
    assert_eq!(sync.sync_once().await.reported, 1);

    let reports = authority.usage_reports();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0][0].data_usage.total_bytes, 170_000);
    assert_eq!(reports[1][0].data_usage.download_bytes, 20_000);
    assert_eq!(reports[1][0].data_usage.total_bytes, 20_000);

    gate.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_grace_grant_expires_alongside_firewall() {
    let tool = Arc::new(MemoryRuleTool::new());
    let authority = Arc::new(MemoryAuthority::new());
    let gate = NetworkGate::new(firewall_config(), tool.clone(), authority.clone(), false);
    let facade = gate.initialize("C").await.expect("initialize");

    let config = GraceConfig::default();
    let window = config.window;
    let grace_chain = config.chain.clone();
    let grace = GraceMonitor::new(
        config,
        tool.clone(),
        Arc::new(MemoryConnections::new()),
        authority.clone(),
        facade.engine().chain_lock(),
    );

    let ip = Ipv4Addr::new(10, 0, 0, 9);
    grace.grant_temporary_access("10.0.0.9").await.expect("grant");
    assert_eq!(tool.rules(Table::Filter, &grace_chain).len(), 1);

    tokio::time::sleep(window + Duration::from_secs(1)).await;

    assert_eq!(grace.last_outcome(ip), Some(GraceOutcome::Expired));
    assert!(tool.rules(Table::Filter, &grace_chain).is_empty());
    assert_eq!(authority.deactivations(), vec![ip]);

    // Session rules are untouched by the grace chain
    facade.whitelist_ip("S1", "10.0.0.5").await;
    grace.cleanup_all().await;
    assert_eq!(tool.rules(Table::Filter, AUTH).len(), 2);

    gate.shutdown().await;
}
