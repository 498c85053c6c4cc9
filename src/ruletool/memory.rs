//! In-process netfilter stand-in for testing without root.
//!
//! Keeps chains as ordered rule vectors and renders listings in the same
//! layout `iptables -L -n` prints, so the real listing parser runs
//! against it unchanged.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::trace;

use super::{
    ConnectionTracker, ListOptions, RuleMatch, RuleSpec, RuleTool, Table, ToolError,
    TrackedConnection, FORWARD_CHAIN, PREROUTING_CHAIN,
};

const PROGRAM: &str = "memory-iptables";

/// Operation kinds, for failure injection and invocation counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolOp {
    Version,
    List,
    CreateChain,
    Insert,
    Append,
    DeleteNumber,
    DeleteMatch,
    Flush,
    FlushConnections,
}

/// A rule held by the memory tool, with its counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRule {
    pub spec: RuleSpec,
    pub packets: u64,
    pub bytes: u64,
}

#[derive(Debug, Default)]
struct Inner {
    chains: HashMap<(Table, String), Vec<StoredRule>>,
    unavailable: bool,
    failures: HashMap<ToolOp, VecDeque<Option<String>>>,
    swallow_inserts: usize,
    invocations: HashMap<ToolOp, usize>,
    flushed_connections: Vec<Ipv4Addr>,
}

impl Inner {
    fn with_builtins() -> Self {
        let mut inner = Self::default();
        inner.install_builtins();
        inner
    }

    fn install_builtins(&mut self) {
        for (table, chain) in [
            (Table::Filter, "INPUT"),
            (Table::Filter, FORWARD_CHAIN),
            (Table::Filter, "OUTPUT"),
            (Table::Nat, PREROUTING_CHAIN),
            (Table::Nat, "POSTROUTING"),
        ] {
            self.chains.entry((table, chain.to_string())).or_default();
        }
    }

    /// Count the call and apply any injected failure.
    fn enter(&mut self, op: ToolOp) -> Result<(), ToolError> {
        *self.invocations.entry(op).or_default() += 1;

        if self.unavailable {
            return Err(ToolError::Unavailable(PROGRAM.to_string()));
        }
        if let Some(message) = self.failures.get_mut(&op).and_then(|q| q.pop_front()).flatten() {
            return Err(ToolError::Failed {
                program: PROGRAM.to_string(),
                status: 4,
                stderr: message,
            });
        }
        Ok(())
    }

    fn chain_mut(&mut self, table: Table, chain: &str) -> Result<&mut Vec<StoredRule>, ToolError> {
        self.chains
            .get_mut(&(table, chain.to_string()))
            .ok_or_else(|| no_chain())
    }

    fn references(&self, chain: &str) -> usize {
        self.chains
            .values()
            .flatten()
            .filter(|rule| rule.spec.target.as_str() == chain)
            .count()
    }
}

fn no_chain() -> ToolError {
    ToolError::Failed {
        program: PROGRAM.to_string(),
        status: 1,
        stderr: "iptables: No chain/target/match by that name.".to_string(),
    }
}

fn bad_index(what: &str) -> ToolError {
    ToolError::Failed {
        program: PROGRAM.to_string(),
        status: 1,
        stderr: format!("iptables: Index of {} too big.", what),
    }
}

fn is_builtin(chain: &str) -> bool {
    matches!(
        chain,
        "INPUT" | "OUTPUT" | "FORWARD" | "PREROUTING" | "POSTROUTING"
    )
}

/// In-memory [`RuleTool`].
#[derive(Debug)]
pub struct MemoryRuleTool {
    inner: Mutex<Inner>,
    latency: Duration,
}

impl Default for MemoryRuleTool {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRuleTool {
    /// Create a tool with the built-in chains only.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::with_builtins()),
            latency: Duration::ZERO,
        }
    }

    /// Set simulated latency per invocation.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
    }

    /// Make every invocation fail as if the binary were missing.
    pub fn set_available(&self, available: bool) {
        self.lock().unavailable = !available;
    }

    /// Fail the next `times` invocations of `op`.
    pub fn fail_next(&self, op: ToolOp, times: usize) {
        let mut inner = self.lock();
        let queue = inner.failures.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(Some("injected failure".to_string()));
        }
    }

    /// Let `passes` invocations of `op` through, then fail one.
    pub fn fail_after(&self, op: ToolOp, passes: usize) {
        let mut inner = self.lock();
        let queue = inner.failures.entry(op).or_default();
        queue.extend(std::iter::repeat(None).take(passes));
        queue.push_back(Some("injected failure".to_string()));
    }

    /// Report success for the next insert without storing the rule.
    pub fn swallow_next_insert(&self) {
        self.lock().swallow_inserts += 1;
    }

    /// Number of calls made for `op`.
    pub fn invocations(&self, op: ToolOp) -> usize {
        self.lock().invocations.get(&op).copied().unwrap_or(0)
    }

    /// Rules of a chain in evaluation order (empty when absent).
    pub fn rules(&self, table: Table, chain: &str) -> Vec<StoredRule> {
        self.lock()
            .chains
            .get(&(table, chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_chain(&self, table: Table, chain: &str) -> bool {
        self.lock().chains.contains_key(&(table, chain.to_string()))
    }

    /// Rules in any chain whose comment equals `tag`.
    pub fn count_with_comment(&self, tag: &str) -> usize {
        self.lock()
            .chains
            .values()
            .flatten()
            .filter(|rule| rule.spec.comment.as_deref() == Some(tag))
            .count()
    }

    /// Rules in any chain whose comment contains `needle`.
    pub fn count_comment_containing(&self, needle: &str) -> usize {
        self.lock()
            .chains
            .values()
            .flatten()
            .filter(|rule| rule.spec.comment.as_deref().is_some_and(|c| c.contains(needle)))
            .count()
    }

    /// Set the counters of every rule tagged `tag`.
    pub fn set_counters(&self, tag: &str, packets: u64, bytes: u64) {
        let mut inner = self.lock();
        for rule in inner.chains.values_mut().flatten() {
            if rule.spec.comment.as_deref() == Some(tag) {
                rule.packets = packets;
                rule.bytes = bytes;
            }
        }
    }

    /// Account `bytes` of traffic to every rule in `chain` matching `ip`.
    pub fn add_traffic(&self, table: Table, chain: &str, ip: Ipv4Addr, bytes: u64) {
        let mut inner = self.lock();
        if let Some(rules) = inner.chains.get_mut(&(table, chain.to_string())) {
            for rule in rules.iter_mut() {
                let hit = match rule.spec.matcher {
                    RuleMatch::Source(s) | RuleMatch::Destination(s) => s == ip,
                    RuleMatch::Any => false,
                };
                if hit {
                    rule.packets += bytes.div_ceil(1500);
                    rule.bytes += bytes;
                }
            }
        }
    }

    /// IPs passed to `flush_connections_for_ip`.
    pub fn flushed_connections(&self) -> Vec<Ipv4Addr> {
        self.lock().flushed_connections.clone()
    }

    /// Drop every chain and rule, as a host reboot would.
    pub fn wipe(&self) {
        let mut inner = self.lock();
        inner.chains.clear();
        inner.install_builtins();
    }

    fn render(&self, table: Table, chain: &str, options: ListOptions) -> Result<String, ToolError> {
        let inner = self.lock();
        let rules = inner
            .chains
            .get(&(table, chain.to_string()))
            .ok_or_else(no_chain)?;

        let mut out = String::new();
        if is_builtin(chain) {
            let _ = writeln!(out, "Chain {} (policy ACCEPT)", chain);
        } else {
            let _ = writeln!(out, "Chain {} ({} references)", chain, inner.references(chain));
        }

        if options.line_numbers {
            out.push_str("num   ");
        }
        if options.counters {
            out.push_str("    pkts      bytes ");
        }
        out.push_str("target     prot opt ");
        if options.counters {
            out.push_str("in     out     ");
        }
        out.push_str("source               destination\n");

        for (index, rule) in rules.iter().enumerate() {
            if options.line_numbers {
                let _ = write!(out, "{:<5} ", index + 1);
            }
            if options.counters {
                let _ = write!(out, "{:>8} {:>10} ", rule.packets, rule.bytes);
            }
            let (source, destination) = match rule.spec.matcher {
                RuleMatch::Source(ip) => (ip.to_string(), "0.0.0.0/0".to_string()),
                RuleMatch::Destination(ip) => ("0.0.0.0/0".to_string(), ip.to_string()),
                RuleMatch::Any => ("0.0.0.0/0".to_string(), "0.0.0.0/0".to_string()),
            };
            let _ = write!(out, "{:<10} all  --  ", rule.spec.target.as_str());
            if options.counters {
                out.push_str("*      *       ");
            }
            let _ = write!(out, "{:<20} {:<20}", source, destination);
            if let Some(ref comment) = rule.spec.comment {
                let _ = write!(out, " /* {} */", comment);
            }
            out.push('\n');
        }

        Ok(out)
    }
}

#[async_trait]
impl RuleTool for MemoryRuleTool {
    async fn version(&self) -> Result<String, ToolError> {
        self.delay().await;
        self.lock().enter(ToolOp::Version)?;
        Ok("iptables v1.8.7 (memory)".to_string())
    }

    async fn list_chain(
        &self,
        table: Table,
        chain: &str,
        options: ListOptions,
    ) -> Result<String, ToolError> {
        self.delay().await;
        self.lock().enter(ToolOp::List)?;
        self.render(table, chain, options)
    }

    async fn create_chain(&self, table: Table, chain: &str) -> Result<(), ToolError> {
        self.delay().await;
        let mut inner = self.lock();
        inner.enter(ToolOp::CreateChain)?;
        inner.chains.entry((table, chain.to_string())).or_default();
        Ok(())
    }

    async fn insert_rule(
        &self,
        table: Table,
        chain: &str,
        position: u32,
        rule: &RuleSpec,
    ) -> Result<(), ToolError> {
        self.delay().await;
        let mut inner = self.lock();
        inner.enter(ToolOp::Insert)?;

        let swallow = inner.swallow_inserts > 0;
        if swallow {
            inner.swallow_inserts -= 1;
        }

        let rules = inner.chain_mut(table, chain)?;
        let index = position.max(1) as usize - 1;
        if index > rules.len() {
            return Err(bad_index("insertion"));
        }
        if swallow {
            trace!(chain, comment = ?rule.comment, "insert swallowed");
            return Ok(());
        }
        rules.insert(
            index,
            StoredRule {
                spec: rule.clone(),
                packets: 0,
                bytes: 0,
            },
        );
        Ok(())
    }

    async fn append_rule(&self, table: Table, chain: &str, rule: &RuleSpec) -> Result<(), ToolError> {
        self.delay().await;
        let mut inner = self.lock();
        inner.enter(ToolOp::Append)?;
        inner.chain_mut(table, chain)?.push(StoredRule {
            spec: rule.clone(),
            packets: 0,
            bytes: 0,
        });
        Ok(())
    }

    async fn delete_rule_by_number(
        &self,
        table: Table,
        chain: &str,
        number: u32,
    ) -> Result<(), ToolError> {
        self.delay().await;
        let mut inner = self.lock();
        inner.enter(ToolOp::DeleteNumber)?;
        let rules = inner.chain_mut(table, chain)?;
        if number == 0 || number as usize > rules.len() {
            return Err(bad_index("deletion"));
        }
        rules.remove(number as usize - 1);
        Ok(())
    }

    async fn delete_rule_by_match(
        &self,
        table: Table,
        chain: &str,
        rule: &RuleSpec,
    ) -> Result<bool, ToolError> {
        self.delay().await;
        let mut inner = self.lock();
        inner.enter(ToolOp::DeleteMatch)?;
        let rules = inner.chain_mut(table, chain)?;
        match rules.iter().position(|stored| stored.spec == *rule) {
            Some(index) => {
                rules.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn flush_chain(&self, table: Table, chain: &str) -> Result<(), ToolError> {
        self.delay().await;
        let mut inner = self.lock();
        inner.enter(ToolOp::Flush)?;
        inner.chain_mut(table, chain)?.clear();
        Ok(())
    }

    async fn flush_connections_for_ip(&self, ip: Ipv4Addr) -> Result<(), ToolError> {
        self.delay().await;
        let mut inner = self.lock();
        inner.enter(ToolOp::FlushConnections)?;
        inner.flushed_connections.push(ip);
        Ok(())
    }
}

/// In-memory [`ConnectionTracker`].
#[derive(Debug, Default)]
pub struct MemoryConnections {
    connections: Mutex<HashMap<Ipv4Addr, Vec<TrackedConnection>>>,
    failures: Mutex<usize>,
}

impl MemoryConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the connections reported for `ip`.
    pub fn set_connections(&self, ip: Ipv4Addr, connections: Vec<TrackedConnection>) {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(ip, connections);
    }

    /// Report `count` established connections from `ip` to `dport`.
    pub fn set_established(&self, ip: Ipv4Addr, count: usize, dport: u16) {
        let connections = (0..count)
            .map(|i| TrackedConnection {
                protocol: "tcp".to_string(),
                state: Some("ESTABLISHED".to_string()),
                src: ip,
                dst: Ipv4Addr::new(93, 184, 216, 34),
                sport: Some(40000 + (i % 20000) as u16),
                dport: Some(dport),
            })
            .collect();
        self.set_connections(ip, connections);
    }

    /// Fail the next `times` listings.
    pub fn fail_next(&self, times: usize) {
        *self.failures.lock().unwrap_or_else(|e| e.into_inner()) += times;
    }
}

#[async_trait]
impl ConnectionTracker for MemoryConnections {
    async fn connections(&self, ip: Ipv4Addr) -> Result<Vec<TrackedConnection>, ToolError> {
        {
            let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            if *failures > 0 {
                *failures -= 1;
                return Err(ToolError::Timeout {
                    program: "memory-conntrack".to_string(),
                    timeout: Duration::from_secs(10),
                });
            }
        }
        Ok(self
            .connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&ip)
            .cloned()
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ruletool::{parse_listing, RuleTarget};

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_listing_round_trips_through_parser() {
        let tool = MemoryRuleTool::new();
        tool.create_chain(Table::Filter, "AUTH").await.unwrap();

        let dl = RuleSpec::new(RuleMatch::Destination(ip("10.0.0.5")), RuleTarget::Accept)
            .with_comment("dl_C_S1");
        tool.insert_rule(Table::Filter, "AUTH", 1, &dl).await.unwrap();
        tool.set_counters("dl_C_S1", 10, 4096);

        let text = tool
            .list_chain(Table::Filter, "AUTH", ListOptions::COUNTERS)
            .await
            .unwrap();
        let rules = parse_listing(&text);

        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].num, Some(1));
        assert_eq!(rules[0].bytes, 4096);
        assert!(rules[0].has_comment("dl_C_S1"));
        assert_eq!(rules[0].destination_ip(), Some(ip("10.0.0.5")));
    }

    #[tokio::test]
    async fn test_splice_is_idempotent() {
        let tool = MemoryRuleTool::new();
        tool.create_chain(Table::Filter, "GRACE").await.unwrap();

        tool.splice_into_forward("GRACE").await.unwrap();
        tool.splice_into_forward("GRACE").await.unwrap();

        assert_eq!(tool.rules(Table::Filter, FORWARD_CHAIN).len(), 1);
        assert!(tool.chain_exists(Table::Filter, "GRACE").await.unwrap());
        assert!(!tool.chain_exists(Table::Filter, "NOPE").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_by_match_reports_not_found() {
        let tool = MemoryRuleTool::new();
        let rule = RuleSpec::new(RuleMatch::Source(ip("10.0.0.9")), RuleTarget::Return);

        tool.append_rule(Table::Nat, PREROUTING_CHAIN, &rule).await.unwrap();
        assert!(tool.delete_rule_by_match(Table::Nat, PREROUTING_CHAIN, &rule).await.unwrap());
        assert!(!tool.delete_rule_by_match(Table::Nat, PREROUTING_CHAIN, &rule).await.unwrap());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let tool = MemoryRuleTool::new();
        tool.fail_next(ToolOp::Version, 1);

        assert!(tool.version().await.is_err());
        assert!(tool.version().await.is_ok());
        assert_eq!(tool.invocations(ToolOp::Version), 2);

        tool.set_available(false);
        assert!(matches!(tool.version().await, Err(ToolError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_memory_connections() {
        let tracker = MemoryConnections::new();
        tracker.set_established(ip("10.0.0.5"), 3, 443);

        assert_eq!(tracker.connections(ip("10.0.0.5")).await.unwrap().len(), 3);
        assert!(tracker.connections(ip("10.0.0.6")).await.unwrap().is_empty());

        tracker.fail_next(1);
        assert!(tracker.connections(ip("10.0.0.5")).await.is_err());
    }
}
