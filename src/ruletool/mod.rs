//! Packet-filter tool adapter.
//!
//! The engines never build shell strings. They describe rules with
//! [`RuleSpec`] and talk to the host through the [`RuleTool`] trait:
//!
//! - [`IptablesTool`] - drives `iptables` and `conntrack` subprocesses
//! - [`MemoryRuleTool`] - in-process netfilter stand-in (for testing)
//!
//! Rules have no native id, so the comment tag is the identity used for
//! lookup and deletion. Listings are parsed by [`listing`].

mod iptables;
pub mod listing;
mod memory;

pub use iptables::{ConntrackReader, IptablesTool};
pub use listing::{parse_counter, parse_listing, ListedRule};
pub use memory::{MemoryConnections, MemoryRuleTool, StoredRule, ToolOp};

use async_trait::async_trait;
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Built-in chain every managed chain is spliced into.
pub const FORWARD_CHAIN: &str = "FORWARD";

/// Built-in nat chain holding portal bypass rules.
pub const PREROUTING_CHAIN: &str = "PREROUTING";

/// Rule tool error.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The tool binary is missing or not executable.
    #[error("rule tool not available: {0}")]
    Unavailable(String),

    /// Invocation exceeded its deadline.
    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    /// Process could not be spawned.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Process exited with a non-zero status.
    #[error("{program} exited with status {status}: {stderr}")]
    Failed {
        program: String,
        status: i32,
        stderr: String,
    },
}

impl ToolError {
    /// True when the failure means "chain does not exist".
    pub fn is_missing_chain(&self) -> bool {
        match self {
            ToolError::Failed { stderr, .. } => {
                stderr.contains("No chain/target/match") || stderr.contains("does not exist")
            }
            _ => false,
        }
    }
}

/// Netfilter table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Filter,
    Nat,
}

impl Table {
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Filter => "filter",
            Table::Nat => "nat",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Listing flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Include packet/byte counters (`-v -x`)
    pub counters: bool,
    /// Include rule numbers (`--line-numbers`)
    pub line_numbers: bool,
}

impl ListOptions {
    pub const PLAIN: Self = Self { counters: false, line_numbers: false };
    pub const NUMBERED: Self = Self { counters: false, line_numbers: true };
    pub const COUNTERS: Self = Self { counters: true, line_numbers: true };
}

/// Packet match of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleMatch {
    /// `-s ip`
    Source(Ipv4Addr),
    /// `-d ip`
    Destination(Ipv4Addr),
    /// no address match
    Any,
}

/// Jump target of a rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RuleTarget {
    Accept,
    Return,
    Drop,
    Jump(String),
}

impl RuleTarget {
    pub fn as_str(&self) -> &str {
        match self {
            RuleTarget::Accept => "ACCEPT",
            RuleTarget::Return => "RETURN",
            RuleTarget::Drop => "DROP",
            RuleTarget::Jump(chain) => chain,
        }
    }
}

/// A rule as passed to insert/append/delete.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleSpec {
    pub matcher: RuleMatch,
    pub target: RuleTarget,
    pub comment: Option<String>,
}

impl RuleSpec {
    pub fn new(matcher: RuleMatch, target: RuleTarget) -> Self {
        Self {
            matcher,
            target,
            comment: None,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Jump rule used to splice a managed chain into FORWARD.
    pub fn jump(chain: &str) -> Self {
        Self::new(RuleMatch::Any, RuleTarget::Jump(chain.to_string()))
    }

    /// iptables arguments after `-I chain [n]` / `-A chain` / `-D chain`.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(8);
        match self.matcher {
            RuleMatch::Source(ip) => {
                args.push("-s".to_string());
                args.push(ip.to_string());
            }
            RuleMatch::Destination(ip) => {
                args.push("-d".to_string());
                args.push(ip.to_string());
            }
            RuleMatch::Any => {}
        }
        args.push("-j".to_string());
        args.push(self.target.as_str().to_string());
        if let Some(ref comment) = self.comment {
            args.push("-m".to_string());
            args.push("comment".to_string());
            args.push("--comment".to_string());
            args.push(comment.clone());
        }
        args
    }
}

/// Packet-filter capability consumed by the engines.
///
/// Every implementation bounds each invocation with a timeout.
#[async_trait]
pub trait RuleTool: Send + Sync {
    /// Tool version string; fails when the tool cannot be executed.
    async fn version(&self) -> Result<String, ToolError>;

    /// Raw listing of a chain.
    async fn list_chain(
        &self,
        table: Table,
        chain: &str,
        options: ListOptions,
    ) -> Result<String, ToolError>;

    /// Create a chain; succeeds when it already exists.
    async fn create_chain(&self, table: Table, chain: &str) -> Result<(), ToolError>;

    /// Insert a rule at a 1-based position.
    async fn insert_rule(
        &self,
        table: Table,
        chain: &str,
        position: u32,
        rule: &RuleSpec,
    ) -> Result<(), ToolError>;

    /// Append a rule at the end of a chain.
    async fn append_rule(&self, table: Table, chain: &str, rule: &RuleSpec)
        -> Result<(), ToolError>;

    /// Delete a rule by its 1-based number.
    async fn delete_rule_by_number(
        &self,
        table: Table,
        chain: &str,
        number: u32,
    ) -> Result<(), ToolError>;

    /// Delete the first rule matching `rule`. `Ok(false)` when none matched.
    async fn delete_rule_by_match(
        &self,
        table: Table,
        chain: &str,
        rule: &RuleSpec,
    ) -> Result<bool, ToolError>;

    /// Remove every rule of a chain.
    async fn flush_chain(&self, table: Table, chain: &str) -> Result<(), ToolError>;

    /// Drop tracked connections originating from `ip`.
    async fn flush_connections_for_ip(&self, ip: Ipv4Addr) -> Result<(), ToolError>;

    /// Whether a chain exists.
    async fn chain_exists(&self, table: Table, chain: &str) -> Result<bool, ToolError> {
        match self.list_chain(table, chain, ListOptions::PLAIN).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_missing_chain() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Jump from FORWARD position 1 into `chain`, unless already present.
    async fn splice_into_forward(&self, chain: &str) -> Result<(), ToolError> {
        let listing = self
            .list_chain(Table::Filter, FORWARD_CHAIN, ListOptions::NUMBERED)
            .await?;
        if parse_listing(&listing).iter().any(|rule| rule.target == chain) {
            return Ok(());
        }
        self.insert_rule(Table::Filter, FORWARD_CHAIN, 1, &RuleSpec::jump(chain))
            .await
    }
}

/// Shared rule tool handle.
pub type SharedRuleTool = Arc<dyn RuleTool>;

/// One tracked TCP/UDP flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedConnection {
    pub protocol: String,
    pub state: Option<String>,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub sport: Option<u16>,
    pub dport: Option<u16>,
}

impl TrackedConnection {
    pub fn is_established(&self) -> bool {
        self.state.as_deref() == Some("ESTABLISHED")
    }
}

/// Source of per-IP connection information for grace sampling.
#[async_trait]
pub trait ConnectionTracker: Send + Sync {
    /// Connections originating from `ip`.
    async fn connections(&self, ip: Ipv4Addr) -> Result<Vec<TrackedConnection>, ToolError>;
}

/// Shared connection tracker handle.
pub type SharedTracker = Arc<dyn ConnectionTracker>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_spec_args() {
        let ip: Ipv4Addr = "10.0.0.5".parse().unwrap();
        let rule = RuleSpec::new(RuleMatch::Destination(ip), RuleTarget::Accept)
            .with_comment("dl_C_S1");

        assert_eq!(
            rule.to_args(),
            vec!["-d", "10.0.0.5", "-j", "ACCEPT", "-m", "comment", "--comment", "dl_C_S1"]
        );
    }

    #[test]
    fn test_jump_args() {
        assert_eq!(RuleSpec::jump("GRACE").to_args(), vec!["-j", "GRACE"]);
    }

    #[test]
    fn test_missing_chain_detection() {
        let err = ToolError::Failed {
            program: "iptables".to_string(),
            status: 1,
            stderr: "iptables: No chain/target/match by that name.".to_string(),
        };
        assert!(err.is_missing_chain());

        let err = ToolError::Unavailable("iptables".to_string());
        assert!(!err.is_missing_chain());
    }
}
