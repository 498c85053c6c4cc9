//! Firewall engine types.

use std::net::Ipv4Addr;

use serde::Serialize;
use thiserror::Error;

use crate::authority::AuthorityError;
use crate::ruletool::{RuleMatch, RuleSpec, RuleTarget, ToolError};

/// Firewall engine error.
#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("rule tool unavailable: {0}")]
    ToolUnavailable(String),

    #[error("invalid IP address: {0:?}")]
    InvalidIpAddress(String),

    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("failed to insert rule {comment}: {source}")]
    RuleInsert {
        comment: String,
        #[source]
        source: ToolError,
    },

    #[error("rule verification failed for session {session_id}: download={download} upload={upload}")]
    VerificationMismatch {
        session_id: String,
        download: usize,
        upload: usize,
    },

    #[error(transparent)]
    Tool(#[from] ToolError),

    #[error(transparent)]
    Authority(#[from] AuthorityError),

    #[error("firewall engine not initialized")]
    NotInitialized,
}

/// Parse a client address. Only dotted-quad IPv4 is accepted.
pub fn parse_ipv4(raw: &str) -> Result<Ipv4Addr, FirewallError> {
    raw.trim()
        .parse()
        .map_err(|_| FirewallError::InvalidIpAddress(raw.to_string()))
}

/// Traffic direction of a counting rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Destination match
    Download,
    /// Source match
    Upload,
}

impl Direction {
    pub fn prefix(&self) -> &'static str {
        match self {
            Direction::Download => "dl",
            Direction::Upload => "ul",
        }
    }

    pub fn matcher(&self, ip: Ipv4Addr) -> RuleMatch {
        match self {
            Direction::Download => RuleMatch::Destination(ip),
            Direction::Upload => RuleMatch::Source(ip),
        }
    }
}

/// What a managed rule does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Counter(Direction),
    /// nat RETURN so the client skips the portal redirect
    Bypass,
}

/// Comment tags of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTags {
    pub session_id: String,
    /// `{contract}_{session}`, also the bypass comment and the lock key
    pub key: String,
    pub download: String,
    pub upload: String,
}

impl SessionTags {
    pub fn new(contract_id: &str, session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            key: format!("{}_{}", contract_id, session_id),
            download: format!("dl_{}_{}", contract_id, session_id),
            upload: format!("ul_{}_{}", contract_id, session_id),
        }
    }

    pub fn counter(&self, direction: Direction) -> &str {
        match direction {
            Direction::Download => &self.download,
            Direction::Upload => &self.upload,
        }
    }

    pub fn counter_rule(&self, direction: Direction, ip: Ipv4Addr) -> RuleSpec {
        RuleSpec::new(direction.matcher(ip), RuleTarget::Accept)
            .with_comment(self.counter(direction))
    }

    pub fn bypass_rule(&self, ip: Ipv4Addr) -> RuleSpec {
        RuleSpec::new(RuleMatch::Source(ip), RuleTarget::Return).with_comment(self.key.clone())
    }
}

/// Classify a comment written by this deployment.
pub fn parse_tag(contract_id: &str, comment: &str) -> Option<(RuleKind, String)> {
    let split = |prefix: String| {
        comment
            .strip_prefix(prefix.as_str())
            .filter(|rest| !rest.is_empty())
            .map(str::to_string)
    };

    if let Some(session) = split(format!("dl_{}_", contract_id)) {
        return Some((RuleKind::Counter(Direction::Download), session));
    }
    if let Some(session) = split(format!("ul_{}_", contract_id)) {
        return Some((RuleKind::Counter(Direction::Upload), session));
    }
    split(format!("{}_", contract_id)).map(|session| (RuleKind::Bypass, session))
}

/// Successful grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GrantOutcome {
    pub session_id: String,
    /// False when the complete rule set already existed
    pub created: bool,
}

/// Result of a revocation. Every removal step is attempted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RevokeOutcome {
    pub removed: usize,
    pub errors: Vec<String>,
}

impl RevokeOutcome {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimeUsageReport {
    pub updated: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub cleaned: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    /// Sessions whose rules were re-created
    pub restored: usize,
    /// Sessions reported paused instead
    pub paused: usize,
    /// Sessions skipped for having no time left
    pub expired: usize,
    pub errors: usize,
    /// Rules removed by the stale-rule pass
    pub stale_removed: usize,
}

/// Rule counts of the managed chains.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FirewallStats {
    pub accept_rules: usize,
    pub bypass_rules: usize,
    pub blocked_rules: usize,
    pub ledger_entries: usize,
}

/// Byte counters of one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounters {
    pub download_bytes: u64,
    pub upload_bytes: u64,
}

impl SessionCounters {
    pub fn total(&self) -> u64 {
        self.download_bytes + self.upload_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_tags() {
        let tags = SessionTags::new("C", "S1");
        assert_eq!(tags.download, "dl_C_S1");
        assert_eq!(tags.upload, "ul_C_S1");
        assert_eq!(tags.key, "C_S1");

        let ip = Ipv4Addr::new(10, 0, 0, 5);
        assert_eq!(
            tags.counter_rule(Direction::Download, ip).matcher,
            RuleMatch::Destination(ip)
        );
        assert_eq!(tags.bypass_rule(ip).target, RuleTarget::Return);
    }

    #[test]
    fn test_parse_tag() {
        assert_eq!(
            parse_tag("C", "dl_C_S1"),
            Some((RuleKind::Counter(Direction::Download), "S1".to_string()))
        );
        assert_eq!(
            parse_tag("C", "ul_C_abc_def"),
            Some((RuleKind::Counter(Direction::Upload), "abc_def".to_string()))
        );
        assert_eq!(parse_tag("C", "C_S9"), Some((RuleKind::Bypass, "S9".to_string())));
        assert_eq!(parse_tag("C", "dl_D_S1"), None);
        assert_eq!(parse_tag("C", "C_"), None);
    }

    #[test]
    fn test_parse_ipv4() {
        assert!(parse_ipv4(" 10.0.0.5 ").is_ok());
        assert!(matches!(
            parse_ipv4("10.0.0.256"),
            Err(FirewallError::InvalidIpAddress(_))
        ));
        assert!(parse_ipv4("::1").is_err());
    }
}
