//! In-memory mirror of the rules this engine installed.
//!
//! Keyed by `(chain, comment)`. Periodic reconciliation against a real
//! listing turns silent drift into explicit, counted events.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::types::{parse_tag, RuleKind, SessionTags};
use crate::ruletool::{ListedRule, Table};

/// A rule the engine believes is installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleDescriptor {
    #[serde(skip)]
    pub table: Table,
    pub chain: String,
    pub kind: RuleKind,
    pub ip: Ipv4Addr,
    pub session_id: String,
    pub comment: String,
    pub installed_at: DateTime<Utc>,
}

/// Differences found by [`RuleLedger::reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DriftReport {
    /// Ledger entries with no matching rule (dropped from the ledger)
    pub missing: Vec<String>,
    /// Tagged rules the ledger did not know about (adopted)
    pub unexpected: Vec<String>,
}

impl DriftReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct RuleLedger {
    entries: HashMap<(String, String), RuleDescriptor>,
}

impl RuleLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, descriptor: RuleDescriptor) {
        self.entries.insert(
            (descriptor.chain.clone(), descriptor.comment.clone()),
            descriptor,
        );
    }

    /// Drop every entry of a session.
    pub fn forget_session(&mut self, tags: &SessionTags) {
        self.entries.retain(|(_, comment), _| {
            comment != &tags.download && comment != &tags.upload && comment != &tags.key
        });
    }

    pub fn get(&self, chain: &str, comment: &str) -> Option<&RuleDescriptor> {
        self.entries.get(&(chain.to_string(), comment.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Compare the ledger for one chain against its listing.
    pub fn reconcile(
        &mut self,
        table: Table,
        chain: &str,
        contract_id: &str,
        listed: &[ListedRule],
    ) -> DriftReport {
        let mut report = DriftReport::default();
        let mut seen = HashSet::new();

        for rule in listed {
            let Some(comment) = rule.comment.as_deref() else {
                continue;
            };
            let Some((kind, session_id)) = parse_tag(contract_id, comment) else {
                continue;
            };
            seen.insert(comment.to_string());

            let key = (chain.to_string(), comment.to_string());
            if self.entries.contains_key(&key) {
                continue;
            }
            let Some(ip) = rule.host_ip() else {
                continue;
            };

            report.unexpected.push(comment.to_string());
            self.entries.insert(
                key,
                RuleDescriptor {
                    table,
                    chain: chain.to_string(),
                    kind,
                    ip,
                    session_id,
                    comment: comment.to_string(),
                    installed_at: Utc::now(),
                },
            );
        }

        self.entries.retain(|(entry_chain, comment), _| {
            if entry_chain != chain || seen.contains(comment) {
                return true;
            }
            report.missing.push(comment.clone());
            false
        });

        report.missing.sort();
        report.unexpected.sort();
        report
    }
}
