//! Abuse heuristics evaluated on every grace sample.
//!
//! These bound resource use during the grace window. They are not an
//! isolation guarantee.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::GraceConfig;
use crate::ruletool::TrackedConnection;

const MB: f64 = 1024.0 * 1024.0;

/// Traffic observed for one grace grant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrafficStats {
    /// Cumulative bytes since the grant
    pub total_bytes: u64,
    /// Counter value at the previous sample
    pub last_counter: u64,
    pub last_checked: Option<DateTime<Utc>>,
    pub samples: u64,
    /// Heavy-burst and other warnings, oldest first
    pub violations: Vec<String>,
}

impl TrafficStats {
    /// Fold a fresh rule counter into the stats. Returns the delta.
    ///
    /// A counter below the previous value means the rule was re-created;
    /// the new value counts in full.
    pub fn observe(&mut self, counter: u64, now: DateTime<Utc>) -> u64 {
        let delta = if counter >= self.last_counter {
            counter - self.last_counter
        } else {
            counter
        };
        self.last_counter = counter;
        self.total_bytes += delta;
        self.last_checked = Some(now);
        self.samples += 1;
        delta
    }

    pub fn heavy_bursts(&self) -> usize {
        self.violations.len()
    }
}

/// Why a grace grant was cut short.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Violation {
    BandwidthExceeded { total_bytes: u64, limit: u64 },
    RepeatedHeavyUsage { bursts: usize },
    TooManyConnections { count: usize, limit: usize },
    SuspiciousPort(u16),
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Violation::BandwidthExceeded { total_bytes, .. } => write!(
                f,
                "bandwidth limit exceeded: {:.2}MB",
                *total_bytes as f64 / MB
            ),
            Violation::RepeatedHeavyUsage { bursts } => {
                write!(f, "repeated heavy usage: {} bursts", bursts)
            }
            Violation::TooManyConnections { count, .. } => {
                write!(f, "high connection count: {} connections", count)
            }
            Violation::SuspiciousPort(port) => write!(f, "suspicious port usage: {}", port),
        }
    }
}

/// Thresholds from the grace configuration.
#[derive(Debug, Clone)]
pub struct GracePolicy {
    pub max_bandwidth: u64,
    pub heavy_burst: u64,
    pub heavy_burst_limit: usize,
    pub max_connections: usize,
    pub suspicious_ports: BTreeSet<u16>,
}

impl From<&GraceConfig> for GracePolicy {
    fn from(config: &GraceConfig) -> Self {
        Self {
            max_bandwidth: config.max_bandwidth,
            heavy_burst: config.heavy_burst,
            heavy_burst_limit: config.heavy_burst_limit,
            max_connections: config.max_connections,
            suspicious_ports: config.suspicious_ports.iter().copied().collect(),
        }
    }
}

impl GracePolicy {
    /// Check the byte counter after [`TrafficStats::observe`].
    ///
    /// The cumulative ceiling is strict: exactly `max_bandwidth` passes.
    pub fn check_traffic(&self, stats: &mut TrafficStats, delta: u64) -> Option<Violation> {
        if stats.total_bytes > self.max_bandwidth {
            return Some(Violation::BandwidthExceeded {
                total_bytes: stats.total_bytes,
                limit: self.max_bandwidth,
            });
        }

        if delta > self.heavy_burst {
            stats
                .violations
                .push(format!("heavy usage: {:.2}MB in one sample", delta as f64 / MB));
            if stats.heavy_bursts() >= self.heavy_burst_limit {
                return Some(Violation::RepeatedHeavyUsage {
                    bursts: stats.heavy_bursts(),
                });
            }
        }

        None
    }

    /// Check the IP's tracked connections.
    pub fn check_connections(&self, connections: &[TrackedConnection]) -> Option<Violation> {
        let established = connections.iter().filter(|c| c.is_established()).count();
        if established > self.max_connections {
            return Some(Violation::TooManyConnections {
                count: established,
                limit: self.max_connections,
            });
        }

        connections
            .iter()
            .filter_map(|c| c.dport)
            .find(|port| self.suspicious_ports.contains(port))
            .map(Violation::SuspiciousPort)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const ONE_MB: u64 = 1024 * 1024;

    fn policy() -> GracePolicy {
        GracePolicy::from(&GraceConfig::default())
    }

    fn connection(dport: u16, state: &str) -> TrackedConnection {
        TrackedConnection {
            protocol: "tcp".to_string(),
            state: Some(state.to_string()),
            src: Ipv4Addr::new(10, 0, 0, 5),
            dst: Ipv4Addr::new(1, 1, 1, 1),
            sport: Some(50000),
            dport: Some(dport),
        }
    }

    #[test]
    fn test_bandwidth_boundary() {
        let policy = policy();

        let mut stats = TrafficStats::default();
        let delta = stats.observe(49 * ONE_MB, Utc::now());
        assert_eq!(policy.check_traffic(&mut stats, delta), None);

        let mut stats = TrafficStats::default();
        let delta = stats.observe(51 * ONE_MB, Utc::now());
        assert!(matches!(
            policy.check_traffic(&mut stats, delta),
            Some(Violation::BandwidthExceeded { .. })
        ));

        let mut stats = TrafficStats::default();
        let delta = stats.observe(50 * ONE_MB, Utc::now());
        assert_eq!(policy.check_traffic(&mut stats, delta), None);
    }

    #[test]
    fn test_observe_accumulates_deltas() {
        let mut stats = TrafficStats::default();
        assert_eq!(stats.observe(100, Utc::now()), 100);
        assert_eq!(stats.observe(250, Utc::now()), 150);
        // Counter reset
        assert_eq!(stats.observe(40, Utc::now()), 40);
        assert_eq!(stats.total_bytes, 290);
        assert_eq!(stats.samples, 3);
    }

    #[test]
    fn test_three_heavy_bursts_block() {
        let policy = GracePolicy {
            max_bandwidth: 1024 * ONE_MB,
            ..policy()
        };
        let mut stats = TrafficStats::default();
        let mut counter = 0;

        for round in 1..=3 {
            counter += 11 * ONE_MB;
            let delta = stats.observe(counter, Utc::now());
            let verdict = policy.check_traffic(&mut stats, delta);
            if round < 3 {
                assert_eq!(verdict, None);
            } else {
                assert_eq!(verdict, Some(Violation::RepeatedHeavyUsage { bursts: 3 }));
            }
        }
    }

    #[test]
    fn test_bursts_below_threshold_are_ignored() {
        let policy = policy();
        let mut stats = TrafficStats::default();
        let delta = stats.observe(10 * ONE_MB, Utc::now());
        assert_eq!(policy.check_traffic(&mut stats, delta), None);
        assert!(stats.violations.is_empty());
    }

    #[test]
    fn test_connection_ceiling() {
        let policy = policy();
        let mut connections: Vec<_> = (0..50).map(|_| connection(443, "ESTABLISHED")).collect();
        connections.push(connection(443, "TIME_WAIT"));
        assert_eq!(policy.check_connections(&connections), None);

        connections.push(connection(443, "ESTABLISHED"));
        assert_eq!(
            policy.check_connections(&connections),
            Some(Violation::TooManyConnections { count: 51, limit: 50 })
        );
    }

    #[test]
    fn test_suspicious_port() {
        let policy = policy();
        let connections = vec![connection(443, "ESTABLISHED"), connection(6885, "SYN_SENT")];
        assert_eq!(
            policy.check_connections(&connections),
            Some(Violation::SuspiciousPort(6885))
        );
        assert_eq!(
            Violation::SuspiciousPort(6885).to_string(),
            "suspicious port usage: 6885"
        );
    }
}
