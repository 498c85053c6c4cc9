//! iptables / conntrack subprocess driver.

use std::net::Ipv4Addr;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{
    ConnectionTracker, ListOptions, RuleSpec, RuleTool, Table, ToolError, TrackedConnection,
};
use crate::config::FirewallConfig;
use crate::telemetry::counters;

/// Captured process output.
#[derive(Debug)]
struct ToolOutput {
    status: i32,
    stdout: String,
    stderr: String,
}

impl ToolOutput {
    fn success(&self) -> bool {
        self.status == 0
    }
}

/// Process runner shared by the iptables tool and the conntrack reader.
#[derive(Debug, Clone)]
struct Runner {
    use_sudo: bool,
    timeout: Duration,
}

impl Runner {
    /// Run `program args...`, bounded by the configured timeout.
    ///
    /// Arguments are passed as a vector; nothing goes through a shell.
    async fn run(&self, op: &'static str, program: &str, args: &[String]) -> Result<ToolOutput, ToolError> {
        let mut cmd = if self.use_sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg(program);
            cmd
        } else {
            Command::new(program)
        };

        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(op, program, args = ?args, "invoking rule tool");

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                counters::rule_tool_invocation(op, "unavailable");
                return Err(ToolError::Unavailable(program.to_string()));
            }
            Err(e) => {
                counters::rule_tool_invocation(op, "spawn_error");
                return Err(ToolError::Spawn {
                    program: program.to_string(),
                    source: e,
                });
            }
        };

        match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let output = ToolOutput {
                    status: output.status.code().unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                };
                counters::rule_tool_invocation(op, if output.success() { "ok" } else { "failed" });
                Ok(output)
            }
            Ok(Err(e)) => {
                counters::rule_tool_invocation(op, "spawn_error");
                Err(ToolError::Spawn {
                    program: program.to_string(),
                    source: e,
                })
            }
            Err(_) => {
                // kill_on_drop reaps the child once the future is dropped
                warn!(op, program, timeout = ?self.timeout, "rule tool invocation timed out");
                counters::rule_tool_invocation(op, "timeout");
                Err(ToolError::Timeout {
                    program: program.to_string(),
                    timeout: self.timeout,
                })
            }
        }
    }
}

fn failed(program: &str, output: ToolOutput) -> ToolError {
    ToolError::Failed {
        program: program.to_string(),
        status: output.status,
        stderr: output.stderr,
    }
}

/// [`RuleTool`] backed by the `iptables` binary.
#[derive(Debug, Clone)]
pub struct IptablesTool {
    iptables: String,
    conntrack: String,
    runner: Runner,
}

impl IptablesTool {
    pub fn new(config: &FirewallConfig) -> Self {
        Self {
            iptables: config.tool_path.clone(),
            conntrack: config.conntrack_path.clone(),
            runner: Runner {
                use_sudo: config.use_sudo,
                timeout: config.tool_timeout,
            },
        }
    }

    async fn iptables(&self, op: &'static str, args: Vec<String>) -> Result<String, ToolError> {
        let output = self.runner.run(op, &self.iptables, &args).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(failed(&self.iptables, output))
        }
    }
}

fn table_args(table: Table, action: &str, chain: &str) -> Vec<String> {
    vec![
        "-t".to_string(),
        table.as_str().to_string(),
        action.to_string(),
        chain.to_string(),
    ]
}

#[async_trait]
impl RuleTool for IptablesTool {
    async fn version(&self) -> Result<String, ToolError> {
        let out = self.iptables("version", vec!["--version".to_string()]).await?;
        Ok(out.trim().to_string())
    }

    async fn list_chain(
        &self,
        table: Table,
        chain: &str,
        options: ListOptions,
    ) -> Result<String, ToolError> {
        let mut args = table_args(table, "-L", chain);
        args.push("-n".to_string());
        if options.counters {
            args.push("-v".to_string());
            args.push("-x".to_string());
        }
        if options.line_numbers {
            args.push("--line-numbers".to_string());
        }
        self.iptables("list", args).await
    }

    async fn create_chain(&self, table: Table, chain: &str) -> Result<(), ToolError> {
        let args = table_args(table, "-N", chain);
        let output = self.runner.run("create_chain", &self.iptables, &args).await?;
        if output.success() || output.stderr.contains("already exists") {
            Ok(())
        } else {
            Err(failed(&self.iptables, output))
        }
    }

    async fn insert_rule(
        &self,
        table: Table,
        chain: &str,
        position: u32,
        rule: &RuleSpec,
    ) -> Result<(), ToolError> {
        let mut args = table_args(table, "-I", chain);
        args.push(position.max(1).to_string());
        args.extend(rule.to_args());
        self.iptables("insert", args).await.map(|_| ())
    }

    async fn append_rule(&self, table: Table, chain: &str, rule: &RuleSpec) -> Result<(), ToolError> {
        let mut args = table_args(table, "-A", chain);
        args.extend(rule.to_args());
        self.iptables("append", args).await.map(|_| ())
    }

    async fn delete_rule_by_number(
        &self,
        table: Table,
        chain: &str,
        number: u32,
    ) -> Result<(), ToolError> {
        let mut args = table_args(table, "-D", chain);
        args.push(number.to_string());
        self.iptables("delete_number", args).await.map(|_| ())
    }

    async fn delete_rule_by_match(
        &self,
        table: Table,
        chain: &str,
        rule: &RuleSpec,
    ) -> Result<bool, ToolError> {
        let mut args = table_args(table, "-D", chain);
        args.extend(rule.to_args());
        let output = self.runner.run("delete_match", &self.iptables, &args).await?;

        if output.success() {
            return Ok(true);
        }
        // Exit status 1 is "no such rule"; 2 and up are usage problems
        if output.status == 1 || output.stderr.contains("does a matching rule exist") {
            return Ok(false);
        }
        Err(failed(&self.iptables, output))
    }

    async fn flush_chain(&self, table: Table, chain: &str) -> Result<(), ToolError> {
        self.iptables("flush", table_args(table, "-F", chain))
            .await
            .map(|_| ())
    }

    async fn flush_connections_for_ip(&self, ip: Ipv4Addr) -> Result<(), ToolError> {
        let args = vec!["-D".to_string(), "-s".to_string(), ip.to_string()];
        let output = self.runner.run("conntrack_flush", &self.conntrack, &args).await?;
        // conntrack exits 1 when nothing matched
        if output.success() || output.status == 1 {
            Ok(())
        } else {
            Err(failed(&self.conntrack, output))
        }
    }
}

/// [`ConnectionTracker`] backed by `conntrack -L`.
#[derive(Debug, Clone)]
pub struct ConntrackReader {
    conntrack: String,
    runner: Runner,
}

impl ConntrackReader {
    pub fn new(config: &FirewallConfig) -> Self {
        Self {
            conntrack: config.conntrack_path.clone(),
            runner: Runner {
                use_sudo: config.use_sudo,
                timeout: config.tool_timeout,
            },
        }
    }
}

#[async_trait]
impl ConnectionTracker for ConntrackReader {
    async fn connections(&self, ip: Ipv4Addr) -> Result<Vec<TrackedConnection>, ToolError> {
        let args = vec![
            "-L".to_string(),
            "-s".to_string(),
            ip.to_string(),
            "-p".to_string(),
            "tcp".to_string(),
        ];
        let output = self.runner.run("conntrack_list", &self.conntrack, &args).await?;
        if !output.success() && output.status != 1 {
            return Err(failed(&self.conntrack, output));
        }
        Ok(parse_conntrack(&output.stdout))
    }
}

/// Parse `conntrack -L` lines. Only the original direction (first
/// `src=`/`dst=`/`sport=`/`dport=` group) is kept.
pub(crate) fn parse_conntrack(text: &str) -> Vec<TrackedConnection> {
    text.lines().filter_map(parse_conntrack_line).collect()
}

fn parse_conntrack_line(line: &str) -> Option<TrackedConnection> {
    let mut tokens = line.split_whitespace();
    let protocol = tokens.next()?.to_string();

    let mut state = None;
    let mut src = None;
    let mut dst = None;
    let mut sport = None;
    let mut dport = None;

    for token in tokens {
        match token.split_once('=') {
            Some(("src", v)) if src.is_none() => src = v.parse().ok(),
            Some(("dst", v)) if dst.is_none() => dst = v.parse().ok(),
            Some(("sport", v)) if sport.is_none() => sport = v.parse().ok(),
            Some(("dport", v)) if dport.is_none() => dport = v.parse().ok(),
            Some(_) => {}
            None => {
                if src.is_none()
                    && token.len() > 1
                    && token.chars().all(|c| c.is_ascii_uppercase() || c == '_')
                {
                    state = Some(token.to_string());
                }
            }
        }
    }

    Some(TrackedConnection {
        protocol,
        state,
        src: src?,
        dst: dst?,
        sport,
        dport,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_conntrack_lines() {
        let text = "\
tcp      6 431999 ESTABLISHED src=10.0.0.5 dst=93.184.216.34 sport=51234 dport=443 src=93.184.216.34 dst=192.168.1.2 sport=443 dport=51234 [ASSURED] mark=0 use=1
tcp      6 118 SYN_SENT src=10.0.0.5 dst=1.2.3.4 sport=40000 dport=6881 [UNREPLIED] src=1.2.3.4 dst=192.168.1.2 sport=6881 dport=40000 mark=0 use=1
conntrack v1.4.6 (conntrack-tools): 2 flow entries have been shown.
";
        let conns = parse_conntrack(text);
        assert_eq!(conns.len(), 2);

        assert!(conns[0].is_established());
        assert_eq!(conns[0].dport, Some(443));
        assert_eq!(conns[0].dst, "93.184.216.34".parse::<Ipv4Addr>().unwrap());

        assert_eq!(conns[1].state.as_deref(), Some("SYN_SENT"));
        assert_eq!(conns[1].dport, Some(6881));
        assert!(!conns[1].is_established());
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        let config = FirewallConfig {
            tool_path: "/nonexistent/iptables".to_string(),
            ..Default::default()
        };
        let tool = IptablesTool::new(&config);

        let err = tool.version().await.unwrap_err();
        assert!(matches!(err, ToolError::Unavailable(_)));
    }
}
