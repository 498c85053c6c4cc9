use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

/// Root configuration for portald
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Deployment ("contract") id this agent enforces sessions for
    #[serde(default)]
    pub contract_id: String,

    /// Remote authority (main server) client settings
    #[serde(default)]
    pub authority: AuthorityConfig,

    /// Session firewall settings
    #[serde(default)]
    pub firewall: FirewallConfig,

    /// Temporary grace-access settings
    #[serde(default)]
    pub grace: GraceConfig,

    /// Usage telemetry sync settings
    #[serde(default)]
    pub usage: UsageConfig,

    /// Admin API configuration
    #[serde(default)]
    pub admin: AdminConfig,

    /// Logging and tracing
    #[serde(default)]
    pub telemetry: TelemetryConfig,

    /// Shutdown behaviour
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

/// Remote authority configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AuthorityConfig {
    /// Base URL of the main server (the `/api/v1` prefix is appended)
    #[serde(default = "default_authority_url")]
    pub url: String,

    /// Per-request timeout
    #[serde(default = "default_authority_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Retries for read-only requests
    #[serde(default = "default_authority_retries")]
    pub retries: u32,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            url: default_authority_url(),
            timeout: default_authority_timeout(),
            retries: default_authority_retries(),
        }
    }
}

fn default_authority_url() -> String {
    "http://localhost:3005".to_string()
}

fn default_authority_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_authority_retries() -> u32 {
    2
}

/// How sessions found at startup are handled
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMode {
    /// Re-create counter rules for every active session
    #[default]
    Regrant,
    /// Ask the authority to pause every active session, re-create nothing
    Pause,
}

/// Session firewall configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FirewallConfig {
    /// Chain holding per-session accept/counter rules
    #[serde(default = "default_auth_chain")]
    pub auth_chain: String,

    /// Chain reserved for banned IPs
    #[serde(default = "default_block_chain")]
    pub block_chain: String,

    /// Insert a nat PREROUTING RETURN rule so granted clients skip the portal redirect
    #[serde(default = "default_true")]
    pub nat_bypass: bool,

    /// iptables binary
    #[serde(default = "default_tool_path")]
    pub tool_path: String,

    /// conntrack binary
    #[serde(default = "default_conntrack_path")]
    pub conntrack_path: String,

    /// Prefix every invocation with sudo
    #[serde(default)]
    pub use_sudo: bool,

    /// Timeout for a single rule tool invocation
    #[serde(default = "default_tool_timeout", with = "humantime_serde")]
    pub tool_timeout: Duration,

    /// Time accounting period
    #[serde(default = "default_usage_interval", with = "humantime_serde")]
    pub usage_interval: Duration,

    /// Expiry sweep period
    #[serde(default = "default_expiry_interval", with = "humantime_serde")]
    pub expiry_interval: Duration,

    /// Upper bound for one scheduled iteration
    #[serde(default = "default_tick_timeout", with = "humantime_serde")]
    pub tick_timeout: Duration,

    /// Reconcile against the authority on startup
    #[serde(default = "default_true")]
    pub restore_on_start: bool,

    /// Startup reconciliation mode
    #[serde(default)]
    pub restore_mode: RestoreMode,

    /// Pause between two session restorations
    #[serde(default = "default_restore_delay", with = "humantime_serde")]
    pub restore_delay: Duration,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            auth_chain: default_auth_chain(),
            block_chain: default_block_chain(),
            nat_bypass: true,
            tool_path: default_tool_path(),
            conntrack_path: default_conntrack_path(),
            use_sudo: false,
            tool_timeout: default_tool_timeout(),
            usage_interval: default_usage_interval(),
            expiry_interval: default_expiry_interval(),
            tick_timeout: default_tick_timeout(),
            restore_on_start: true,
            restore_mode: RestoreMode::default(),
            restore_delay: default_restore_delay(),
        }
    }
}

fn default_auth_chain() -> String {
    "PORTAL_AUTH_USERS".to_string()
}

fn default_block_chain() -> String {
    "PORTAL_BLOCKED".to_string()
}

fn default_tool_path() -> String {
    "/sbin/iptables".to_string()
}

fn default_conntrack_path() -> String {
    "conntrack".to_string()
}

fn default_tool_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_usage_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_expiry_interval() -> Duration {
    Duration::from_secs(120)
}

fn default_tick_timeout() -> Duration {
    Duration::from_secs(50)
}

fn default_restore_delay() -> Duration {
    Duration::from_millis(100)
}

/// Grace-access configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GraceConfig {
    /// Dedicated chain for temporary accept rules
    #[serde(default = "default_grace_chain")]
    pub chain: String,

    /// Auto-revoke deadline
    #[serde(default = "default_grace_window", with = "humantime_serde")]
    pub window: Duration,

    /// Traffic sampling period
    #[serde(default = "default_sample_interval", with = "humantime_serde")]
    pub sample_interval: Duration,

    /// How long sampling runs after a grant
    #[serde(default = "default_grace_window", with = "humantime_serde")]
    pub monitor_window: Duration,

    /// Cumulative byte ceiling for one grant
    #[serde(default = "default_max_bandwidth")]
    pub max_bandwidth: u64,

    /// Per-sample byte delta counted as a heavy burst
    #[serde(default = "default_heavy_burst")]
    pub heavy_burst: u64,

    /// Heavy bursts tolerated before blocking
    #[serde(default = "default_heavy_burst_limit")]
    pub heavy_burst_limit: usize,

    /// Established connection ceiling
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Destination ports that block on any hit
    #[serde(default = "default_suspicious_ports")]
    pub suspicious_ports: Vec<u16>,
}

impl Default for GraceConfig {
    fn default() -> Self {
        Self {
            chain: default_grace_chain(),
            window: default_grace_window(),
            sample_interval: default_sample_interval(),
            monitor_window: default_grace_window(),
            max_bandwidth: default_max_bandwidth(),
            heavy_burst: default_heavy_burst(),
            heavy_burst_limit: default_heavy_burst_limit(),
            max_connections: default_max_connections(),
            suspicious_ports: default_suspicious_ports(),
        }
    }
}

fn default_grace_chain() -> String {
    "PORTAL_TEMP_ACCESS".to_string()
}

fn default_grace_window() -> Duration {
    Duration::from_secs(180)
}

fn default_sample_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_max_bandwidth() -> u64 {
    50 * 1024 * 1024
}

fn default_heavy_burst() -> u64 {
    10 * 1024 * 1024
}

fn default_heavy_burst_limit() -> usize {
    3
}

fn default_max_connections() -> usize {
    50
}

fn default_suspicious_ports() -> Vec<u16> {
    (6881..=6889).collect()
}

/// Usage telemetry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UsageConfig {
    /// Sync period
    #[serde(default = "default_usage_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Also report host metrics
    #[serde(default = "default_true")]
    pub system_metrics: bool,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            interval: default_usage_interval(),
            system_metrics: true,
        }
    }
}

/// Admin API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    /// HTTP API address
    #[serde(default = "default_admin_address")]
    pub address: SocketAddr,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            address: default_admin_address(),
        }
    }
}

fn default_admin_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_true() -> bool {
    true
}

/// Telemetry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable structured JSON logging
    #[serde(default)]
    pub json_logs: bool,

    /// OTLP endpoint for distributed tracing
    pub otlp_endpoint: Option<String>,

    /// Trace sample rate (0.0 - 1.0)
    #[serde(default = "default_sample_rate")]
    pub trace_sample_rate: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            otlp_endpoint: None,
            trace_sample_rate: default_sample_rate(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_sample_rate() -> f64 {
    1.0
}

/// Shutdown configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ShutdownConfig {
    /// Max time spent stopping background work
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout: default_shutdown_timeout(),
        }
    }
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

/// Humantime serde support module
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
