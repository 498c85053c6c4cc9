use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info};

use super::types::Config;

/// Upper bound on `authority.retries`.
const MAX_AUTHORITY_RETRIES: u32 = 10;

impl Config {
    /// Load configuration from a YAML file, then apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        debug!(path = %path.display(), "loading configuration");

        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        let mut config: Config = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;

        Ok(config)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)
            .context("failed to parse YAML configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Apply `CONTRACT_ID`, `MAIN_SERVER_URL` and `PORTALD_LOG_LEVEL` overrides.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(contract_id) = lookup("CONTRACT_ID").filter(|v| !v.trim().is_empty()) {
            self.contract_id = contract_id.trim().to_string();
        }
        if let Some(url) = lookup("MAIN_SERVER_URL").filter(|v| !v.trim().is_empty()) {
            self.authority.url = url.trim().to_string();
        }
        if let Some(level) = lookup("PORTALD_LOG_LEVEL").filter(|v| !v.trim().is_empty()) {
            self.telemetry.log_level = level.trim().to_string();
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.contract_id.trim().is_empty() {
            anyhow::bail!("contract_id must be set (config file or CONTRACT_ID)");
        }

        // Comments are matched by substring, keep the id free of separators
        if self.contract_id.contains(char::is_whitespace) || self.contract_id.contains('"') {
            anyhow::bail!("contract_id must not contain whitespace or quotes");
        }

        let url = &self.authority.url;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            anyhow::bail!("authority url must be http(s): {}", url);
        }

        if self.authority.retries > MAX_AUTHORITY_RETRIES {
            anyhow::bail!(
                "authority.retries must be at most {} (got {})",
                MAX_AUTHORITY_RETRIES,
                self.authority.retries
            );
        }

        let fw = &self.firewall;
        let mut chains = std::collections::HashSet::new();
        for chain in [&fw.auth_chain, &fw.block_chain, &self.grace.chain] {
            if chain.is_empty() || chain.len() > 28 {
                anyhow::bail!("invalid chain name: '{}'", chain);
            }
            if !chains.insert(chain) {
                anyhow::bail!("duplicate chain name: {}", chain);
            }
        }

        for (name, value) in [
            ("firewall.tool_timeout", fw.tool_timeout),
            ("firewall.usage_interval", fw.usage_interval),
            ("firewall.expiry_interval", fw.expiry_interval),
            ("firewall.tick_timeout", fw.tick_timeout),
            ("grace.window", self.grace.window),
            ("grace.sample_interval", self.grace.sample_interval),
            ("usage.interval", self.usage.interval),
        ] {
            if value.is_zero() {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }

        if self.grace.sample_interval > self.grace.window {
            anyhow::bail!("grace.sample_interval must not exceed grace.window");
        }

        if self.grace.heavy_burst_limit == 0 {
            anyhow::bail!("grace.heavy_burst_limit must be at least 1");
        }

        info!(contract_id = %self.contract_id, "configuration validated successfully");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RestoreMode;
    use std::time::Duration;

    #[test]
    fn test_minimal_config() {
        let yaml = r#"
contract_id: "42"
"#;

        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.contract_id, "42");
        assert_eq!(config.firewall.usage_interval, Duration::from_secs(60));
        assert_eq!(config.firewall.expiry_interval, Duration::from_secs(120));
        assert_eq!(config.grace.window, Duration::from_secs(180));
        assert_eq!(config.grace.max_bandwidth, 50 * 1024 * 1024);
        assert_eq!(config.grace.suspicious_ports.len(), 9);
        assert_eq!(config.firewall.restore_mode, RestoreMode::Regrant);
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
contract_id: venue-7
authority:
  url: "https://main.example.com"
  timeout: 5s
firewall:
  auth_chain: AUTH
  block_chain: BLOCK
  nat_bypass: false
  use_sudo: true
  tool_timeout: 2s
  restore_mode: pause
grace:
  chain: GRACE
  window: 2m
  sample_interval: 10s
  suspicious_ports: [6881]
usage:
  interval: 30s
  system_metrics: false
admin:
  address: "0.0.0.0:9191"
"#;

        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.authority.timeout, Duration::from_secs(5));
        assert!(!config.firewall.nat_bypass);
        assert!(config.firewall.use_sudo);
        assert_eq!(config.firewall.restore_mode, RestoreMode::Pause);
        assert_eq!(config.grace.window, Duration::from_secs(120));
        assert_eq!(config.grace.suspicious_ports, vec![6881]);
        assert!(!config.usage.system_metrics);
        assert_eq!(config.admin.address.port(), 9191);
    }

    #[test]
    fn test_missing_contract_id() {
        let result = Config::from_yaml("firewall: {}\n");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("contract_id"));
    }

    #[test]
    fn test_duplicate_chain_names() {
        let yaml = r#"
contract_id: "1"
firewall:
  auth_chain: SAME
  block_chain: SAME
"#;

        let result = Config::from_yaml(yaml);
        assert!(result.unwrap_err().to_string().contains("duplicate chain"));
    }

    #[test]
    fn test_authority_retries_bounded() {
        let yaml = r#"
contract_id: "1"
authority:
  retries: 64
"#;

        let result = Config::from_yaml(yaml);
        assert!(result.unwrap_err().to_string().contains("authority.retries"));
    }

    #[test]
    fn test_sample_interval_longer_than_window() {
        let yaml = r#"
contract_id: "1"
grace:
  window: 10s
  sample_interval: 30s
"#;

        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_env(|key| match key {
            "CONTRACT_ID" => Some(" 99 ".to_string()),
            "MAIN_SERVER_URL" => Some("http://10.1.1.1:3005".to_string()),
            _ => None,
        });

        assert_eq!(config.contract_id, "99");
        assert_eq!(config.authority.url, "http://10.1.1.1:3005");
        assert_eq!(config.telemetry.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portald.yaml");
        std::fs::write(&path, "contract_id: file-1\n").unwrap();

        let config = Config::load(&path).unwrap();
        // CONTRACT_ID may be set in the environment running the tests
        assert!(!config.contract_id.is_empty());
    }
}
