//! Settings document loading and validation (§3, §6, ambient C11).
//!
//! A top-level struct deserialized straight from TOML with `#[serde(default)]` everywhere,
//! followed by an explicit `validate()` pass so bad config fails fast at startup instead of
//! producing confusing runtime behavior.

use std::{collections::HashSet, fs, path::Path};

use anyhow::{Context, bail};
use serde::Deserialize;

use crate::model::Scheme;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub healthcheck: HealthcheckConfig,
    #[serde(rename = "upstream", default)]
    pub upstreams: Vec<UpstreamConfig>,
}

impl AppConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file at {}", path.to_string_lossy()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self =
            toml::from_str(content).with_context(|| "failed to parse TOML settings document")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.listen.is_empty() {
            bail!("server.listen must list at least one address");
        }

        if self.upstreams.is_empty() && self.server.upstreams_path.is_none() {
            bail!("config must include at least one [[upstream]] block or server.upstreams_path");
        }
        for upstream in &self.upstreams {
            if upstream.address.trim().is_empty() {
                bail!("upstream entry has an empty address");
            }
            upstream
                .scheme
                .parse::<Scheme>()
                .map_err(|e| anyhow::anyhow!(e))
                .with_context(|| format!("invalid scheme for upstream '{}'", upstream.address))?;
        }

        self.rotation.validate()?;
        self.rate_limit.validate()?;
        self.healthcheck.validate()?;

        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub threads: Option<usize>,
    #[serde(default = "default_grace_period")]
    pub graceful_shutdown_timeout_seconds: u64,
    #[serde(default)]
    pub upstreams_path: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            log_level: default_log_level(),
            threads: None,
            graceful_shutdown_timeout_seconds: default_grace_period(),
            upstreams_path: None,
        }
    }
}

fn default_listen() -> Vec<String> {
    vec!["0.0.0.0:8888".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_grace_period() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RotationMethod {
    #[default]
    Random,
    RoundRobin,
    LeastConn,
    TimeBased,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RotationConfig {
    #[serde(default)]
    pub method: RotationMethod,
    #[serde(default = "default_time_based_interval_s")]
    pub time_based_interval_s: u64,
    #[serde(default = "default_true")]
    pub remove_unhealthy: bool,
    #[serde(default)]
    pub fallback: bool,
    #[serde(default = "default_fallback_max_retries")]
    pub fallback_max_retries: usize,
    #[serde(default)]
    pub follow_redirect: bool,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
    #[serde(default = "default_retries")]
    pub retries: usize,
    #[serde(default)]
    pub allowed_protocols: HashSet<String>,
    #[serde(default)]
    pub max_response_time_ms: u64,
    #[serde(default)]
    pub min_success_rate: f64,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            method: RotationMethod::default(),
            time_based_interval_s: default_time_based_interval_s(),
            remove_unhealthy: true,
            fallback: false,
            fallback_max_retries: default_fallback_max_retries(),
            follow_redirect: false,
            timeout_s: default_timeout_s(),
            retries: default_retries(),
            allowed_protocols: HashSet::new(),
            max_response_time_ms: 0,
            min_success_rate: 0.0,
        }
    }
}

impl RotationConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if !(1..=300).contains(&self.timeout_s) {
            bail!("rotation.timeout_s must be between 1 and 300");
        }
        if self.retries > 10 {
            bail!("rotation.retries must be between 0 and 10");
        }
        if !(0.0..=100.0).contains(&self.min_success_rate) {
            bail!("rotation.min_success_rate must be between 0 and 100");
        }
        if self.time_based_interval_s == 0 {
            bail!("rotation.time_based_interval_s must be > 0");
        }
        for proto in &self.allowed_protocols {
            proto
                .parse::<Scheme>()
                .map_err(|e| anyhow::anyhow!(e))
                .context("invalid entry in rotation.allowed_protocols")?;
        }
        Ok(())
    }

    pub fn allowed_schemes(&self) -> HashSet<Scheme> {
        self.allowed_protocols
            .iter()
            .filter_map(|p| p.parse::<Scheme>().ok())
            .collect()
    }
}

fn default_time_based_interval_s() -> u64 {
    60
}

fn default_fallback_max_retries() -> usize {
    3
}

fn default_timeout_s() -> u64 {
    30
}

fn default_retries() -> usize {
    1
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_rate_interval_s")]
    pub interval_s: u64,
    #[serde(default = "default_rate_max_requests")]
    pub max_requests: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_s: default_rate_interval_s(),
            max_requests: default_rate_max_requests(),
        }
    }
}

impl RateLimitConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.enabled && self.interval_s == 0 {
            bail!("rate_limit.interval_s must be > 0 when rate_limit.enabled is true");
        }
        if self.enabled && self.max_requests == 0 {
            bail!("rate_limit.max_requests must be > 0 when rate_limit.enabled is true");
        }
        Ok(())
    }
}

fn default_rate_interval_s() -> u64 {
    1
}

fn default_rate_max_requests() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthcheckConfig {
    #[serde(default = "default_healthcheck_timeout_s")]
    pub timeout_s: u64,
    #[serde(default = "default_healthcheck_workers")]
    pub workers: usize,
    #[serde(default = "default_healthcheck_url")]
    pub url: String,
    #[serde(default = "default_expected_status")]
    pub expected_status: u16,
    #[serde(default)]
    pub headers: Vec<String>,
    #[serde(default = "default_healthcheck_interval_s")]
    pub interval_s: u64,
}

impl Default for HealthcheckConfig {
    fn default() -> Self {
        Self {
            timeout_s: default_healthcheck_timeout_s(),
            workers: default_healthcheck_workers(),
            url: default_healthcheck_url(),
            expected_status: default_expected_status(),
            headers: Vec::new(),
            interval_s: default_healthcheck_interval_s(),
        }
    }
}

impl HealthcheckConfig {
    fn validate(&self) -> anyhow::Result<()> {
        if self.workers == 0 {
            bail!("healthcheck.workers must be > 0");
        }
        if self.timeout_s == 0 {
            bail!("healthcheck.timeout_s must be > 0");
        }
        for header in &self.headers {
            if !header.contains(':') {
                bail!("healthcheck header '{header}' is not in 'Name: Value' form");
            }
        }
        Ok(())
    }

    /// Parsed `Name: Value` header pairs, trimming surrounding whitespace on each side.
    pub fn parsed_headers(&self) -> Vec<(String, String)> {
        self.headers
            .iter()
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
            .collect()
    }
}

fn default_healthcheck_timeout_s() -> u64 {
    10
}

fn default_healthcheck_workers() -> usize {
    5
}

fn default_healthcheck_url() -> String {
    "http://www.gstatic.com/generate_204".to_string()
}

fn default_expected_status() -> u16 {
    204
}

fn default_healthcheck_interval_s() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub address: String,
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_scheme() -> String {
    "http".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml(listen: &str) -> String {
        format!(
            r#"[server]
listen = ["{listen}"]

[[upstream]]
address = "127.0.0.1:9000"
scheme = "http"
"#
        )
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let cfg = AppConfig::from_toml_str(&minimal_toml("127.0.0.1:8080")).unwrap();
        assert_eq!(cfg.upstreams.len(), 1);
        assert_eq!(cfg.rotation.timeout_s, 30);
        assert_eq!(cfg.rotation.retries, 1);
        assert!(!cfg.rate_limit.enabled);
    }

    #[test]
    fn rejects_empty_listen() {
        let toml = r#"
[server]
listen = []

[[upstream]]
address = "127.0.0.1:9000"
"#;
        let err = AppConfig::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("server.listen"));
    }

    #[test]
    fn rejects_config_with_no_upstreams_and_no_path() {
        let toml = r#"
[server]
listen = ["127.0.0.1:8080"]
"#;
        let err = AppConfig::from_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("upstream"));
    }

    #[test]
    fn rejects_out_of_range_timeout() {
        let mut toml = minimal_toml("127.0.0.1:8080");
        toml.push_str("\n[rotation]\ntimeout_s = 0\n");
        let err = AppConfig::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("timeout_s"));
    }

    #[test]
    fn rejects_out_of_range_retries() {
        let mut toml = minimal_toml("127.0.0.1:8080");
        toml.push_str("\n[rotation]\nretries = 99\n");
        let err = AppConfig::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("retries"));
    }

    #[test]
    fn rejects_invalid_healthcheck_header() {
        let mut toml = minimal_toml("127.0.0.1:8080");
        toml.push_str("\n[healthcheck]\nheaders = [\"not-a-header-pair\"]\n");
        let err = AppConfig::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("healthcheck header"));
    }
}
