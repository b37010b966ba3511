// src/config/models.rs
use anyhow::{bail, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Top-level configuration. Field names mirror the config file keys.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Plain-HTTP listener port. `null` disables the HTTP listener.
    #[serde(default = "default_http_port")]
    pub port: Option<u16>,
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    #[serde(default)]
    pub enable_https: bool,
    #[serde(default)]
    pub ssl_key_path: Option<PathBuf>,
    #[serde(default)]
    pub ssl_cert_path: Option<PathBuf>,

    /// Tokio worker threads; 0 uses the runtime default.
    #[serde(default)]
    pub num_workers: usize,

    pub servers: Vec<ServerEntry>,

    #[serde(default)]
    pub load_balancing_algorithm: Algorithm,

    #[serde(default)]
    pub sticky_session: StickySessionConfig,

    #[serde(default)]
    pub health_check: HealthCheckConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default = "default_proxy_timeout_ms")]
    pub proxy_timeout_ms: u64,
    #[serde(default = "default_proxy_connect_timeout_ms")]
    pub proxy_connect_timeout_ms: u64,

    #[serde(default = "default_reload_signal")]
    pub dynamic_config_reload_signal: String,
}

fn default_http_port() -> Option<u16> {
    Some(8080)
}

fn default_https_port() -> u16 {
    8443
}

fn default_proxy_timeout_ms() -> u64 {
    30_000
}

fn default_proxy_connect_timeout_ms() -> u64 {
    5_000
}

fn default_reload_signal() -> String {
    "SIGHUP".to_string()
}

impl Config {
    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy_timeout_ms)
    }

    pub fn proxy_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.proxy_connect_timeout_ms)
    }

    /// Startup validation. TLS-material problems are only fatal when HTTPS is
    /// the sole listener; with an HTTP listener present the HTTPS side is
    /// dropped later with a warning.
    pub fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            bail!("configuration contains no backend servers");
        }

        let mut seen = HashSet::new();
        for entry in &self.servers {
            if entry.weight == 0 {
                bail!("backend {} has weight 0; weights must be >= 1", entry.id());
            }
            if !seen.insert(entry.id()) {
                bail!("duplicate backend {} in server list", entry.id());
            }
        }

        if self.port.is_none() && !self.enable_https {
            bail!("no listeners configured: port is null and HTTPS is disabled");
        }

        if self.health_check.enabled && self.health_check.interval_ms == 0 {
            bail!("healthCheck.intervalMs must be positive");
        }
        if self.proxy_timeout_ms == 0 {
            bail!("proxyTimeoutMs must be positive");
        }

        if self.enable_https
            && self.port.is_none()
            && (self.ssl_key_path.is_none() || self.ssl_cert_path.is_none())
        {
            bail!("HTTPS is the only listener but sslKeyPath/sslCertPath are not set");
        }

        Ok(())
    }
}

/// One backend entry as written in the config file.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerEntry {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl ServerEntry {
    /// Stable identity, also used as the sticky-cookie value.
    pub fn id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Backend selection policy. Unknown names warn and fall back to the
/// weighted round-robin default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Algorithm {
    #[serde(rename = "ROUND_ROBIN")]
    RoundRobin,
    #[serde(rename = "RANDOM")]
    Random,
    #[serde(rename = "WEIGHTED_ROUND_ROBIN")]
    WeightedRoundRobin,
    #[serde(rename = "WEIGHTED_RANDOM")]
    WeightedRandom,
}

impl Algorithm {
    pub fn is_weighted(&self) -> bool {
        matches!(self, Algorithm::WeightedRoundRobin | Algorithm::WeightedRandom)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::RoundRobin => "ROUND_ROBIN",
            Algorithm::Random => "RANDOM",
            Algorithm::WeightedRoundRobin => "WEIGHTED_ROUND_ROBIN",
            Algorithm::WeightedRandom => "WEIGHTED_RANDOM",
        }
    }
}

impl Default for Algorithm {
    fn default() -> Self {
        Algorithm::WeightedRoundRobin
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ROUND_ROBIN" => Ok(Algorithm::RoundRobin),
            "RANDOM" => Ok(Algorithm::Random),
            "WEIGHTED_ROUND_ROBIN" => Ok(Algorithm::WeightedRoundRobin),
            "WEIGHTED_RANDOM" => Ok(Algorithm::WeightedRandom),
            _ => Err(()),
        }
    }
}

impl<'de> Deserialize<'de> for Algorithm {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(raw.parse().unwrap_or_else(|_| {
            tracing::warn!(
                algorithm = %raw,
                "unknown loadBalancingAlgorithm, defaulting to WEIGHTED_ROUND_ROBIN"
            );
            Algorithm::default()
        }))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StickySessionConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    #[serde(default)]
    pub cookie_options: CookieOptions,
}

fn default_cookie_name() -> String {
    "lb_sticky_session".to_string()
}

impl Default for StickySessionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cookie_name: default_cookie_name(),
            cookie_options: CookieOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieOptions {
    #[serde(default = "default_true")]
    pub http_only: bool,
    #[serde(default = "default_cookie_path")]
    pub path: String,
    /// Max-Age in seconds.
    #[serde(default = "default_max_age")]
    pub max_age: u64,
    #[serde(default)]
    pub secure: bool,
}

fn default_true() -> bool {
    true
}

fn default_cookie_path() -> String {
    "/".to_string()
}

fn default_max_age() -> u64 {
    3600
}

impl Default for CookieOptions {
    fn default() -> Self {
        Self {
            http_only: true,
            path: default_cookie_path(),
            max_age: default_max_age(),
            secure: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_probe_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_probe_path")]
    pub path: String,
    #[serde(default = "default_probe_method")]
    pub method: String,
    #[serde(default = "default_expect_status")]
    pub expect_status: u16,
    #[serde(default)]
    pub expect_body_substring: Option<String>,
}

fn default_probe_interval_ms() -> u64 {
    10_000
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}

fn default_probe_path() -> String {
    "/health".to_string()
}

fn default_probe_method() -> String {
    "GET".to_string()
}

fn default_expect_status() -> u16 {
    200
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_probe_interval_ms(),
            timeout_ms: default_probe_timeout_ms(),
            path: default_probe_path(),
            method: default_probe_method(),
            expect_status: default_expect_status(),
            expect_body_substring: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_metrics_endpoint")]
    pub endpoint: String,
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_metrics_endpoint() -> String {
    "/metrics".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
            endpoint: default_metrics_endpoint(),
        }
    }
}
