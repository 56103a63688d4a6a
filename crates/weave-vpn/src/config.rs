//! Run Configuration
//!
//! Everything one orchestrator run needs: exit bind address, upstream
//! endpoint, license, storage location and the optional relay, scan and
//! tun sections. Loaded from TOML or JSON, then overridden from the CLI.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default upstream endpoint
pub const DEFAULT_ENDPOINT: &str = "engage.cloudflareclient.com:2408";

/// Options for a single orchestrator run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Address the exit surface listens on
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Upstream endpoint (`host:port`)
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// License token bound to both identities
    #[serde(default)]
    pub license: String,
    /// Directory holding the `primary` and `secondary` identity slots
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,
    /// Run the inner tunnel inside the outer one
    #[serde(default)]
    pub double_hop: bool,
    /// Circumvention relay exit
    #[serde(default)]
    pub relay: Option<RelayOptions>,
    /// Endpoint scanning
    #[serde(default)]
    pub scan: Option<ScanOptions>,
    /// Expose the final hop as an OS-level interface
    #[serde(default)]
    pub tun: Option<TunOptions>,
    /// Upper bound for the connectivity probe
    #[serde(default = "default_verify_timeout_ms")]
    pub verify_timeout_ms: u64,
    /// Peer written into freshly created profiles
    #[serde(default)]
    pub peer: PeerTemplate,
}

/// Relay exit parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayOptions {
    /// Country selector handed to the relay network
    #[serde(default)]
    pub country: String,
    /// Relay client executable
    #[serde(default = "default_relay_command")]
    pub command: String,
    /// Arguments; `{upstream}`, `{listen}` and `{country}` are substituted
    #[serde(default = "default_relay_args")]
    pub args: Vec<String>,
}

impl RelayOptions {
    /// Relay towards `country` using the default client invocation
    pub fn new(country: impl Into<String>) -> Self {
        Self {
            country: country.into(),
            command: default_relay_command(),
            args: default_relay_args(),
        }
    }
}

/// Scan parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanOptions {
    /// Candidate endpoints in preference order
    #[serde(default = "default_scan_candidates")]
    pub candidates: Vec<String>,
    /// Keep at most this many reachable candidates
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Per-candidate timeout
    #[serde(default = "default_scan_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            candidates: default_scan_candidates(),
            max_results: default_max_results(),
            timeout_ms: default_scan_timeout_ms(),
        }
    }
}

impl ScanOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// OS-level interface parameters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunOptions {
    /// Firewall mark applied to the tunnel's own packets
    #[serde(default)]
    pub fwmark: u32,
}

/// Peer section written into a profile when an identity is created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerTemplate {
    /// Server public key (base64)
    pub public_key: String,
    /// Endpoint recorded in the profile; replaced per hop at build time
    pub endpoint: String,
    /// Interface addresses (CIDR)
    pub addresses: Vec<String>,
    /// Allowed IPs (CIDR)
    pub allowed_ips: Vec<String>,
    /// DNS servers
    pub dns: Vec<String>,
}

impl Default for PeerTemplate {
    fn default() -> Self {
        Self {
            public_key: "bmXOC+F1FxEMF9dyiK2H5/1SUtzH0JuVo51h2wPfgyo=".to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            addresses: vec!["172.16.0.2/32".to_string()],
            allowed_ips: vec!["0.0.0.0/0".to_string(), "::/0".to_string()],
            dns: vec!["1.1.1.1".to_string()],
        }
    }
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8086))
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("./stuff")
}

fn default_verify_timeout_ms() -> u64 {
    5_000
}

fn default_relay_command() -> String {
    "relay-client".to_string()
}

fn default_relay_args() -> Vec<String> {
    vec![
        "--upstream-proxy".to_string(),
        "socks5://{upstream}".to_string(),
        "--listen".to_string(),
        "{listen}".to_string(),
        "--country".to_string(),
        "{country}".to_string(),
    ]
}

fn default_scan_candidates() -> Vec<String> {
    [
        "162.159.192.1:2408",
        "162.159.193.1:2408",
        "162.159.195.1:2408",
        "188.114.96.1:2408",
        "188.114.97.1:2408",
        "188.114.98.1:2408",
        "188.114.99.1:2408",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_max_results() -> usize {
    10
}

fn default_scan_timeout_ms() -> u64 {
    1_000
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            endpoint: default_endpoint(),
            license: String::new(),
            storage_dir: default_storage_dir(),
            double_hop: false,
            relay: None,
            scan: None,
            tun: None,
            verify_timeout_ms: default_verify_timeout_ms(),
            peer: PeerTemplate::default(),
        }
    }
}

impl RunOptions {
    /// Load from a file, picking the format by extension
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e.to_string()))?;

        match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
            "toml" => Self::from_toml(&content),
            "json" => Self::from_json(&content),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content)
            .map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content)
            .map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("can't use relay and double-hop at the same time")]
    RelayWithDoubleHop,

    #[error("must provide a country for relay mode")]
    MissingRelayCountry,

    #[error("can't use relay and tun at the same time")]
    RelayWithTun,

    #[error("failed to read {0}: {1}")]
    Io(String, String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("unsupported config format: {0:?}")]
    UnsupportedFormat(String),
}
