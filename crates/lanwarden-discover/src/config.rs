//! Configuration for the lanwarden-discover scanning engine.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use serde::Deserialize;

use lanwarden_core::{NetworkRange, ScanError};
use lanwarden_store::GraphConfig;

use crate::error::{DiscoverError, Result};

/// Top-level discover configuration.
///
/// Loaded from the `[discover]` section of `lanwarden.toml`, overridden by
/// `LANWARDEN_DISCOVER__` environment variables (see [`load_discover_config`]).
#[derive(Debug, Clone, Deserialize)]
pub struct DiscoverConfig {
    /// Configured network ranges with their scan schedule.
    #[serde(default)]
    pub ranges: Vec<RangeSchedule>,

    /// Also scan the private IPv4 networks of local interfaces.
    #[serde(default = "default_true")]
    pub auto_detect: bool,

    /// Liveness probe timeout per address.
    #[serde(default = "default_host_timeout_ms")]
    pub host_timeout_ms: u64,

    /// TCP connect timeout per port.
    #[serde(default = "default_port_timeout_ms")]
    pub port_timeout_ms: u64,

    /// Upper bound on concurrently probed hosts within one scan.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Concurrent port connects per host.
    #[serde(default = "default_port_concurrency")]
    pub port_concurrency: usize,

    /// Wall-clock budget for the probing phase of one scan.
    #[serde(default = "default_scan_deadline_secs")]
    pub scan_deadline_secs: u64,

    /// TCP ports checked on every live host.
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,

    /// Ports used by the TCP-connect liveness fallback.
    #[serde(default = "default_liveness_ports")]
    pub liveness_ports: Vec<u16>,

    /// Read a greeting (or HTTP response) from open ports.
    #[serde(default = "default_true")]
    pub grab_banners: bool,

    /// Ranges with more addresses than this are refused.
    #[serde(default = "default_max_range_addresses")]
    pub max_range_addresses: u64,

    /// Addresses known to be gateways (classified as routers).
    #[serde(default)]
    pub gateways: Vec<IpAddr>,

    /// Extra OUI prefixes (`"00:1b:54"`) mapped to vendor names.
    #[serde(default)]
    pub extra_oui: HashMap<String, String>,

    /// Re-scan interval for ranges without their own interval.
    #[serde(default = "default_interval")]
    pub default_interval_secs: u64,

    /// Maximum scheduled scans running at the same time.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_scans: usize,

    /// Result sink backend.
    #[serde(default)]
    pub store: StoreBackend,
}

/// A configured range with its scan schedule.
#[derive(Debug, Clone, Deserialize)]
pub struct RangeSchedule {
    /// CIDR target (e.g., "192.168.2.0/24").
    pub cidr: String,

    /// Human-readable name for this range.
    pub name: Option<String>,

    /// Scan interval in seconds; falls back to `default_interval_secs`.
    pub interval_secs: Option<u64>,

    /// Whether this range is enabled for scanning.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl RangeSchedule {
    pub fn to_network_range(&self) -> NetworkRange {
        let mut range = NetworkRange::configured(self.cidr.clone());
        range.enabled = self.enabled;
        range.name = self.name.clone();
        range
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Neo4j,
}

fn default_true() -> bool {
    true
}

fn default_host_timeout_ms() -> u64 {
    1000
}

fn default_port_timeout_ms() -> u64 {
    500
}

fn default_max_concurrency() -> usize {
    50
}

fn default_port_concurrency() -> usize {
    16
}

fn default_scan_deadline_secs() -> u64 {
    300
}

fn default_ports() -> Vec<u16> {
    vec![
        21, 22, 23, 53, 80, 135, 139, 443, 445, 515, 631, 1433, 2375, 3306, 3389, 5432, 5900,
        5901, 6379, 8000, 8080, 8443, 9100, 9200, 27017, 62078,
    ]
}

fn default_liveness_ports() -> Vec<u16> {
    vec![80, 443, 22, 445, 139]
}

fn default_max_range_addresses() -> u64 {
    65_536
}

fn default_interval() -> u64 {
    3600
}

fn default_max_concurrent() -> usize {
    4
}

impl Default for DiscoverConfig {
    fn default() -> Self {
        Self {
            ranges: Vec::new(),
            auto_detect: default_true(),
            host_timeout_ms: default_host_timeout_ms(),
            port_timeout_ms: default_port_timeout_ms(),
            max_concurrency: default_max_concurrency(),
            port_concurrency: default_port_concurrency(),
            scan_deadline_secs: default_scan_deadline_secs(),
            ports: default_ports(),
            liveness_ports: default_liveness_ports(),
            grab_banners: default_true(),
            max_range_addresses: default_max_range_addresses(),
            gateways: Vec::new(),
            extra_oui: HashMap::new(),
            default_interval_secs: default_interval(),
            max_concurrent_scans: default_max_concurrent(),
            store: StoreBackend::default(),
        }
    }
}

impl DiscoverConfig {
    /// Reject settings that would make every scan fail or fan out unbounded.
    pub fn validate(&self) -> std::result::Result<(), ScanError> {
        if self.ports.is_empty() {
            return Err(ScanError::Configuration("port list is empty".to_string()));
        }
        if self.ports.contains(&0) || self.liveness_ports.contains(&0) {
            return Err(ScanError::Configuration(
                "port 0 is not a valid target".to_string(),
            ));
        }
        if self.liveness_ports.is_empty() {
            return Err(ScanError::Configuration(
                "liveness port list is empty".to_string(),
            ));
        }
        if self.max_concurrency == 0 || self.port_concurrency == 0 {
            return Err(ScanError::Configuration(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.max_concurrent_scans == 0 {
            return Err(ScanError::Configuration(
                "max_concurrent_scans must be at least 1".to_string(),
            ));
        }
        if self.host_timeout_ms == 0 || self.port_timeout_ms == 0 || self.scan_deadline_secs == 0 {
            return Err(ScanError::Configuration(
                "timeouts must be non-zero".to_string(),
            ));
        }
        if self.max_range_addresses == 0 {
            return Err(ScanError::Configuration(
                "max_range_addresses must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn host_timeout(&self) -> Duration {
        Duration::from_millis(self.host_timeout_ms)
    }

    pub fn port_timeout(&self) -> Duration {
        Duration::from_millis(self.port_timeout_ms)
    }

    pub fn scan_deadline(&self) -> Duration {
        Duration::from_secs(self.scan_deadline_secs)
    }

    /// Port list with duplicates removed, ascending.
    pub fn port_list(&self) -> Vec<u16> {
        let mut ports = self.ports.clone();
        ports.sort_unstable();
        ports.dedup();
        ports
    }

    pub fn configured_ranges(&self) -> Vec<NetworkRange> {
        self.ranges.iter().map(RangeSchedule::to_network_range).collect()
    }

    /// Interval for a range key, honouring per-range overrides.
    pub fn interval_for(&self, key: &str) -> Duration {
        let secs = self
            .ranges
            .iter()
            .find(|r| lanwarden_core::types::range_key(&r.cidr).ok().as_deref() == Some(key))
            .and_then(|r| r.interval_secs)
            .unwrap_or(self.default_interval_secs);
        Duration::from_secs(secs.max(1))
    }
}

/// Read `[discover]` from `{file_prefix}.toml` (optional) with environment
/// overrides layered on top: `LANWARDEN_DISCOVER__HOST_TIMEOUT_MS=2000` sets
/// `discover.host_timeout_ms`. Port lists take comma-separated values.
pub fn load_discover_config(file_prefix: &str) -> Result<DiscoverConfig> {
    let cfg = config::Config::builder()
        .add_source(config::File::with_name(file_prefix).required(false))
        .add_source(
            config::Environment::with_prefix("LANWARDEN")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("discover.ports")
                .with_list_parse_key("discover.liveness_ports"),
        )
        .build()
        .map_err(|e| DiscoverError::Config(e.to_string()))?;

    match cfg.get::<DiscoverConfig>("discover") {
        Ok(c) => Ok(c),
        Err(config::ConfigError::NotFound(_)) => Ok(DiscoverConfig::default()),
        Err(e) => Err(DiscoverError::Config(e.to_string())),
    }
}

/// Neo4j connection settings from `[neo4j]` or `LANWARDEN__NEO4J__*`.
pub fn load_graph_config(file_prefix: &str) -> GraphConfig {
    let cfg = config::Config::builder()
        .add_source(config::File::with_name(file_prefix).required(false))
        .add_source(
            config::Environment::with_prefix("LANWARDEN")
                .separator("__")
                .try_parsing(true),
        )
        .build();

    match cfg {
        Ok(c) => GraphConfig {
            uri: c
                .get_string("neo4j.uri")
                .unwrap_or_else(|_| "bolt://localhost:7687".to_string()),
            user: c
                .get_string("neo4j.user")
                .unwrap_or_else(|_| "neo4j".to_string()),
            password: c
                .get_string("neo4j.password")
                .unwrap_or_else(|_| "lanwarden-dev".to_string()),
            ..Default::default()
        },
        Err(_) => GraphConfig::default(),
    }
}
