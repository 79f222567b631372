//! Core domain types for lanwarden scan results.
//!
//! These records are produced by the scanning engine and persisted by
//! result sinks: network ranges, devices, port findings, security findings,
//! and the scan runs they all correlate against.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ScanError;

/// Namespace UUID for deterministic device IDs.
const DEVICE_NS: Uuid = Uuid::from_bytes([
    0x3f, 0x1c, 0x9a, 0x52, 0x7e, 0x04, 0x4b, 0x8d, 0x9c, 0x61, 0x2a, 0xd7, 0x0e, 0x55, 0xb3, 0x19,
]);

// ── Network Ranges ────────────────────────────────────────────────

/// Where a network range came from.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum RangeOrigin {
    /// Derived from a local interface at scan start.
    AutoDetected,
    /// Supplied by the admin/configuration layer.
    #[default]
    Configured,
}

/// A CIDR block the engine may scan.
///
/// The CIDR is kept as the raw configured string so that invalid entries can
/// be represented and rejected by the resolver rather than at load time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NetworkRange {
    pub cidr: String,
    pub origin: RangeOrigin,
    pub enabled: bool,
    pub name: Option<String>,
}

impl NetworkRange {
    pub fn configured(cidr: impl Into<String>) -> Self {
        Self {
            cidr: cidr.into(),
            origin: RangeOrigin::Configured,
            enabled: true,
            name: None,
        }
    }

    pub fn auto_detected(net: IpNet) -> Self {
        Self {
            cidr: net.trunc().to_string(),
            origin: RangeOrigin::AutoDetected,
            enabled: true,
            name: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Parse the CIDR. A bare address is accepted as a single-host range.
    pub fn network(&self) -> Result<IpNet, ScanError> {
        parse_cidr(&self.cidr)
    }

    /// Canonical key for this range (network form of the CIDR).
    pub fn key(&self) -> Result<String, ScanError> {
        range_key(&self.cidr)
    }
}

/// Parse a CIDR string, accepting a bare IP address as a host route.
pub fn parse_cidr(cidr: &str) -> Result<IpNet, ScanError> {
    let trimmed = cidr.trim();
    if let Ok(net) = trimmed.parse::<IpNet>() {
        return Ok(net);
    }
    trimmed
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| ScanError::Configuration(format!("invalid CIDR: {cidr:?}")))
}

/// Canonical range key: `192.168.2.1/30` and `192.168.2.0/30` map to the
/// same key `192.168.2.0/30`.
pub fn range_key(cidr: &str) -> Result<String, ScanError> {
    parse_cidr(cidr).map(|net| net.trunc().to_string())
}

// ── Identifiers ───────────────────────────────────────────────────

/// Unique identifier for a scan run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ScanRunId(pub Uuid);

impl ScanRunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ScanRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScanRunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ScanRunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identifier of a device, derived from (range key, ip) so that
/// re-discovery of the same host maps to the same record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub Uuid);

impl DeviceId {
    pub fn for_host(range_key: &str, ip: IpAddr) -> Self {
        Self(Uuid::new_v5(
            &DEVICE_NS,
            format!("{range_key}:device:{ip}").as_bytes(),
        ))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Devices ───────────────────────────────────────────────────────

/// Inferred device category.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Router,
    Server,
    Endpoint,
    Printer,
    #[default]
    Unknown,
}

impl DeviceType {
    pub fn is_known(&self) -> bool {
        !matches!(self, DeviceType::Unknown)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Router => "router",
            DeviceType::Server => "server",
            DeviceType::Endpoint => "endpoint",
            DeviceType::Printer => "printer",
            DeviceType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
        }
    }
}

/// A host discovered inside a network range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    /// Range key of the network this device belongs to.
    pub range: String,
    pub ip: IpAddr,
    pub mac_address: Option<String>,
    pub vendor: Option<String>,
    pub device_type: DeviceType,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub status: DeviceStatus,
    /// The scan run that last observed this device.
    pub last_scan_id: ScanRunId,
}

impl Device {
    /// Fold a previously persisted record of the same device into a freshly
    /// observed one. Known attributes are never downgraded and `last_seen`
    /// never moves backwards.
    pub fn refine_from(&mut self, previous: &Device) {
        self.first_seen = self.first_seen.min(previous.first_seen);
        self.last_seen = self.last_seen.max(previous.last_seen);
        if self.mac_address.is_none() {
            self.mac_address = previous.mac_address.clone();
        }
        if self.vendor.is_none() {
            self.vendor = previous.vendor.clone();
        }
        if !self.device_type.is_known() {
            self.device_type = previous.device_type;
        }
    }
}

// ── Ports ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Open,
    Closed,
    Filtered,
}

impl PortState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PortState::Open => "open",
            PortState::Closed => "closed",
            PortState::Filtered => "filtered",
        }
    }
}

/// The observed state of one port on one device in one scan run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortFinding {
    pub device_id: DeviceId,
    pub scan_run_id: ScanRunId,
    pub port: u16,
    pub protocol: Protocol,
    pub state: PortState,
    pub banner_hint: Option<String>,
}

impl PortFinding {
    pub fn is_open(&self) -> bool {
        self.state == PortState::Open
    }
}

// ── Security Findings ─────────────────────────────────────────────

/// Finding severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FindingCategory {
    InsecureProtocol,
    ExposedAdminInterface,
    RemoteAccess,
    ExposedDatabase,
    FileSharing,
    PrinterService,
}

/// A security-relevant observation about a device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SecurityFinding {
    pub device_id: DeviceId,
    pub scan_run_id: ScanRunId,
    pub severity: Severity,
    pub category: FindingCategory,
    pub description: String,
    /// Ports that triggered this finding.
    pub ports: Vec<u16>,
    pub discovered_at: DateTime<Utc>,
}

// ── Scan Runs ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ScanStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
            ScanStatus::Cancelled => "cancelled",
        }
    }
}

/// One scan cycle over one network range.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanRun {
    pub id: ScanRunId,
    /// Range key of the scanned network.
    pub range: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ScanStatus,
    pub devices_found: u32,
    /// Hosts that reached a liveness verdict; excludes hosts cut off by the
    /// deadline or by cancellation.
    pub hosts_probed: u32,
    /// Human-readable reason for failed or cancelled runs.
    pub failure_reason: Option<String>,
}

impl ScanRun {
    pub fn start(range: impl Into<String>) -> Self {
        Self {
            id: ScanRunId::new(),
            range: range.into(),
            started_at: Utc::now(),
            completed_at: None,
            status: ScanStatus::Running,
            devices_found: 0,
            hosts_probed: 0,
            failure_reason: None,
        }
    }

    pub fn complete(&mut self, devices_found: u32, hosts_probed: u32) {
        self.devices_found = devices_found;
        self.hosts_probed = hosts_probed;
        self.finish(ScanStatus::Completed, None);
    }

    pub fn fail(&mut self, reason: impl Into<String>) {
        self.finish(ScanStatus::Failed, Some(reason.into()));
    }

    pub fn cancel(&mut self) {
        self.finish(ScanStatus::Cancelled, Some("cancelled by request".to_string()));
    }

    fn finish(&mut self, status: ScanStatus, reason: Option<String>) {
        self.status = status;
        self.failure_reason = reason;
        self.completed_at = Some(Utc::now());
    }
}

/// Coordinator state machine for a single scan run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScanPhase {
    Idle,
    Resolving,
    Probing,
    Classifying,
    Persisting,
    Completed,
    Failed,
    Cancelled,
}

impl ScanPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanPhase::Completed | ScanPhase::Failed | ScanPhase::Cancelled
        )
    }

    /// Cancellation is only honoured before classification starts.
    pub fn is_cancellable(&self) -> bool {
        matches!(self, ScanPhase::Resolving | ScanPhase::Probing)
    }

    pub fn can_advance_to(&self, next: ScanPhase) -> bool {
        use ScanPhase::*;
        match (*self, next) {
            (Idle, Resolving)
            | (Resolving, Probing)
            | (Probing, Classifying)
            | (Classifying, Persisting)
            | (Persisting, Completed) => true,
            (Resolving | Probing, Cancelled) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}
